//! Browser-side operations the engine depends on.
//!
//! The engine never talks to a browser directly. Everything it needs from the
//! tab world goes through [`BrowserHost`]; the production implementation is
//! [`crate::host::remote::RemoteBrowser`], which forwards each operation as a
//! call over the host bridge.

use crate::error::Result;
use crate::rules::{Rule, Theme};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Browser tab identifier.
pub type TabId = i64;

/// A tab as reported by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    /// Missing for tabs the extension cannot read (e.g. without host permission).
    #[serde(default)]
    pub url: Option<String>,
}

impl Tab {
    pub fn new(id: TabId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: Some(url.into()),
        }
    }

    /// The URL when it is eligible for activities.
    #[must_use]
    pub fn http_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|url| crate::matcher::is_http_url(url))
    }
}

/// An http(s) tab considered during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabCandidate {
    pub tab_id: TabId,
    pub url: String,
}

impl TabCandidate {
    /// Keep the http(s) tabs of a tab list.
    pub fn from_tabs(tabs: Vec<Tab>) -> Vec<Self> {
        tabs.into_iter()
            .filter_map(|tab| {
                let url = tab.http_url()?.to_owned();
                Some(Self {
                    tab_id: tab.id,
                    url,
                })
            })
            .collect()
    }
}

/// Message delivered to the in-page capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub rule: Rule,
    /// Epoch milliseconds at invocation.
    pub timestamp: u64,
}

/// Result of invoking an activity inside a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The in-page capability ran the activity.
    Performed,
    /// The tab has no installed capability (fresh navigation, restarted page).
    CapabilityAbsent,
}

/// Operations the engine needs from the browser.
#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// Enumerate all open tabs.
    async fn query_tabs(&self) -> Result<Vec<Tab>>;

    /// Install the in-page activity capability into a tab.
    async fn prepare_tab(&self, tab_id: TabId) -> Result<()>;

    /// Ask the capability in a tab to perform an activity.
    async fn invoke_activity(&self, tab_id: TabId, payload: &ActivityPayload)
    -> Result<InvokeOutcome>;

    /// Set the toolbar badge text. An empty string clears it.
    async fn set_badge_text(&self, text: &str) -> Result<()>;

    /// Switch the toolbar icon set.
    async fn set_action_icon(&self, theme: Theme) -> Result<()>;
}
