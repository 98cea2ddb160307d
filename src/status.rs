//! Last observed engine state and its change notifications.

use crate::error::Result;
use crate::rules::Rule;
use crate::scheduler::clock::Clock;
use crate::store::LocalStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Global switch is off.
pub const REASON_PAUSED: &str = "paused";
/// No enabled rules.
pub const REASON_NO_RULES: &str = "no-rules";
/// No open tab matches any enabled rule.
pub const REASON_NO_MATCH: &str = "no-match";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Active,
    Inactive,
    Error,
}

/// Single current status value shown by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: StatusState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<u64>,
    /// Epoch ms of the write. Filled by [`StatusReporter::write`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl StatusSnapshot {
    fn empty(state: StatusState) -> Self {
        Self {
            state,
            reason: None,
            rule_id: None,
            rule_name: None,
            url: None,
            last_run_at: None,
            timestamp: None,
        }
    }

    pub fn inactive(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_owned()),
            ..Self::empty(StatusState::Inactive)
        }
    }

    /// A rule is keeping `url` alive; `last_run_at` is its latest execution.
    pub fn active(rule: &Rule, url: &str, last_run_at: Option<u64>) -> Self {
        Self {
            rule_id: Some(rule.id.clone()),
            rule_name: Some(rule.name.clone()),
            url: Some(url.to_owned()),
            last_run_at,
            ..Self::empty(StatusState::Active)
        }
    }

    /// Failure not tied to a specific rule.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::empty(StatusState::Error)
        }
    }

    /// Failure while running `rule` against `url`.
    pub fn rule_error(rule: &Rule, url: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            rule_id: Some(rule.id.clone()),
            rule_name: Some(rule.name.clone()),
            url: Some(url.to_owned()),
            ..Self::empty(StatusState::Error)
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Persists the current status and broadcasts every write.
pub struct StatusReporter {
    local: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    tx: broadcast::Sender<StatusSnapshot>,
}

impl StatusReporter {
    pub fn new(local: Arc<LocalStore>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { local, clock, tx }
    }

    /// Persist `snapshot` as the current status and notify subscribers.
    ///
    /// Returns the stored value, with its timestamp filled in.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be written. Subscribers
    /// are not notified in that case.
    pub async fn write(&self, mut snapshot: StatusSnapshot) -> Result<StatusSnapshot> {
        if snapshot.timestamp.is_none() {
            snapshot.timestamp = Some(self.clock.now_millis());
        }
        self.local.write_status(snapshot.clone()).await?;
        // No subscribers is fine.
        let _ = self.tx.send(snapshot.clone());
        Ok(snapshot)
    }

    /// Last written status, if any.
    pub async fn current(&self) -> Option<StatusSnapshot> {
        self.local.last_status().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}
