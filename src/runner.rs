//! Activity execution against a single tab.
//!
//! The runner memoizes which tabs already carry the in-page capability so a
//! tab is prepared once per lifetime. The set is only an optimization: when a
//! tab reports the capability missing the runner prepares it again and retries
//! exactly once.

use crate::browser::{ActivityPayload, BrowserHost, InvokeOutcome, TabId};
use crate::error::{PulseError, Result};
use crate::rules::Rule;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Executes activities in tabs through a [`BrowserHost`].
pub struct ActivityRunner {
    browser: Arc<dyn BrowserHost>,
    prepared: Mutex<HashSet<TabId>>,
}

impl ActivityRunner {
    pub fn new(browser: Arc<dyn BrowserHost>) -> Self {
        Self {
            browser,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Run `rule`'s activity in `tab_id`.
    ///
    /// # Errors
    ///
    /// - [`PulseError::Injection`] when the tab cannot be prepared.
    /// - [`PulseError::Execution`] when the capability is still missing after
    ///   re-preparation.
    /// - Host errors from the invocation itself (tab closed, timeout).
    pub async fn run(&self, tab_id: TabId, rule: &Rule, timestamp: u64) -> Result<()> {
        let payload = ActivityPayload {
            rule: rule.clone(),
            timestamp,
        };

        self.ensure_prepared(tab_id).await?;
        match self.browser.invoke_activity(tab_id, &payload).await? {
            InvokeOutcome::Performed => return Ok(()),
            InvokeOutcome::CapabilityAbsent => {
                tracing::debug!(tab_id, "capability missing, preparing tab again");
                self.forget_tab(tab_id).await;
            }
        }

        self.ensure_prepared(tab_id).await?;
        match self.browser.invoke_activity(tab_id, &payload).await? {
            InvokeOutcome::Performed => Ok(()),
            InvokeOutcome::CapabilityAbsent => {
                self.forget_tab(tab_id).await;
                Err(PulseError::Execution(format!(
                    "tab {tab_id} has no activity capability after preparation"
                )))
            }
        }
    }

    async fn ensure_prepared(&self, tab_id: TabId) -> Result<()> {
        if self.prepared.lock().await.contains(&tab_id) {
            return Ok(());
        }

        match self.browser.prepare_tab(tab_id).await {
            Ok(()) => {
                self.prepared.lock().await.insert(tab_id);
                Ok(())
            }
            Err(e) => {
                self.prepared.lock().await.remove(&tab_id);
                Err(PulseError::Injection(format!(
                    "failed to prepare tab {tab_id}: {e}"
                )))
            }
        }
    }

    /// Drop the preparation record for a tab (closed or navigating).
    pub async fn forget_tab(&self, tab_id: TabId) {
        self.prepared.lock().await.remove(&tab_id);
    }

    /// Drop every preparation record.
    pub async fn forget_all(&self) {
        self.prepared.lock().await.clear();
    }

    /// Whether `tab_id` is currently recorded as prepared.
    pub async fn is_prepared(&self, tab_id: TabId) -> bool {
        self.prepared.lock().await.contains(&tab_id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::browser::Tab;
    use crate::rules::{Activity, Theme};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted invoke outcomes and counts preparations.
    struct ScriptedBrowser {
        prepares: AtomicUsize,
        invokes: AtomicUsize,
        fail_prepare: bool,
        outcomes: std::sync::Mutex<VecDeque<InvokeOutcome>>,
    }

    impl ScriptedBrowser {
        fn new(outcomes: Vec<InvokeOutcome>) -> Self {
            Self {
                prepares: AtomicUsize::new(0),
                invokes: AtomicUsize::new(0),
                fail_prepare: false,
                outcomes: std::sync::Mutex::new(outcomes.into()),
            }
        }
    }

    #[async_trait]
    impl BrowserHost for ScriptedBrowser {
        async fn query_tabs(&self) -> Result<Vec<Tab>> {
            Ok(Vec::new())
        }

        async fn prepare_tab(&self, _tab_id: TabId) -> Result<()> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                return Err(PulseError::Host("cannot access contents of url".to_owned()));
            }
            Ok(())
        }

        async fn invoke_activity(
            &self,
            _tab_id: TabId,
            _payload: &ActivityPayload,
        ) -> Result<InvokeOutcome> {
            self.invokes.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(InvokeOutcome::Performed))
        }

        async fn set_badge_text(&self, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn set_action_icon(&self, _theme: Theme) -> Result<()> {
            Ok(())
        }
    }

    fn rule() -> Rule {
        Rule::new("Docs", "docs.example.com", 5, Activity::Scroll)
    }

    #[tokio::test]
    async fn prepares_once_per_tab() {
        let browser = Arc::new(ScriptedBrowser::new(Vec::new()));
        let runner = ActivityRunner::new(browser.clone());

        runner.run(7, &rule(), 1).await.expect("first run");
        runner.run(7, &rule(), 2).await.expect("second run");

        assert_eq!(browser.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(browser.invokes.load(Ordering::SeqCst), 2);
        assert!(runner.is_prepared(7).await);
    }

    #[tokio::test]
    async fn capability_absent_triggers_one_re_preparation() {
        let browser = Arc::new(ScriptedBrowser::new(vec![InvokeOutcome::CapabilityAbsent]));
        let runner = ActivityRunner::new(browser.clone());

        runner.run(3, &rule(), 1).await.expect("retry succeeds");

        assert_eq!(browser.prepares.load(Ordering::SeqCst), 2);
        assert_eq!(browser.invokes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capability_absent_twice_is_execution_error() {
        let browser = Arc::new(ScriptedBrowser::new(vec![
            InvokeOutcome::CapabilityAbsent,
            InvokeOutcome::CapabilityAbsent,
        ]));
        let runner = ActivityRunner::new(browser.clone());

        let err = runner.run(3, &rule(), 1).await.expect_err("should fail");
        assert!(matches!(err, PulseError::Execution(_)));
        assert_eq!(browser.prepares.load(Ordering::SeqCst), 2);
        assert!(!runner.is_prepared(3).await);
    }

    #[tokio::test]
    async fn failed_preparation_is_injection_error() {
        let mut scripted = ScriptedBrowser::new(Vec::new());
        scripted.fail_prepare = true;
        let browser = Arc::new(scripted);
        let runner = ActivityRunner::new(browser.clone());

        let err = runner.run(4, &rule(), 1).await.expect_err("should fail");
        assert!(matches!(err, PulseError::Injection(_)));
        assert_eq!(browser.invokes.load(Ordering::SeqCst), 0);
        assert!(!runner.is_prepared(4).await);
    }

    #[tokio::test]
    async fn forget_tab_forces_new_preparation() {
        let browser = Arc::new(ScriptedBrowser::new(Vec::new()));
        let runner = ActivityRunner::new(browser.clone());

        runner.run(5, &rule(), 1).await.expect("run");
        runner.forget_tab(5).await;
        runner.run(5, &rule(), 2).await.expect("run");
        runner.forget_all().await;
        runner.run(5, &rule(), 3).await.expect("run");

        assert_eq!(browser.prepares.load(Ordering::SeqCst), 3);
    }
}
