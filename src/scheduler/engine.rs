//! Heartbeat reconciliation loop.
//!
//! One tick reads the rule set, lists open tabs, pairs every enabled rule with
//! every matching http(s) tab and runs the rule's activity on the pairs that
//! are due. Execution records and the status snapshot are the only state a
//! tick leaves behind.

use crate::browser::{BrowserHost, TabCandidate};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::idle::{self, IdleOracle, IdleState};
use crate::matcher::{self, UrlPattern};
use crate::rules::Rule;
use crate::runner::ActivityRunner;
use crate::scheduler::clock::{Clock, format_epoch_millis};
use crate::status::{
    REASON_NO_MATCH, REASON_NO_RULES, REASON_PAUSED, StatusReporter, StatusSnapshot,
};
use crate::store::{LocalStore, SettingsStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

/// Badge text shown briefly after a successful pulse.
pub const PULSE_BADGE_TEXT: &str = "•";

/// Manual run error when the rule id is unknown.
pub const RULE_NOT_FOUND: &str = "Rule not found";
/// Manual run error when no open tab matches the rule.
pub const NO_MATCHING_TABS: &str = "No matching tabs";

const STATUS_CAPACITY: usize = 64;
const REPORT_CAPACITY: usize = 16;

/// Per-pair counters of a processed tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    /// (rule, tab) pairs considered.
    pub matched: usize,
    pub executed: usize,
    /// Due refresh pairs skipped because the user was active.
    pub skipped_idle: usize,
    pub not_due: usize,
    pub failed: usize,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TickReport {
    /// Global switch is off.
    Paused,
    /// No enabled rules.
    NoRules,
    /// Listing tabs failed; nothing ran.
    TabQueryFailed { reason: String },
    /// No open tab matches any enabled rule.
    NoMatch,
    /// At least one pair was processed.
    Processed(TickSummary),
}

/// Result of a manual "run now" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRuleOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRuleOutcome {
    #[must_use]
    pub fn executed(count: usize) -> Self {
        Self {
            success: true,
            executed_count: Some(count),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            executed_count: None,
            error: Some(error.into()),
        }
    }
}

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub settings: Arc<SettingsStore>,
    pub local: Arc<LocalStore>,
    pub browser: Arc<dyn BrowserHost>,
    pub idle: Arc<dyn IdleOracle>,
    pub clock: Arc<dyn Clock>,
}

/// The heartbeat engine. Shared as `Arc<HeartbeatEngine>`.
pub struct HeartbeatEngine {
    settings: Arc<SettingsStore>,
    local: Arc<LocalStore>,
    browser: Arc<dyn BrowserHost>,
    idle: Arc<dyn IdleOracle>,
    clock: Arc<dyn Clock>,
    runner: ActivityRunner,
    status: StatusReporter,
    idle_threshold_secs: u32,
    ack_duration: Duration,
    /// Held for the whole of a tick.
    tick_lock: Mutex<()>,
    /// Bumped on every badge flash so only the latest flash clears the badge.
    badge_generation: Arc<AtomicU64>,
    reports: broadcast::Sender<TickReport>,
}

impl HeartbeatEngine {
    pub fn new(deps: EngineDeps, config: &SchedulerConfig) -> Self {
        let runner = ActivityRunner::new(Arc::clone(&deps.browser));
        let status = StatusReporter::new(
            Arc::clone(&deps.local),
            Arc::clone(&deps.clock),
            STATUS_CAPACITY,
        );
        Self {
            settings: deps.settings,
            local: deps.local,
            browser: deps.browser,
            idle: deps.idle,
            clock: deps.clock,
            runner,
            status,
            idle_threshold_secs: config.idle_threshold_secs,
            ack_duration: config.ack_duration(),
            tick_lock: Mutex::new(()),
            badge_generation: Arc::new(AtomicU64::new(0)),
            reports: broadcast::channel(REPORT_CAPACITY).0,
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn browser(&self) -> &Arc<dyn BrowserHost> {
        &self.browser
    }

    pub fn runner(&self) -> &ActivityRunner {
        &self.runner
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reports of every finished tick, periodic or forced.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<TickReport> {
        self.reports.subscribe()
    }

    /// Run a periodic tick unless one is already in progress.
    ///
    /// Returns `None` when the tick was skipped.
    pub async fn try_tick(&self) -> Option<TickReport> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("tick already in progress, skipping");
            return None;
        };
        Some(self.finish(self.tick_locked().await))
    }

    /// Run a tick, waiting for any in-progress tick to finish first.
    pub async fn force_tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        self.finish(self.tick_locked().await)
    }

    fn finish(&self, report: TickReport) -> TickReport {
        debug!(?report, "tick finished");
        let _ = self.reports.send(report.clone());
        report
    }

    async fn tick_locked(&self) -> TickReport {
        let settings = self.settings.load().await;
        if !settings.global_enabled {
            self.report(StatusSnapshot::inactive(REASON_PAUSED)).await;
            return TickReport::Paused;
        }

        let rules: Vec<Rule> = settings.rules.into_iter().filter(|r| r.enabled).collect();
        if rules.is_empty() {
            self.report(StatusSnapshot::inactive(REASON_NO_RULES)).await;
            return TickReport::NoRules;
        }

        let candidates = match self.browser.query_tabs().await {
            Ok(tabs) => TabCandidate::from_tabs(tabs),
            Err(e) => {
                let reason = format!("tab query failed: {e}");
                warn!("{reason}");
                self.report(StatusSnapshot::error(reason.clone())).await;
                return TickReport::TabQueryFailed { reason };
            }
        };

        let pairs = match_pairs(&rules, &candidates);
        if pairs.is_empty() {
            self.report(StatusSnapshot::inactive(REASON_NO_MATCH)).await;
            return TickReport::NoMatch;
        }

        // One snapshot and one `now` for the whole tick: every pair of a rule
        // is judged against the same previous run.
        let executions = self.local.executions().await;
        let now = self.clock.now_millis();
        let mut summary = TickSummary {
            matched: pairs.len(),
            ..TickSummary::default()
        };

        for (rule, candidate) in pairs {
            let last_run = executions.get(&rule.id).copied();

            if !rule.is_due(last_run, now) {
                debug!(
                    rule_id = %rule.id,
                    tab_id = candidate.tab_id,
                    last_run = %last_run.map(format_epoch_millis).unwrap_or_default(),
                    "rule not due"
                );
                summary.not_due += 1;
                self.report(StatusSnapshot::active(rule, &candidate.url, last_run))
                    .await;
                continue;
            }

            if rule.activity.requires_idle() {
                let state = idle::query_or_active(self.idle.as_ref(), self.idle_threshold_secs).await;
                if state == IdleState::Active {
                    debug!(rule_id = %rule.id, tab_id = candidate.tab_id, "user active, skipping refresh");
                    summary.skipped_idle += 1;
                    continue;
                }
            }

            match self.runner.run(candidate.tab_id, rule, now).await {
                Ok(()) => {
                    summary.executed += 1;
                    info!(
                        rule_id = %rule.id,
                        tab_id = candidate.tab_id,
                        activity = %rule.activity,
                        "pulse executed"
                    );
                    if let Err(e) = self.local.record_execution(&rule.id, now).await {
                        warn!(rule_id = %rule.id, "failed to record execution: {e}");
                    }
                    self.report(StatusSnapshot::active(rule, &candidate.url, Some(now)))
                        .await;
                    self.flash_badge();
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(rule_id = %rule.id, tab_id = candidate.tab_id, "pulse failed: {e}");
                    self.report(StatusSnapshot::rule_error(rule, &candidate.url, e.to_string()))
                        .await;
                }
            }
        }

        TickReport::Processed(summary)
    }

    /// Run `rule_id` now against every matching tab, ignoring its interval
    /// and its enabled flag. Does not wait for or block periodic ticks.
    ///
    /// # Errors
    ///
    /// Returns the storage error when a successful run cannot be recorded.
    /// Tab and host failures are reported in the outcome instead.
    pub async fn run_rule(&self, rule_id: &str) -> Result<RunRuleOutcome> {
        let Some(rule) = self.settings.rule(rule_id).await else {
            return Ok(RunRuleOutcome::failed(RULE_NOT_FOUND));
        };

        let candidates = match self.browser.query_tabs().await {
            Ok(tabs) => TabCandidate::from_tabs(tabs),
            Err(e) => return Ok(RunRuleOutcome::failed(e.to_string())),
        };

        let matching: Vec<TabCandidate> = candidates
            .into_iter()
            .filter(|c| matcher::matches(&c.url, &rule.pattern))
            .collect();
        if matching.is_empty() {
            return Ok(RunRuleOutcome::failed(NO_MATCHING_TABS));
        }

        let mut executed = 0;
        let mut last_error = None;
        for candidate in &matching {
            let now = self.clock.now_millis();
            match self.runner.run(candidate.tab_id, &rule, now).await {
                Ok(()) => {
                    executed += 1;
                    if let Err(e) = self.local.record_execution(&rule.id, now).await {
                        error!(rule_id = %rule.id, "failed to record manual run: {e}");
                        return Err(e);
                    }
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, tab_id = candidate.tab_id, "manual run failed: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }

        if executed == 0 {
            return Ok(RunRuleOutcome::failed(
                last_error.unwrap_or_else(|| "Execution failed on all matching tabs".to_owned()),
            ));
        }
        info!(rule_id = %rule.id, executed, "manual run finished");
        Ok(RunRuleOutcome::executed(executed))
    }

    /// Write a status snapshot. Failures are logged; a tick never aborts on them.
    async fn report(&self, snapshot: StatusSnapshot) {
        if let Err(e) = self.status.write(snapshot).await {
            warn!("failed to write status: {e}");
        }
    }

    /// Show the pulse badge and clear it after the acknowledgment delay.
    fn flash_badge(&self) {
        let generation = self.badge_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.badge_generation);
        let browser = Arc::clone(&self.browser);
        let delay = self.ack_duration;

        tokio::spawn(async move {
            if let Err(e) = browser.set_badge_text(PULSE_BADGE_TEXT).await {
                debug!("badge update failed: {e}");
                return;
            }
            tokio::time::sleep(delay).await;
            if latest.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = browser.set_badge_text("").await {
                debug!("badge clear failed: {e}");
            }
        });
    }

    /// Apply the toolbar icon for the stored theme.
    ///
    /// # Errors
    ///
    /// Returns the host error when the icon cannot be set.
    pub async fn sync_action_icon(&self) -> Result<()> {
        let theme = self.settings.global().await.theme;
        self.browser.set_action_icon(theme).await
    }
}

/// Pair every schedulable rule with every candidate it matches, rule-major.
fn match_pairs<'a>(
    rules: &'a [Rule],
    candidates: &'a [TabCandidate],
) -> Vec<(&'a Rule, &'a TabCandidate)> {
    let mut pairs = Vec::new();
    for rule in rules.iter().filter(|r| r.is_schedulable()) {
        let pattern: UrlPattern = match matcher::compile(&rule.pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(rule_id = %rule.id, "{e}");
                continue;
            }
        };
        pairs.extend(
            candidates
                .iter()
                .filter(|c| pattern.is_match(&c.url))
                .map(|c| (rule, c)),
        );
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Activity;

    #[test]
    fn pairs_are_rule_major_and_skip_blank_patterns() {
        let mut blank = Rule::new("Blank", "x", 1, Activity::Ping);
        blank.pattern = String::new();
        let rules = vec![
            Rule::new("A", "a.test", 1, Activity::Ping),
            blank,
            Rule::new("Any", "*.test*", 1, Activity::Scroll),
        ];
        let candidates = vec![
            TabCandidate {
                tab_id: 1,
                url: "https://a.test/".to_owned(),
            },
            TabCandidate {
                tab_id: 2,
                url: "https://b.test/".to_owned(),
            },
        ];

        let pairs: Vec<(String, i64)> = match_pairs(&rules, &candidates)
            .into_iter()
            .map(|(rule, c)| (rule.name.clone(), c.tab_id))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("A".to_owned(), 1),
                ("Any".to_owned(), 1),
                ("Any".to_owned(), 2)
            ]
        );
    }

    #[test]
    fn uncompilable_rule_is_skipped_while_others_pair() {
        let oversized = format!("*{}", "a*".repeat(100_000));
        let rules = vec![
            Rule::new("Huge", &oversized, 1, Activity::Ping),
            Rule::new("Docs", "docs.test", 1, Activity::Ping),
        ];
        let candidates = vec![TabCandidate {
            tab_id: 3,
            url: "https://docs.test/aaaa".to_owned(),
        }];

        let pairs: Vec<(String, i64)> = match_pairs(&rules, &candidates)
            .into_iter()
            .map(|(rule, c)| (rule.name.clone(), c.tab_id))
            .collect();
        assert_eq!(pairs, vec![("Docs".to_owned(), 3)]);
    }

    #[test]
    fn tick_report_serializes_with_outcome_tag() {
        let value = serde_json::to_value(TickReport::Processed(TickSummary {
            matched: 2,
            executed: 1,
            ..TickSummary::default()
        }))
        .unwrap_or_default();
        assert_eq!(value["outcome"], "processed");
        assert_eq!(value["matched"], 2);
        assert_eq!(value["skippedIdle"], 0);

        let paused = serde_json::to_value(TickReport::Paused).unwrap_or_default();
        assert_eq!(paused, serde_json::json!({"outcome": "paused"}));
    }

    #[test]
    fn run_outcome_wire_shape() {
        assert_eq!(
            serde_json::to_value(RunRuleOutcome::executed(2)).unwrap_or_default(),
            serde_json::json!({"success": true, "executedCount": 2})
        );
        assert_eq!(
            serde_json::to_value(RunRuleOutcome::failed(NO_MATCHING_TABS)).unwrap_or_default(),
            serde_json::json!({"success": false, "error": "No matching tabs"})
        );
    }
}
