//! Per-rule schedule view for the options UI.

use crate::browser::TabCandidate;
use crate::matcher;
use crate::rules::Rule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rule is only reported as due once it is this far past its next run, so
/// the UI does not show "due" while a tick is about to pick it up.
pub const DUE_GRACE_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOverview {
    pub rule_id: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<u64>,
    pub due_now: bool,
    pub matches_open_tab: bool,
}

impl RuleOverview {
    pub fn compute(
        rule: &Rule,
        last_run_at: Option<u64>,
        candidates: &[TabCandidate],
        now: u64,
    ) -> Self {
        let next_run_at = last_run_at.map(|last| last.saturating_add(rule.interval_ms()));
        let due_now = next_run_at.is_some_and(|next| now >= next.saturating_add(DUE_GRACE_MS));
        let matches_open_tab = !rule.pattern.trim().is_empty()
            && candidates
                .iter()
                .any(|c| matcher::matches(&c.url, &rule.pattern));

        Self {
            rule_id: rule.id.clone(),
            enabled: rule.enabled,
            last_run_at,
            next_run_at,
            due_now,
            matches_open_tab,
        }
    }
}

/// Overview of every rule, in stored order.
pub fn build_overview(
    rules: &[Rule],
    executions: &BTreeMap<String, u64>,
    candidates: &[TabCandidate],
    now: u64,
) -> Vec<RuleOverview> {
    rules
        .iter()
        .map(|rule| RuleOverview::compute(rule, executions.get(&rule.id).copied(), candidates, now))
        .collect()
}
