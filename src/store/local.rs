//! Local state store: execution records and the last status.

use crate::error::Result;
use crate::status::StatusSnapshot;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Contents of `local_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalState {
    /// Rule id to epoch ms of the last successful execution.
    #[serde(default, deserialize_with = "lenient_executions")]
    pub last_rule_executions: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<StatusSnapshot>,
}

/// Non-numeric entries are dropped; the rule is then simply due.
fn lenient_executions<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(rule_id, value)| value.as_u64().map(|at| (rule_id, at)))
        .collect())
}

/// Store for [`LocalState`], backed by `local_state.json`.
///
/// Every mutation is a read-modify-write under the store mutex, so concurrent
/// ticks and manual runs never lose each other's execution records.
pub struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalStore {
    /// Open the store at `path`.
    ///
    /// An unreadable document is discarded with a warning: it only holds
    /// derived state, and losing it makes every rule due once.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match super::read_document(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("discarding malformed local state: {e}");
                LocalState::default()
            }),
            None => LocalState::default(),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the execution record map.
    pub async fn executions(&self) -> BTreeMap<String, u64> {
        self.state.lock().await.last_rule_executions.clone()
    }

    pub async fn last_execution(&self, rule_id: &str) -> Option<u64> {
        self.state
            .lock()
            .await
            .last_rule_executions
            .get(rule_id)
            .copied()
    }

    async fn mutate(&self, f: impl FnOnce(&mut LocalState)) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        f(&mut next);
        if let Some(path) = self.path.as_deref() {
            super::write_json_atomic(path, &next)?;
        }
        *state = next;
        Ok(())
    }

    /// Record a successful execution of `rule_id` at `at` (epoch ms).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn record_execution(&self, rule_id: &str, at: u64) -> Result<()> {
        self.mutate(|state| {
            state.last_rule_executions.insert(rule_id.to_owned(), at);
        })
        .await
    }

    /// Drop the record of a deleted rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn remove_execution(&self, rule_id: &str) -> Result<()> {
        if self.last_execution(rule_id).await.is_none() {
            return Ok(());
        }
        self.mutate(|state| {
            state.last_rule_executions.remove(rule_id);
        })
        .await
    }

    /// Overwrite the last status.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn write_status(&self, status: StatusSnapshot) -> Result<()> {
        self.mutate(|state| state.last_status = Some(status)).await
    }

    pub async fn last_status(&self) -> Option<StatusSnapshot> {
        self.state.lock().await.last_status.clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::status::REASON_NO_MATCH;
    use std::sync::Arc;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local_state.json");

        let store = LocalStore::open(&path).expect("open");
        store.record_execution("r1", 1_000).await.expect("record");
        store
            .write_status(StatusSnapshot::inactive(REASON_NO_MATCH).with_timestamp(2_000))
            .await
            .expect("status");

        let reopened = LocalStore::open(&path).expect("reopen");
        assert_eq!(reopened.last_execution("r1").await, Some(1_000));
        assert_eq!(
            reopened.last_status().await.and_then(|s| s.timestamp),
            Some(2_000)
        );
    }

    #[tokio::test]
    async fn stored_keys_match_extension_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local_state.json");
        let store = LocalStore::open(&path).expect("open");
        store.record_execution("abc", 5).await.expect("record");

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(doc["lastRuleExecutions"]["abc"], 5);
    }

    #[tokio::test]
    async fn concurrent_records_are_all_kept() {
        let store = Arc::new(LocalStore::in_memory());
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.record_execution(&format!("rule-{i}"), i).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("record");
        }
        assert_eq!(store.executions().await.len(), 16);
    }

    #[tokio::test]
    async fn remove_execution_drops_entry() {
        let store = LocalStore::in_memory();
        store.record_execution("gone", 1).await.expect("record");
        store.remove_execution("gone").await.expect("remove");
        store.remove_execution("never-there").await.expect("remove");
        assert!(store.executions().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_state_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local_state.json");
        std::fs::write(&path, "{broken").expect("write");
        let store = LocalStore::open(&path).expect("open");
        assert!(store.executions().await.is_empty());
    }

    #[test]
    fn non_numeric_records_are_dropped() {
        let state: LocalState = serde_json::from_value(serde_json::json!({
            "lastRuleExecutions": {"a": 10, "b": "soon", "c": null}
        }))
        .expect("parse");
        assert_eq!(state.last_rule_executions.len(), 1);
        assert_eq!(state.last_rule_executions.get("a"), Some(&10));
    }
}
