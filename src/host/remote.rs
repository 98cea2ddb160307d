//! Browser operations forwarded to the extension as host calls.
//!
//! Every call gets a fresh `call_id` and a pending slot. The stdio reader
//! hands inbound replies to [`RemoteBrowser::resolve`], which completes the
//! slot. A call that gets no reply within the configured timeout fails with
//! [`PulseError::Host`] and its slot is dropped.

use crate::browser::{ActivityPayload, BrowserHost, InvokeOutcome, Tab, TabId};
use crate::error::{PulseError, Result};
use crate::host::contract::{CallEnvelope, CallName, ReplyEnvelope};
use crate::idle::{IdleOracle, IdleState};
use crate::rules::Theme;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};

/// Outbound call queue capacity.
pub const CALL_CAPACITY: usize = 64;

/// [`BrowserHost`] and [`IdleOracle`] backed by the host bridge.
pub struct RemoteBrowser {
    call_tx: mpsc::Sender<CallEnvelope>,
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyEnvelope>>>,
    timeout: Duration,
}

impl RemoteBrowser {
    /// Create the proxy and the receiver the transport drains outbound calls from.
    pub fn new(timeout: Duration) -> (Arc<Self>, mpsc::Receiver<CallEnvelope>) {
        let (call_tx, call_rx) = mpsc::channel(CALL_CAPACITY);
        (
            Arc::new(Self {
                call_tx,
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
            call_rx,
        )
    }

    /// Send `call` and wait for its reply payload.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Host`] when the transport is gone, the call
    /// times out, or the extension reports a failure.
    pub async fn call(&self, call: CallName, payload: serde_json::Value) -> Result<serde_json::Value> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id.clone(), reply_tx);

        let envelope = CallEnvelope::new(call_id.clone(), call, payload);
        if self.call_tx.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&call_id);
            return Err(PulseError::Host(format!(
                "{} failed: host bridge is closed",
                call.as_str()
            )));
        }

        let reply = match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(PulseError::Host(format!(
                    "{} reply channel closed",
                    call.as_str()
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&call_id);
                return Err(PulseError::Host(format!(
                    "{} timed out after {} ms",
                    call.as_str(),
                    self.timeout.as_millis()
                )));
            }
        };

        if reply.ok {
            Ok(reply.payload)
        } else {
            Err(PulseError::Host(format!(
                "{} failed: {}",
                call.as_str(),
                reply.error.as_deref().unwrap_or("unknown error")
            )))
        }
    }

    /// Complete the pending call a reply belongs to.
    ///
    /// Returns `false` for replies to unknown or already timed-out calls.
    pub async fn resolve(&self, reply: ReplyEnvelope) -> bool {
        let Some(reply_tx) = self.pending.lock().await.remove(&reply.call_id) else {
            tracing::debug!(call_id = %reply.call_id, "reply for unknown call");
            return false;
        };
        reply_tx.send(reply).is_ok()
    }

    /// Fail every outstanding call, e.g. when the transport closes.
    pub async fn cancel_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "dropping pending host calls");
        }
        pending.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn parse_tabs(payload: serde_json::Value) -> Result<Vec<Tab>> {
    let tabs = match payload {
        serde_json::Value::Object(mut obj) => obj
            .remove("tabs")
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(tabs)
        .map_err(|e| PulseError::Host(format!("tabs.query returned malformed tabs: {e}")))
}

#[async_trait]
impl BrowserHost for RemoteBrowser {
    async fn query_tabs(&self) -> Result<Vec<Tab>> {
        let payload = self.call(CallName::TabsQuery, serde_json::json!({})).await?;
        parse_tabs(payload)
    }

    async fn prepare_tab(&self, tab_id: TabId) -> Result<()> {
        self.call(CallName::TabPrepare, serde_json::json!({"tabId": tab_id}))
            .await
            .map(|_| ())
    }

    async fn invoke_activity(
        &self,
        tab_id: TabId,
        payload: &ActivityPayload,
    ) -> Result<InvokeOutcome> {
        let reply = self
            .call(
                CallName::TabInvoke,
                serde_json::json!({"tabId": tab_id, "payload": payload}),
            )
            .await?;
        match reply.get("performed").and_then(serde_json::Value::as_bool) {
            Some(true) => Ok(InvokeOutcome::Performed),
            Some(false) => Ok(InvokeOutcome::CapabilityAbsent),
            None => Err(PulseError::Execution(format!(
                "tab.invoke on tab {tab_id} returned no `performed` flag"
            ))),
        }
    }

    async fn set_badge_text(&self, text: &str) -> Result<()> {
        self.call(CallName::ActionBadge, serde_json::json!({"text": text}))
            .await
            .map(|_| ())
    }

    async fn set_action_icon(&self, theme: Theme) -> Result<()> {
        self.call(CallName::ActionIcon, serde_json::json!({"theme": theme.as_str()}))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl IdleOracle for RemoteBrowser {
    async fn query_state(&self, threshold_secs: u32) -> Result<IdleState> {
        let reply = self
            .call(
                CallName::IdleQuery,
                serde_json::json!({"thresholdSecs": threshold_secs}),
            )
            .await
            .map_err(|e| PulseError::IdleQuery(e.to_string()))?;
        let state = reply
            .get("state")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| PulseError::IdleQuery("idle.query returned no state".to_owned()))?;
        Ok(IdleState::parse_lenient(state))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::rules::{Activity, Rule};

    /// Answer every outbound call with `answer(call)`.
    fn spawn_responder(
        remote: Arc<RemoteBrowser>,
        mut calls: mpsc::Receiver<CallEnvelope>,
        answer: fn(&CallEnvelope) -> ReplyEnvelope,
    ) {
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                remote.resolve(answer(&call)).await;
            }
        });
    }

    #[tokio::test]
    async fn query_tabs_round_trip() {
        let (remote, calls) = RemoteBrowser::new(Duration::from_secs(2));
        spawn_responder(Arc::clone(&remote), calls, |call| {
            assert_eq!(call.call, CallName::TabsQuery);
            ReplyEnvelope::ok(
                call.call_id.clone(),
                serde_json::json!([{"id": 1, "url": "https://a.test/"}, {"id": 2}]),
            )
        });

        let tabs = remote.query_tabs().await.expect("tabs");
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[1].url, None);
        assert_eq!(remote.pending_count().await, 0);
    }

    #[tokio::test]
    async fn invoke_maps_performed_flag() {
        let (remote, calls) = RemoteBrowser::new(Duration::from_secs(2));
        spawn_responder(Arc::clone(&remote), calls, |call| {
            let tab_id = call.payload["tabId"].as_i64().unwrap_or_default();
            assert_eq!(call.payload["payload"]["rule"]["activity"], "ping");
            ReplyEnvelope::ok(
                call.call_id.clone(),
                serde_json::json!({"performed": tab_id == 1}),
            )
        });

        let payload = ActivityPayload {
            rule: Rule::new("R", "a.test", 1, Activity::Ping),
            timestamp: 10,
        };
        assert_eq!(
            remote.invoke_activity(1, &payload).await.expect("invoke"),
            InvokeOutcome::Performed
        );
        assert_eq!(
            remote.invoke_activity(2, &payload).await.expect("invoke"),
            InvokeOutcome::CapabilityAbsent
        );
    }

    #[tokio::test]
    async fn error_reply_is_host_error() {
        let (remote, calls) = RemoteBrowser::new(Duration::from_secs(2));
        spawn_responder(Arc::clone(&remote), calls, |call| {
            ReplyEnvelope::error(call.call_id.clone(), "No tab with id: 9")
        });

        let err = remote.prepare_tab(9).await.expect_err("should fail");
        assert!(matches!(err, PulseError::Host(ref msg) if msg.contains("No tab with id")));
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_clears_slot() {
        let (remote, _calls) = RemoteBrowser::new(Duration::from_millis(20));
        let err = remote.set_badge_text("•").await.expect_err("timeout");
        assert!(matches!(err, PulseError::Host(ref msg) if msg.contains("timed out")));
        assert_eq!(remote.pending_count().await, 0);
    }

    #[tokio::test]
    async fn closed_transport_fails_fast() {
        let (remote, calls) = RemoteBrowser::new(Duration::from_secs(5));
        drop(calls);
        let err = remote.query_tabs().await.expect_err("closed");
        assert!(matches!(err, PulseError::Host(_)));
    }

    #[tokio::test]
    async fn idle_failures_are_idle_query_errors() {
        let (remote, calls) = RemoteBrowser::new(Duration::from_secs(2));
        spawn_responder(Arc::clone(&remote), calls, |call| {
            ReplyEnvelope::error(call.call_id.clone(), "idle permission missing")
        });
        let err = remote.query_state(60).await.expect_err("idle");
        assert!(matches!(err, PulseError::IdleQuery(_)));
    }

    #[tokio::test]
    async fn idle_state_is_parsed() {
        let (remote, calls) = RemoteBrowser::new(Duration::from_secs(2));
        spawn_responder(Arc::clone(&remote), calls, |call| {
            assert_eq!(call.payload["thresholdSecs"], 60);
            ReplyEnvelope::ok(call.call_id.clone(), serde_json::json!({"state": "idle"}))
        });
        assert_eq!(remote.query_state(60).await.expect("idle"), IdleState::Idle);
    }

    #[tokio::test]
    async fn unknown_reply_is_ignored() {
        let (remote, _calls) = RemoteBrowser::new(Duration::from_secs(2));
        assert!(!remote.resolve(ReplyEnvelope::ok("nobody", serde_json::Value::Null)).await);
    }
}
