//! Host command channel and router.

use crate::browser::TabId;
use crate::error::{PulseError, Result};
use crate::host::contract::{
    CommandEnvelope, CommandName, EVENT_RULES_CHANGED, EVENT_SETTINGS_CHANGED, EVENT_VERSION,
    EventEnvelope, ResponseEnvelope,
};
use crate::rules::{GlobalConfig, Rule};
use crate::scheduler::{RuleOverview, RunRuleOutcome, TickReport};
use crate::status::StatusSnapshot;
use crate::store::{RuleDraft, RulePatch, SettingsPatch};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Backend operations reachable through host commands.
#[async_trait]
pub trait PulseHandler: Send + Sync + 'static {
    /// Run one tick now, waiting for any running tick first.
    async fn force_heartbeat(&self) -> Result<TickReport>;
    async fn run_rule(&self, rule_id: &str) -> Result<RunRuleOutcome>;
    async fn query_status(&self) -> Result<Option<StatusSnapshot>>;
    async fn list_rules(&self) -> Result<Vec<Rule>>;
    async fn create_rule(&self, draft: RuleDraft) -> Result<Rule>;
    async fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<Rule>;
    async fn delete_rule(&self, rule_id: &str) -> Result<Rule>;
    async fn rules_overview(&self) -> Result<Vec<RuleOverview>>;
    async fn query_settings(&self) -> Result<GlobalConfig>;
    async fn patch_settings(&self, patch: SettingsPatch) -> Result<GlobalConfig>;
    /// Browser started (`installed == false`) or extension installed.
    async fn runtime_started(&self, _installed: bool) -> Result<()> {
        Ok(())
    }
    /// The extension is going away; the host should shut down.
    async fn request_runtime_stop(&self) -> Result<()> {
        Ok(())
    }
    async fn tab_removed(&self, _tab_id: TabId) -> Result<()> {
        Ok(())
    }
    async fn tab_updated(&self, _tab_id: TabId, _status: Option<&str>) -> Result<()> {
        Ok(())
    }
}

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<Result<ResponseEnvelope>>,
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            PulseError::InvalidRequest(format!(
                "invalid host command envelope {}: {}",
                envelope.request_id, e
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| PulseError::Channel(format!("failed to send host command request: {e}")))?;

        response_rx
            .await
            .map_err(|e| PulseError::Channel(format!("host command response dropped: {e}")))?
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

/// Routes command envelopes to a [`PulseHandler`]. Cheap to clone.
pub struct CommandRouter<H: PulseHandler> {
    handler: Arc<H>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl<H: PulseHandler> Clone for CommandRouter<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            event_tx: self.event_tx.clone(),
        }
    }
}

pub struct HostCommandServer<H: PulseHandler> {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    router: CommandRouter<H>,
}

#[must_use]
pub fn command_channel<H: PulseHandler>(
    request_capacity: usize,
    event_capacity: usize,
    handler: Arc<H>,
) -> (HostCommandClient, HostCommandServer<H>) {
    let (event_tx, _event_rx) = broadcast::channel(event_capacity.max(1));
    command_channel_with_events(request_capacity, event_tx, handler)
}

/// Create a command channel using an existing event broadcast sender.
///
/// The handler and the server then share one broadcast channel, so events
/// the handler emits on its own (status changes, periodic tick reports)
/// reach the extension through the same path as router events.
#[must_use]
pub fn command_channel_with_events<H: PulseHandler>(
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
    handler: Arc<H>,
) -> (HostCommandClient, HostCommandServer<H>) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));

    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            router: CommandRouter { handler, event_tx },
        },
    )
}

impl<H: PulseHandler> HostCommandServer<H> {
    /// Serve requests until every client is dropped.
    ///
    /// Each request is routed on its own task: a command that waits on the
    /// browser (a forced tick, a manual run) must not hold up the next one.
    pub async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            let router = self.router.clone();
            tokio::spawn(async move {
                let response = router.route(&request.envelope).await;
                let _ = request.response_tx.send(response);
            });
        }
    }

    #[must_use]
    pub fn router(&self) -> &CommandRouter<H> {
        &self.router
    }

    /// Route a command envelope to the appropriate handler.
    pub async fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        self.router.route(envelope).await
    }
}

impl<H: PulseHandler> CommandRouter<H> {
    /// Route a command envelope to the appropriate handler.
    pub async fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        match envelope.command {
            CommandName::HostPing => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({"pong": true}),
            )),
            CommandName::HostVersion => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({
                    "contract_version": EVENT_VERSION,
                    "channel": "pulse_host_v1",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            )),
            CommandName::HeartbeatForce => self.handle_heartbeat_force(envelope).await,
            CommandName::RuleRun => self.handle_rule_run(envelope).await,
            CommandName::StatusGet => self.handle_status_get(envelope).await,
            CommandName::RulesList => self.handle_rules_list(envelope).await,
            CommandName::RulesCreate => self.handle_rules_create(envelope).await,
            CommandName::RulesUpdate => self.handle_rules_update(envelope).await,
            CommandName::RulesDelete => self.handle_rules_delete(envelope).await,
            CommandName::RulesOverview => self.handle_rules_overview(envelope).await,
            CommandName::SettingsGet => self.handle_settings_get(envelope).await,
            CommandName::SettingsPatch => self.handle_settings_patch(envelope).await,
            CommandName::RuntimeStartup => self.handle_runtime_started(envelope, false).await,
            CommandName::RuntimeInstalled => self.handle_runtime_started(envelope, true).await,
            CommandName::RuntimeStop => self.handle_runtime_stop(envelope).await,
            CommandName::TabRemoved => self.handle_tab_removed(envelope).await,
            CommandName::TabUpdated => self.handle_tab_updated(envelope).await,
        }
    }

    async fn handle_heartbeat_force(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let report = self.handler.force_heartbeat().await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"success": true, "report": to_json(&report)?}),
        ))
    }

    async fn handle_rule_run(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let rule_id = parse_non_empty_field(&envelope.payload, "ruleId", "rule.run")?;
        let outcome = self.handler.run_rule(&rule_id).await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            to_json(&outcome)?,
        ))
    }

    async fn handle_status_get(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let status = self.handler.query_status().await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"status": to_json(&status)?}),
        ))
    }

    async fn handle_rules_list(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let rules = self.handler.list_rules().await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"rules": to_json(&rules)?}),
        ))
    }

    async fn handle_rules_create(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let draft: RuleDraft = parse_payload(&envelope.payload, "rules.create")?;
        let rule = self.handler.create_rule(draft).await?;
        self.emit_event(
            EVENT_RULES_CHANGED,
            serde_json::json!({
                "request_id": envelope.request_id,
                "action": "created",
                "ruleId": rule.id,
            }),
        );
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"rule": to_json(&rule)?}),
        ))
    }

    async fn handle_rules_update(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let rule_id = parse_non_empty_field(&envelope.payload, "ruleId", "rules.update")?;
        let patch: RulePatch = parse_payload(&envelope.payload, "rules.update")?;
        let rule = self.handler.update_rule(&rule_id, patch).await?;
        self.emit_event(
            EVENT_RULES_CHANGED,
            serde_json::json!({
                "request_id": envelope.request_id,
                "action": "updated",
                "ruleId": rule.id,
            }),
        );
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"rule": to_json(&rule)?}),
        ))
    }

    async fn handle_rules_delete(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let rule_id = parse_non_empty_field(&envelope.payload, "ruleId", "rules.delete")?;
        let rule = self.handler.delete_rule(&rule_id).await?;
        self.emit_event(
            EVENT_RULES_CHANGED,
            serde_json::json!({
                "request_id": envelope.request_id,
                "action": "deleted",
                "ruleId": rule.id,
            }),
        );
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"deleted": true, "ruleId": rule.id}),
        ))
    }

    async fn handle_rules_overview(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let overview = self.handler.rules_overview().await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"rules": to_json(&overview)?}),
        ))
    }

    async fn handle_settings_get(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let global = self.handler.query_settings().await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            global_json(global),
        ))
    }

    async fn handle_settings_patch(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let patch: SettingsPatch = parse_payload(&envelope.payload, "settings.patch")?;
        if patch.is_empty() {
            return Err(PulseError::InvalidRequest(
                "settings.patch requires payload.globalEnabled or payload.theme".to_owned(),
            ));
        }
        let global = self.handler.patch_settings(patch).await?;
        self.emit_event(EVENT_SETTINGS_CHANGED, global_json(global));
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            global_json(global),
        ))
    }

    async fn handle_runtime_started(
        &self,
        envelope: &CommandEnvelope,
        installed: bool,
    ) -> Result<ResponseEnvelope> {
        self.handler.runtime_started(installed).await?;
        Ok(accepted(envelope))
    }

    async fn handle_runtime_stop(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        self.handler.request_runtime_stop().await?;
        Ok(accepted(envelope))
    }

    async fn handle_tab_removed(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let tab_id = parse_tab_id(&envelope.payload, "tab.removed")?;
        self.handler.tab_removed(tab_id).await?;
        Ok(accepted(envelope))
    }

    async fn handle_tab_updated(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let tab_id = parse_tab_id(&envelope.payload, "tab.updated")?;
        let status = envelope
            .payload
            .get("status")
            .and_then(serde_json::Value::as_str);
        self.handler.tab_updated(tab_id, status).await?;
        Ok(accepted(envelope))
    }

    fn emit_event(&self, event: &str, payload: serde_json::Value) {
        let envelope =
            EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event.to_owned(), payload);
        let _ = self.event_tx.send(envelope);
    }
}

fn accepted(envelope: &CommandEnvelope) -> ResponseEnvelope {
    ResponseEnvelope::ok(
        envelope.request_id.clone(),
        serde_json::json!({"accepted": true}),
    )
}

fn global_json(global: GlobalConfig) -> serde_json::Value {
    serde_json::json!({
        "globalEnabled": global.enabled,
        "theme": global.theme.as_str(),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| PulseError::Host(format!("cannot encode response payload: {e}")))
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
    command: &str,
) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| PulseError::InvalidRequest(format!("{command} payload: {e}")))
}

fn parse_non_empty_field(
    payload: &serde_json::Value,
    field: &str,
    command: &str,
) -> Result<String> {
    let Some(raw) = payload.get(field).and_then(serde_json::Value::as_str) else {
        return Err(PulseError::InvalidRequest(format!(
            "{command} requires payload.{field}"
        )));
    };
    let value = raw.trim();
    if value.is_empty() {
        return Err(PulseError::InvalidRequest(format!(
            "{command} requires a non-empty payload.{field}"
        )));
    }
    Ok(value.to_owned())
}

fn parse_tab_id(payload: &serde_json::Value, command: &str) -> Result<TabId> {
    payload
        .get("tabId")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| PulseError::InvalidRequest(format!("{command} requires payload.tabId")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::rules::{Activity, Theme};
    use crate::scheduler::TickSummary;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestHandler {
        removed_tabs: Mutex<Vec<TabId>>,
        updated_tabs: Mutex<Vec<(TabId, Option<String>)>>,
    }

    #[async_trait]
    impl PulseHandler for TestHandler {
        async fn force_heartbeat(&self) -> Result<TickReport> {
            Ok(TickReport::Processed(TickSummary {
                matched: 1,
                executed: 1,
                ..TickSummary::default()
            }))
        }
        async fn run_rule(&self, rule_id: &str) -> Result<RunRuleOutcome> {
            if rule_id == "known" {
                Ok(RunRuleOutcome::executed(2))
            } else {
                Ok(RunRuleOutcome::failed("Rule not found"))
            }
        }
        async fn query_status(&self) -> Result<Option<StatusSnapshot>> {
            Ok(None)
        }
        async fn list_rules(&self) -> Result<Vec<Rule>> {
            Ok(Vec::new())
        }
        async fn create_rule(&self, draft: RuleDraft) -> Result<Rule> {
            draft.into_rule()
        }
        async fn update_rule(&self, rule_id: &str, _patch: RulePatch) -> Result<Rule> {
            Err(PulseError::NotFound(format!("rule {rule_id}")))
        }
        async fn delete_rule(&self, rule_id: &str) -> Result<Rule> {
            let mut rule = Rule::new("Gone", "gone.test", 1, Activity::Ping);
            rule.id = rule_id.to_owned();
            Ok(rule)
        }
        async fn rules_overview(&self) -> Result<Vec<RuleOverview>> {
            Ok(Vec::new())
        }
        async fn query_settings(&self) -> Result<GlobalConfig> {
            Ok(GlobalConfig::default())
        }
        async fn patch_settings(&self, patch: SettingsPatch) -> Result<GlobalConfig> {
            Ok(GlobalConfig {
                enabled: patch.global_enabled.unwrap_or(true),
                theme: patch.theme.unwrap_or(Theme::Dark),
            })
        }
        async fn tab_removed(&self, tab_id: TabId) -> Result<()> {
            self.removed_tabs.lock().unwrap().push(tab_id);
            Ok(())
        }
        async fn tab_updated(&self, tab_id: TabId, status: Option<&str>) -> Result<()> {
            self.updated_tabs
                .lock()
                .unwrap()
                .push((tab_id, status.map(str::to_owned)));
            Ok(())
        }
    }

    fn make_server() -> (HostCommandServer<TestHandler>, Arc<TestHandler>) {
        let handler = Arc::new(TestHandler::default());
        let (_client, server) = command_channel(8, 8, Arc::clone(&handler));
        (server, handler)
    }

    fn make_envelope(command: CommandName, payload: serde_json::Value) -> CommandEnvelope {
        CommandEnvelope::new("test-req-1", command, payload)
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let (server, _) = make_server();
        let resp = server
            .route(&make_envelope(CommandName::HostPing, serde_json::json!({})))
            .await
            .unwrap();
        assert!(resp.ok);
        assert_eq!(resp.payload["pong"], true);
    }

    #[tokio::test]
    async fn heartbeat_force_wraps_report() {
        let (server, _) = make_server();
        let resp = server
            .route(&make_envelope(CommandName::HeartbeatForce, serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(resp.payload["success"], true);
        assert_eq!(resp.payload["report"]["outcome"], "processed");
        assert_eq!(resp.payload["report"]["executed"], 1);
    }

    #[tokio::test]
    async fn rule_run_requires_rule_id() {
        let (server, _) = make_server();
        let missing = server
            .route(&make_envelope(CommandName::RuleRun, serde_json::json!({})))
            .await;
        assert!(matches!(missing, Err(PulseError::InvalidRequest(_))));

        let resp = server
            .route(&make_envelope(
                CommandName::RuleRun,
                serde_json::json!({"ruleId": "known"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.payload["success"], true);
        assert_eq!(resp.payload["executedCount"], 2);
    }

    #[tokio::test]
    async fn rules_create_emits_rules_changed() {
        let (server, _) = make_server();
        let mut events = server.router().event_tx.subscribe();

        let resp = server
            .route(&make_envelope(
                CommandName::RulesCreate,
                serde_json::json!({"name": "Mail", "pattern": "mail.test", "activity": "scroll"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.payload["rule"]["activity"], "scroll");
        assert_eq!(resp.payload["rule"]["intervalMinutes"], 5);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, EVENT_RULES_CHANGED);
        assert_eq!(event.payload["action"], "created");
    }

    #[tokio::test]
    async fn rules_create_rejects_unknown_activity() {
        let (server, _) = make_server();
        let resp = server
            .route(&make_envelope(
                CommandName::RulesCreate,
                serde_json::json!({"name": "Mail", "pattern": "mail.test", "activity": "dance"}),
            ))
            .await;
        assert!(matches!(resp, Err(PulseError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn rules_update_propagates_not_found() {
        let (server, _) = make_server();
        let resp = server
            .route(&make_envelope(
                CommandName::RulesUpdate,
                serde_json::json!({"ruleId": "missing", "enabled": false}),
            ))
            .await;
        assert!(matches!(resp, Err(PulseError::NotFound(_))));
    }

    #[tokio::test]
    async fn settings_patch_requires_a_field() {
        let (server, _) = make_server();
        let empty = server
            .route(&make_envelope(CommandName::SettingsPatch, serde_json::json!({})))
            .await;
        assert!(empty.is_err());

        let resp = server
            .route(&make_envelope(
                CommandName::SettingsPatch,
                serde_json::json!({"theme": "light"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.payload["theme"], "light");
        assert_eq!(resp.payload["globalEnabled"], true);
    }

    #[tokio::test]
    async fn tab_notifications_reach_handler() {
        let (server, handler) = make_server();
        server
            .route(&make_envelope(
                CommandName::TabRemoved,
                serde_json::json!({"tabId": 12}),
            ))
            .await
            .unwrap();
        server
            .route(&make_envelope(
                CommandName::TabUpdated,
                serde_json::json!({"tabId": 13, "status": "loading"}),
            ))
            .await
            .unwrap();

        assert_eq!(*handler.removed_tabs.lock().unwrap(), vec![12]);
        assert_eq!(
            *handler.updated_tabs.lock().unwrap(),
            vec![(13, Some("loading".to_owned()))]
        );
    }

    #[tokio::test]
    async fn tab_removed_without_id_is_rejected() {
        let (server, _) = make_server();
        let resp = server
            .route(&make_envelope(
                CommandName::TabRemoved,
                serde_json::json!({"tabId": "twelve"}),
            ))
            .await;
        assert!(matches!(resp, Err(PulseError::InvalidRequest(_))));
    }
}
