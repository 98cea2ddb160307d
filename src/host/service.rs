//! Production [`PulseHandler`]: the engine, its stores and its driver wired
//! behind the host command channel.

use crate::browser::{BrowserHost, TabCandidate, TabId};
use crate::config::PulseConfig;
use crate::error::Result;
use crate::host::channel::PulseHandler;
use crate::host::contract::{
    CallEnvelope, EVENT_HEARTBEAT_COMPLETED, EVENT_STATUS_CHANGED, EventEnvelope,
};
use crate::host::remote::RemoteBrowser;
use crate::idle::IdleOracle;
use crate::pulse_dirs::{LOCAL_STATE_FILE_NAME, SETTINGS_FILE_NAME};
use crate::rules::{GlobalConfig, Rule};
use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::{
    EngineDeps, HeartbeatDriver, HeartbeatEngine, PulseEvent, PulseEventSender, RuleOverview,
    RunRuleOutcome, TickReport, build_overview,
};
use crate::status::StatusSnapshot;
use crate::store::{LocalStore, RuleDraft, RulePatch, SettingsPatch, SettingsStore};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handler backing every host command with the heartbeat engine.
pub struct PulseService {
    engine: Arc<HeartbeatEngine>,
    events: PulseEventSender,
    event_tx: broadcast::Sender<EventEnvelope>,
    shutdown: CancellationToken,
}

impl PulseService {
    pub fn new(
        engine: Arc<HeartbeatEngine>,
        events: PulseEventSender,
        event_tx: broadcast::Sender<EventEnvelope>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            events,
            event_tx,
            shutdown,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<HeartbeatEngine> {
        &self.engine
    }

    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Forward status changes and tick reports onto the event bus until
    /// shutdown.
    pub fn spawn_event_forwarders(&self) -> Vec<JoinHandle<()>> {
        let status_rx = self.engine.status().subscribe();
        let reports_rx = self.engine.subscribe_reports();
        vec![
            spawn_forwarder(
                status_rx,
                self.event_tx.clone(),
                self.shutdown.clone(),
                EVENT_STATUS_CHANGED,
            ),
            spawn_forwarder(
                reports_rx,
                self.event_tx.clone(),
                self.shutdown.clone(),
                EVENT_HEARTBEAT_COMPLETED,
            ),
        ]
    }

    fn spawn_forced_tick(&self) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            engine.force_tick().await;
        });
    }
}

fn spawn_forwarder<T>(
    mut rx: broadcast::Receiver<T>,
    event_tx: broadcast::Sender<EventEnvelope>,
    shutdown: CancellationToken,
    event: &'static str,
) -> JoinHandle<()>
where
    T: serde::Serialize + Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                () = shutdown.cancelled() => break,
                item = rx.recv() => item,
            };
            match item {
                Ok(item) => match serde_json::to_value(&item) {
                    Ok(payload) => {
                        let envelope =
                            EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event, payload);
                        let _ = event_tx.send(envelope);
                    }
                    Err(e) => warn!(event, "failed to encode event payload: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(event, lagged = n, "event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[async_trait]
impl PulseHandler for PulseService {
    async fn force_heartbeat(&self) -> Result<TickReport> {
        Ok(self.engine.force_tick().await)
    }

    async fn run_rule(&self, rule_id: &str) -> Result<RunRuleOutcome> {
        self.engine.run_rule(rule_id).await
    }

    async fn query_status(&self) -> Result<Option<StatusSnapshot>> {
        Ok(self.engine.status().current().await)
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.engine.settings().rules().await)
    }

    async fn create_rule(&self, draft: RuleDraft) -> Result<Rule> {
        let rule = self.engine.settings().create_rule(draft).await?;
        info!(rule_id = %rule.id, pattern = %rule.pattern, "rule created");
        self.spawn_forced_tick();
        Ok(rule)
    }

    async fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<Rule> {
        let rule = self.engine.settings().update_rule(rule_id, patch).await?;
        info!(rule_id = %rule.id, enabled = rule.enabled, "rule updated");
        Ok(rule)
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<Rule> {
        let rule = self.engine.settings().delete_rule(rule_id).await?;
        if let Err(e) = self.engine.local().remove_execution(rule_id).await {
            warn!(rule_id, "failed to drop execution record: {e}");
        }
        info!(rule_id, "rule deleted");
        Ok(rule)
    }

    async fn rules_overview(&self) -> Result<Vec<RuleOverview>> {
        let rules = self.engine.settings().rules().await;
        let executions = self.engine.local().executions().await;
        let candidates = match self.engine.browser().query_tabs().await {
            Ok(tabs) => TabCandidate::from_tabs(tabs),
            Err(e) => {
                warn!("tab query failed while building overview: {e}");
                Vec::new()
            }
        };
        let now = self.engine.clock().now_millis();
        Ok(build_overview(&rules, &executions, &candidates, now))
    }

    async fn query_settings(&self) -> Result<GlobalConfig> {
        Ok(self.engine.settings().global().await)
    }

    async fn patch_settings(&self, patch: SettingsPatch) -> Result<GlobalConfig> {
        let before = self.engine.settings().global().await;
        let after = self.engine.settings().patch_global(patch).await?;
        if before.theme != after.theme {
            if let Err(e) = self.engine.browser().set_action_icon(after.theme).await {
                debug!("action icon update failed: {e}");
            }
        }
        info!(enabled = after.enabled, theme = after.theme.as_str(), "settings updated");
        Ok(after)
    }

    async fn runtime_started(&self, installed: bool) -> Result<()> {
        let event = if installed {
            PulseEvent::Installed
        } else {
            PulseEvent::Startup
        };
        self.events.send(event).await
    }

    async fn request_runtime_stop(&self) -> Result<()> {
        info!("runtime stop requested");
        self.shutdown.cancel();
        Ok(())
    }

    async fn tab_removed(&self, tab_id: TabId) -> Result<()> {
        self.events.send(PulseEvent::TabRemoved(tab_id)).await
    }

    async fn tab_updated(&self, tab_id: TabId, status: Option<&str>) -> Result<()> {
        self.events
            .send(PulseEvent::TabUpdated {
                tab_id,
                status: status.map(str::to_owned),
            })
            .await
    }
}

/// A fully wired host: service, browser proxy and background tasks.
pub struct PulseRuntime {
    pub service: Arc<PulseService>,
    pub remote: Arc<RemoteBrowser>,
    pub event_tx: broadcast::Sender<EventEnvelope>,
    pub shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PulseRuntime {
    /// Open the stores, build the engine and start the driver.
    ///
    /// Also returns the queue of outbound browser calls the transport must
    /// write.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be opened.
    pub async fn start(config: &PulseConfig) -> Result<(Self, mpsc::Receiver<CallEnvelope>)> {
        let data_dir = config.storage.resolved_data_dir();
        let settings = Arc::new(SettingsStore::open(data_dir.join(SETTINGS_FILE_NAME))?);
        let local = Arc::new(LocalStore::open(data_dir.join(LOCAL_STATE_FILE_NAME))?);
        if let Err(e) = settings.ensure_defaults().await {
            warn!("failed to write default settings: {e}");
        }
        info!(data_dir = %data_dir.display(), "stores opened");

        let (remote, calls_rx) = RemoteBrowser::new(config.host.call_timeout());
        let browser: Arc<dyn BrowserHost> = remote.clone();
        let idle: Arc<dyn IdleOracle> = remote.clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let engine = Arc::new(HeartbeatEngine::new(
            EngineDeps {
                settings,
                local,
                browser,
                idle,
                clock,
            },
            &config.scheduler,
        ));

        let shutdown = CancellationToken::new();
        let (driver, events) = HeartbeatDriver::new(
            Arc::clone(&engine),
            config.scheduler.clone(),
            config.host.request_capacity,
            shutdown.clone(),
        );
        let (event_tx, _) = broadcast::channel(config.host.event_capacity.max(1));

        let service = Arc::new(PulseService::new(
            engine,
            events,
            event_tx.clone(),
            shutdown.clone(),
        ));
        let mut tasks = service.spawn_event_forwarders();
        tasks.push(driver.run());

        Ok((
            Self {
                service,
                remote,
                event_tx,
                shutdown,
                tasks,
            },
            calls_rx,
        ))
    }

    /// Cancel background work and wait for it to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.remote.cancel_pending().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
