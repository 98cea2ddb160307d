//! Timer and lifecycle driver for the heartbeat engine.
//!
//! The driver owns the primary heartbeat timer, the fallback timer and the
//! receiving end of the [`PulseEvent`] bus. It never runs a tick inline: every
//! tick is spawned so the loop keeps servicing timers and events while a tick
//! waits on the browser.

use crate::browser::TabId;
use crate::config::SchedulerConfig;
use crate::error::{PulseError, Result};
use crate::scheduler::engine::HeartbeatEngine;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tab status that starts a new top-level navigation.
pub const TAB_STATUS_LOADING: &str = "loading";

/// Browser lifecycle notifications delivered to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulseEvent {
    /// Browser started with the extension already installed.
    Startup,
    /// Extension installed or updated.
    Installed,
    TabRemoved(TabId),
    TabUpdated {
        tab_id: TabId,
        status: Option<String>,
    },
}

/// What caused a tick, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickTrigger {
    Primary,
    Fallback,
    Lifecycle,
}

/// Sending half of the event bus.
#[derive(Clone)]
pub struct PulseEventSender {
    tx: mpsc::Sender<PulseEvent>,
}

impl PulseEventSender {
    /// Queue an event for the driver.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Channel`] when the driver has stopped.
    pub async fn send(&self, event: PulseEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| PulseError::Channel(format!("heartbeat driver stopped: {e}")))
    }
}

/// Drives periodic and lifecycle ticks of a [`HeartbeatEngine`].
pub struct HeartbeatDriver {
    engine: Arc<HeartbeatEngine>,
    config: SchedulerConfig,
    events_rx: mpsc::Receiver<PulseEvent>,
    cancel: CancellationToken,
}

impl HeartbeatDriver {
    /// Create a driver and the sender for its event bus.
    pub fn new(
        engine: Arc<HeartbeatEngine>,
        config: SchedulerConfig,
        event_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, PulseEventSender) {
        let (tx, events_rx) = mpsc::channel(event_capacity.max(1));
        (
            Self {
                engine,
                config,
                events_rx,
                cancel,
            },
            PulseEventSender { tx },
        )
    }

    /// Spawn the driver loop. It stops when the token is cancelled or every
    /// event sender is dropped.
    pub fn run(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                period_secs = self.config.tick_interval().as_secs(),
                fallback = ?self.config.fallback_interval(),
                "heartbeat driver started"
            );
            let mut primary = arm_primary(&self.config);
            let mut fallback = arm_fallback(&self.config);

            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        info!("heartbeat driver cancelled");
                        break;
                    }
                    _ = primary.tick() => self.spawn_tick(TickTrigger::Primary),
                    () = tick_optional(fallback.as_mut()) => self.spawn_tick(TickTrigger::Fallback),
                    event = self.events_rx.recv() => {
                        let Some(event) = event else {
                            info!("heartbeat event bus closed");
                            break;
                        };
                        if matches!(event, PulseEvent::Startup | PulseEvent::Installed) {
                            primary = arm_primary(&self.config);
                        }
                        self.handle_event(event);
                    }
                }
            }
        })
    }

    fn handle_event(&self, event: PulseEvent) {
        debug!(?event, "heartbeat event");
        match event {
            PulseEvent::Startup => {
                let engine = Arc::clone(&self.engine);
                spawn_logged("startup", async move {
                    prepare_runtime(&engine).await;
                    engine.runner().forget_all().await;
                    if let Err(e) = engine.sync_action_icon().await {
                        debug!("action icon update failed: {e}");
                    }
                    engine.force_tick().await;
                });
            }
            PulseEvent::Installed => {
                let engine = Arc::clone(&self.engine);
                spawn_logged("install", async move {
                    prepare_runtime(&engine).await;
                    engine.force_tick().await;
                });
            }
            PulseEvent::TabRemoved(tab_id) => {
                let engine = Arc::clone(&self.engine);
                spawn_logged("tab removed", async move {
                    engine.runner().forget_tab(tab_id).await;
                });
            }
            PulseEvent::TabUpdated { tab_id, status } => {
                if status.as_deref() != Some(TAB_STATUS_LOADING) {
                    return;
                }
                let engine = Arc::clone(&self.engine);
                spawn_logged("tab updated", async move {
                    engine.runner().forget_tab(tab_id).await;
                });
            }
        }
    }

    fn spawn_tick(&self, trigger: TickTrigger) {
        let engine = Arc::clone(&self.engine);
        spawn_logged("tick", async move {
            match engine.try_tick().await {
                Some(report) => debug!(?trigger, ?report, "periodic tick done"),
                None => debug!(?trigger, "periodic tick skipped"),
            }
        });
    }
}

async fn prepare_runtime(engine: &HeartbeatEngine) {
    if let Err(e) = engine.settings().ensure_defaults().await {
        warn!("failed to write default settings: {e}");
    }
}

/// Wait for the next fallback tick, or forever when the fallback is disabled.
async fn tick_optional(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn arm_primary(config: &SchedulerConfig) -> Interval {
    let start = Instant::now() + config.first_tick_delay();
    let mut interval = tokio::time::interval_at(start, config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn arm_fallback(config: &SchedulerConfig) -> Option<Interval> {
    let period = config.fallback_interval()?;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

/// Spawn `fut` and log when it panics, so one broken tick never takes the
/// driver down with it.
fn spawn_logged<F>(label: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                error!("{label} task panicked: {e}");
            }
        }
    });
}
