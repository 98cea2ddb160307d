//! Heartbeat scheduling.
//!
//! [`HeartbeatEngine`] performs ticks and manual runs; [`HeartbeatDriver`]
//! decides when ticks happen.

pub mod clock;
pub mod driver;
pub mod engine;
pub mod overview;

pub use driver::{HeartbeatDriver, PulseEvent, PulseEventSender};
pub use engine::{EngineDeps, HeartbeatEngine, RunRuleOutcome, TickReport, TickSummary};
pub use overview::{RuleOverview, build_overview};
