//! Pixel Pulse: keeps matching browser tabs alive with periodic simulated
//! activity.
//!
//! The host process runs next to a browser extension and talks to it over
//! newline-delimited JSON on stdio:
//! Timer → Engine → Matcher → Runner → Browser
//!
//! # Architecture
//!
//! - **Rules**: user-defined URL patterns with an interval and an activity
//! - **Matcher**: substring or wildcard glob matching against tab URLs
//! - **Engine**: one reconciliation tick over every (rule, tab) pair
//! - **Driver**: primary and fallback timers plus browser lifecycle events
//! - **Stores**: `settings.json` for rules, `local_state.json` for execution
//!   records and the last status
//! - **Host**: command routing, events, and calls back into the browser

pub mod browser;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod idle;
pub mod matcher;
pub mod pulse_dirs;
pub mod rules;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod store;

pub use config::PulseConfig;
pub use error::{PulseError, Result};
pub use scheduler::{HeartbeatEngine, TickReport};
