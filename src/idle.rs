//! User idle detection.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Input state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    /// The user provided input within the threshold.
    Active,
    /// No input for at least the threshold.
    Idle,
    /// The screen is locked.
    Locked,
}

impl IdleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Locked => "locked",
        }
    }

    /// Unknown state names count as active.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Self::Idle,
            "locked" => Self::Locked,
            _ => Self::Active,
        }
    }
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform facility reporting whether the user is providing input.
#[async_trait]
pub trait IdleOracle: Send + Sync {
    /// Query the state for an idle threshold in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PulseError::IdleQuery`] or a host error when
    /// the facility is unavailable.
    async fn query_state(&self, threshold_secs: u32) -> Result<IdleState>;
}

/// Query the oracle, reporting `Active` when the query fails.
///
/// Treating an unknown state as active means a disruptive activity is skipped
/// rather than run while the user might be typing.
pub async fn query_or_active(oracle: &dyn IdleOracle, threshold_secs: u32) -> IdleState {
    match oracle.query_state(threshold_secs).await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("idle query failed, assuming active: {e}");
            IdleState::Active
        }
    }
}

/// Oracle that always reports one state. Used when no platform facility exists.
#[derive(Debug, Clone, Copy)]
pub struct FixedIdleOracle(pub IdleState);

#[async_trait]
impl IdleOracle for FixedIdleOracle {
    async fn query_state(&self, _threshold_secs: u32) -> Result<IdleState> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::PulseError;

    struct FailingOracle;

    #[async_trait]
    impl IdleOracle for FailingOracle {
        async fn query_state(&self, _threshold_secs: u32) -> Result<IdleState> {
            Err(PulseError::IdleQuery("idle permission missing".to_owned()))
        }
    }

    #[tokio::test]
    async fn failed_query_fails_open_to_active() {
        assert_eq!(query_or_active(&FailingOracle, 60).await, IdleState::Active);
    }

    #[tokio::test]
    async fn successful_query_is_passed_through() {
        let oracle = FixedIdleOracle(IdleState::Locked);
        assert_eq!(query_or_active(&oracle, 60).await, IdleState::Locked);
    }

    #[test]
    fn lenient_parse_defaults_to_active() {
        assert_eq!(IdleState::parse_lenient("IDLE"), IdleState::Idle);
        assert_eq!(IdleState::parse_lenient("locked"), IdleState::Locked);
        assert_eq!(IdleState::parse_lenient("asleep"), IdleState::Active);
    }
}
