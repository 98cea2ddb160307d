//! Rule and global settings types.
//!
//! Rules are persisted in the settings store with the same camelCase keys the
//! browser extension uses (`intervalMinutes`, `globalEnabled`, ...). Parsing is
//! lenient: values written by older extension builds or edited by hand are
//! coerced instead of rejected, so one bad field never hides the whole rule set.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Interval used when a new rule does not specify one.
pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;

/// Milliseconds per rule interval minute.
const MINUTE_MS: u64 = 60_000;

/// Simulated activity performed inside a matching tab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    /// Synthetic mouse movement and click sequence.
    #[default]
    Mousemove,
    /// Small alternating scroll nudge.
    Scroll,
    /// Cache-busted HEAD request to the page URL.
    Ping,
    /// Full page reload. Only runs while the user is idle.
    Refresh,
}

impl Activity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mousemove => "mousemove",
            Self::Scroll => "scroll",
            Self::Ping => "ping",
            Self::Refresh => "refresh",
        }
    }

    /// Parse an activity name, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mousemove" => Some(Self::Mousemove),
            "scroll" => Some(Self::Scroll),
            "ping" => Some(Self::Ping),
            "refresh" => Some(Self::Refresh),
            _ => None,
        }
    }

    /// Whether the activity is disruptive enough to require an idle user.
    #[must_use]
    pub fn requires_idle(self) -> bool {
        self == Self::Refresh
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Toolbar theme preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dark => "dark",
            Self::Light => "light",
        }
    }

    /// Anything other than `light` is treated as dark.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("light") {
            Self::Light
        } else {
            Self::Dark
        }
    }
}

/// A user-declared policy mapping a URL pattern to a periodic activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Stable identifier, unique across the rule's lifetime.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Substring or glob pattern, see [`crate::matcher`].
    #[serde(default)]
    pub pattern: String,
    /// Minimum minutes between executions. Always at least 1 once parsed.
    #[serde(
        default = "default_interval_minutes",
        deserialize_with = "lenient_interval"
    )]
    pub interval_minutes: u32,
    #[serde(default, deserialize_with = "lenient_activity")]
    pub activity: Activity,
    /// Only an explicit `false` disables a rule.
    #[serde(default = "default_true", deserialize_with = "lenient_enabled")]
    pub enabled: bool,
}

impl Rule {
    /// Create an enabled rule with a fresh UUID.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        interval_minutes: u32,
        activity: Activity,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            pattern: pattern.into(),
            interval_minutes: interval_minutes.max(1),
            activity,
            enabled: true,
        }
    }

    /// Interval in minutes, coerced to at least 1.
    #[must_use]
    pub fn effective_interval_minutes(&self) -> u32 {
        self.interval_minutes.max(1)
    }

    /// Interval in milliseconds used by the due check.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        u64::from(self.effective_interval_minutes()) * MINUTE_MS
    }

    /// Whether the rule takes part in periodic ticks.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.pattern.trim().is_empty()
    }

    /// Whether a rule last executed at `last_run` (epoch ms) is due at `now`.
    #[must_use]
    pub fn is_due(&self, last_run: Option<u64>, now: u64) -> bool {
        match last_run {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval_ms(),
        }
    }
}

/// Global switches independent of the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// `false` short-circuits the whole scheduler.
    pub enabled: bool,
    pub theme: Theme,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            theme: Theme::Dark,
        }
    }
}

/// Contents of the settings store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true", deserialize_with = "lenient_enabled")]
    pub global_enabled: bool,
    #[serde(default, deserialize_with = "lenient_rules")]
    pub rules: Vec<Rule>,
    #[serde(default, deserialize_with = "lenient_theme")]
    pub theme: Theme,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            global_enabled: true,
            rules: Vec::new(),
            theme: Theme::Dark,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn global(&self) -> GlobalConfig {
        GlobalConfig {
            enabled: self.global_enabled,
            theme: self.theme,
        }
    }

    #[must_use]
    pub fn rule(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == rule_id)
    }
}

fn default_interval_minutes() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn coerce_interval(value: &serde_json::Value) -> u32 {
    let minutes = match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(1),
        serde_json::Value::String(s) => s.trim().parse::<i64>().unwrap_or(1),
        _ => 1,
    };
    u32::try_from(minutes.max(1)).unwrap_or(u32::MAX)
}

fn lenient_interval<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_interval(&value))
}

fn lenient_activity<'de, D>(deserializer: D) -> Result<Activity, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(Activity::parse)
        .unwrap_or_default())
}

fn lenient_enabled<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(!matches!(value, Some(serde_json::Value::Bool(false))))
}

fn lenient_theme<'de, D>(deserializer: D) -> Result<Theme, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .map(Theme::parse_lenient)
        .unwrap_or_default())
}

fn lenient_rules<'de, D>(deserializer: D) -> Result<Vec<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(serde_json::Value::Array(entries)) = value else {
        return Ok(Vec::new());
    };

    let mut rules = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_null() {
            continue;
        }
        match serde_json::from_value::<Rule>(entry) {
            Ok(rule) => rules.push(rule),
            Err(e) => tracing::warn!("ignoring malformed stored rule: {e}"),
        }
    }
    Ok(rules)
}
