//! Settings store: rules, global toggle and theme.

use crate::error::{PulseError, Result};
use crate::rules::{Activity, DEFAULT_INTERVAL_MINUTES, GlobalConfig, Rule, Settings, Theme};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Fields for a new rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RuleDraft {
    /// Validate and turn the draft into a rule with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::InvalidRequest`] when the name or pattern is
    /// blank or the interval is zero.
    pub fn into_rule(self) -> Result<Rule> {
        let name = self.name.trim();
        let pattern = self.pattern.trim();
        if name.is_empty() || pattern.is_empty() {
            return Err(PulseError::InvalidRequest(
                "name and pattern are required".to_owned(),
            ));
        }
        let interval = self.interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES);
        validate_interval(interval)?;

        let mut rule = Rule::new(name, pattern, interval, self.activity.unwrap_or_default());
        rule.enabled = self.enabled.unwrap_or(true);
        Ok(rule)
    }
}

/// Partial update of an existing rule. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RulePatch {
    fn apply(self, rule: &mut Rule) -> Result<()> {
        if let Some(name) = self.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(PulseError::InvalidRequest("name cannot be empty".to_owned()));
            }
            rule.name = name.to_owned();
        }
        if let Some(pattern) = self.pattern {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                return Err(PulseError::InvalidRequest(
                    "pattern cannot be empty".to_owned(),
                ));
            }
            rule.pattern = pattern.to_owned();
        }
        if let Some(interval) = self.interval_minutes {
            validate_interval(interval)?;
            rule.interval_minutes = interval;
        }
        if let Some(activity) = self.activity {
            rule.activity = activity;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        Ok(())
    }
}

/// Partial update of the global settings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default)]
    pub global_enabled: Option<bool>,
    #[serde(default)]
    pub theme: Option<Theme>,
}

impl SettingsPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.global_enabled.is_none() && self.theme.is_none()
    }
}

fn validate_interval(minutes: u32) -> Result<()> {
    if minutes == 0 {
        return Err(PulseError::InvalidRequest(
            "intervalMinutes must be at least 1".to_owned(),
        ));
    }
    Ok(())
}

fn default_document() -> serde_json::Map<String, serde_json::Value> {
    let mut doc = serde_json::Map::new();
    doc.insert("globalEnabled".to_owned(), serde_json::Value::Bool(true));
    doc.insert("rules".to_owned(), serde_json::Value::Array(Vec::new()));
    doc.insert(
        "theme".to_owned(),
        serde_json::Value::String(Theme::Dark.as_str().to_owned()),
    );
    doc
}

/// Whether a stored value must be replaced by its default.
fn needs_default(key: &str, value: Option<&serde_json::Value>) -> bool {
    use serde_json::Value;
    match (key, value) {
        ("globalEnabled", Some(Value::Bool(_))) | ("rules", Some(Value::Array(_))) => false,
        ("globalEnabled" | "rules", _) => true,
        (_, None | Some(Value::Null | Value::Bool(false))) => true,
        (_, Some(Value::String(s))) => s.is_empty(),
        _ => false,
    }
}

fn parse_settings(value: serde_json::Value) -> Result<Settings> {
    serde_json::from_value(value)
        .map_err(|e| PulseError::Storage(format!("cannot parse settings: {e}")))
}

/// Store for [`Settings`], backed by `settings.json`.
pub struct SettingsStore {
    path: Option<PathBuf>,
    state: Mutex<Settings>,
}

impl SettingsStore {
    /// Open the store at `path`, loading the existing document if any.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Storage`] when the file exists but cannot be read
    /// or parsed. The file is never overwritten in that case.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = match super::read_json(&path)? {
            Some(value) => parse_settings(value)?,
            None => Settings::default(),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(settings),
        })
    }

    /// Store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_settings(Settings::default())
    }

    /// In-memory store seeded with `settings`.
    #[must_use]
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            path: None,
            state: Mutex::new(settings),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current settings.
    pub async fn load(&self) -> Settings {
        self.state.lock().await.clone()
    }

    pub async fn global(&self) -> GlobalConfig {
        self.state.lock().await.global()
    }

    pub async fn rules(&self) -> Vec<Rule> {
        self.state.lock().await.rules.clone()
    }

    pub async fn rule(&self, rule_id: &str) -> Option<Rule> {
        self.state.lock().await.rule(rule_id).cloned()
    }

    /// Write defaults for any missing or mistyped key, leaving valid values
    /// untouched.
    ///
    /// Returns `true` when the file was changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub async fn ensure_defaults(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };

        let mut doc = match super::read_json(path)? {
            Some(serde_json::Value::Object(doc)) => doc,
            Some(_) | None => serde_json::Map::new(),
        };

        let mut changed = false;
        for (key, value) in default_document() {
            if needs_default(&key, doc.get(&key)) {
                doc.insert(key, value);
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }

        let doc = serde_json::Value::Object(doc);
        super::write_json_atomic(path, &doc)?;
        *state = parse_settings(doc)?;
        tracing::info!("wrote default settings to {}", path.display());
        Ok(true)
    }

    /// Apply `f` to a copy of the settings, persist, then commit.
    async fn mutate<R>(&self, f: impl FnOnce(&mut Settings) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = f(&mut next)?;
        if let Some(path) = self.path.as_deref() {
            super::write_json_atomic(path, &next)?;
        }
        *state = next;
        Ok(out)
    }

    /// Validate `draft` and append it as a new rule.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::InvalidRequest`] for an invalid draft, or a
    /// storage error.
    pub async fn create_rule(&self, draft: RuleDraft) -> Result<Rule> {
        let rule = draft.into_rule()?;
        self.mutate(|settings| {
            settings.rules.push(rule.clone());
            Ok(rule)
        })
        .await
    }

    /// Apply `patch` to the rule with `rule_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::NotFound`] for an unknown id,
    /// [`PulseError::InvalidRequest`] for invalid fields, or a storage error.
    pub async fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<Rule> {
        self.mutate(|settings| {
            let rule = settings
                .rules
                .iter_mut()
                .find(|rule| rule.id == rule_id)
                .ok_or_else(|| PulseError::NotFound(format!("rule {rule_id}")))?;
            patch.apply(rule)?;
            Ok(rule.clone())
        })
        .await
    }

    /// Remove the rule with `rule_id` and return it.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::NotFound`] for an unknown id, or a storage error.
    pub async fn delete_rule(&self, rule_id: &str) -> Result<Rule> {
        self.mutate(|settings| {
            let index = settings
                .rules
                .iter()
                .position(|rule| rule.id == rule_id)
                .ok_or_else(|| PulseError::NotFound(format!("rule {rule_id}")))?;
            Ok(settings.rules.remove(index))
        })
        .await
    }

    /// Update the global toggle and/or theme.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn patch_global(&self, patch: SettingsPatch) -> Result<GlobalConfig> {
        self.mutate(|settings| {
            if let Some(enabled) = patch.global_enabled {
                settings.global_enabled = enabled;
            }
            if let Some(theme) = patch.theme {
                settings.theme = theme;
            }
            Ok(settings.global())
        })
        .await
    }
}
