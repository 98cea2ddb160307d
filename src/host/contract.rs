//! Versioned host envelopes exchanged with the browser extension.
//!
//! Four frame kinds travel over the bridge:
//!
//! - extension -> host: [`CommandEnvelope`] (answered by [`ResponseEnvelope`])
//!   and [`ReplyEnvelope`] (answer to a host call).
//! - host -> extension: [`EventEnvelope`] (fire and forget) and
//!   [`CallEnvelope`] (answered by a [`ReplyEnvelope`]).

use serde::{Deserialize, Serialize};

/// Contract version for every envelope.
pub const EVENT_VERSION: u32 = 1;

/// Status snapshot changed.
pub const EVENT_STATUS_CHANGED: &str = "status.changed";
/// Rule set changed (create, update, delete).
pub const EVENT_RULES_CHANGED: &str = "rules.changed";
/// Global toggle or theme changed.
pub const EVENT_SETTINGS_CHANGED: &str = "settings.changed";
/// A tick finished; payload is the tick report.
pub const EVENT_HEARTBEAT_COMPLETED: &str = "heartbeat.completed";

/// Commands accepted from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "host.version")]
    HostVersion,
    #[serde(rename = "heartbeat.force")]
    HeartbeatForce,
    #[serde(rename = "rule.run")]
    RuleRun,
    #[serde(rename = "status.get")]
    StatusGet,
    #[serde(rename = "rules.list")]
    RulesList,
    #[serde(rename = "rules.create")]
    RulesCreate,
    #[serde(rename = "rules.update")]
    RulesUpdate,
    #[serde(rename = "rules.delete")]
    RulesDelete,
    #[serde(rename = "rules.overview")]
    RulesOverview,
    #[serde(rename = "settings.get")]
    SettingsGet,
    #[serde(rename = "settings.patch")]
    SettingsPatch,
    #[serde(rename = "runtime.startup")]
    RuntimeStartup,
    #[serde(rename = "runtime.installed")]
    RuntimeInstalled,
    #[serde(rename = "runtime.stop")]
    RuntimeStop,
    #[serde(rename = "tab.removed")]
    TabRemoved,
    #[serde(rename = "tab.updated")]
    TabUpdated,
}

impl CommandName {
    /// Every command, in wire order.
    pub const ALL: [Self; 17] = [
        Self::HostPing,
        Self::HostVersion,
        Self::HeartbeatForce,
        Self::RuleRun,
        Self::StatusGet,
        Self::RulesList,
        Self::RulesCreate,
        Self::RulesUpdate,
        Self::RulesDelete,
        Self::RulesOverview,
        Self::SettingsGet,
        Self::SettingsPatch,
        Self::RuntimeStartup,
        Self::RuntimeInstalled,
        Self::RuntimeStop,
        Self::TabRemoved,
        Self::TabUpdated,
    ];

    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::HostVersion => "host.version",
            Self::HeartbeatForce => "heartbeat.force",
            Self::RuleRun => "rule.run",
            Self::StatusGet => "status.get",
            Self::RulesList => "rules.list",
            Self::RulesCreate => "rules.create",
            Self::RulesUpdate => "rules.update",
            Self::RulesDelete => "rules.delete",
            Self::RulesOverview => "rules.overview",
            Self::SettingsGet => "settings.get",
            Self::SettingsPatch => "settings.patch",
            Self::RuntimeStartup => "runtime.startup",
            Self::RuntimeInstalled => "runtime.installed",
            Self::RuntimeStop => "runtime.stop",
            Self::TabRemoved => "tab.removed",
            Self::TabUpdated => "tab.updated",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.as_str() == raw)
    }
}

/// Calls the host makes into the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallName {
    /// List all tabs. Reply: `[{id, url}]`.
    #[serde(rename = "tabs.query")]
    TabsQuery,
    /// Install the in-page capability. Payload: `{tabId}`.
    #[serde(rename = "tab.prepare")]
    TabPrepare,
    /// Run an activity. Payload: `{tabId, payload}`. Reply: `{performed}`.
    #[serde(rename = "tab.invoke")]
    TabInvoke,
    /// Payload: `{thresholdSecs}`. Reply: `{state}`.
    #[serde(rename = "idle.query")]
    IdleQuery,
    /// Payload: `{text}`.
    #[serde(rename = "action.badge")]
    ActionBadge,
    /// Payload: `{theme}`.
    #[serde(rename = "action.icon")]
    ActionIcon,
}

impl CallName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TabsQuery => "tabs.query",
            Self::TabPrepare => "tab.prepare",
            Self::TabInvoke => "tab.invoke",
            Self::IdleQuery => "idle.query",
            Self::ActionBadge => "action.badge",
            Self::ActionIcon => "action.icon",
        }
    }
}

/// A versioned response envelope from host -> extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned command envelope from extension -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        validate_header(self.v, "request_id", &self.request_id)
    }
}

/// A versioned event envelope from host -> extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }
}

/// A versioned call from host -> extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub v: u32,
    pub call_id: String,
    pub call: CallName,
    pub payload: serde_json::Value,
}

impl CallEnvelope {
    #[must_use]
    pub fn new(call_id: impl Into<String>, call: CallName, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            call_id: call_id.into(),
            call,
            payload,
        }
    }
}

/// The extension's answer to a [`CallEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub v: u32,
    pub call_id: String,
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn ok(call_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            call_id: call_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            call_id: call_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        validate_header(self.v, "call_id", &self.call_id)
    }
}

/// One inbound line, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Command(CommandEnvelope),
    Reply(ReplyEnvelope),
}

impl InboundFrame {
    /// Parse one JSON line. Frames carrying `call_id` are replies; everything
    /// else must be a command.
    pub fn parse(line: &str) -> Result<Self, ContractError> {
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            ContractError::new(ContractErrorKind::Malformed, format!("invalid JSON: {e}"))
        })?;

        let is_reply = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("call_id"));
        if is_reply {
            let reply: ReplyEnvelope = serde_json::from_value(value).map_err(|e| {
                ContractError::new(ContractErrorKind::Malformed, format!("invalid reply: {e}"))
            })?;
            reply.validate()?;
            Ok(Self::Reply(reply))
        } else {
            let command: CommandEnvelope = serde_json::from_value(value).map_err(|e| {
                ContractError::new(ContractErrorKind::Malformed, format!("invalid command: {e}"))
            })?;
            Ok(Self::Command(command))
        }
    }
}

fn validate_header(v: u32, id_field: &str, id: &str) -> Result<(), ContractError> {
    if v != EVENT_VERSION {
        return Err(ContractError::new(
            ContractErrorKind::UnsupportedVersion,
            format!("unsupported contract version {v}; expected {EVENT_VERSION}"),
        ));
    }
    if id.trim().is_empty() {
        return Err(ContractError::new(
            ContractErrorKind::InvalidEnvelope,
            format!("{id_field} cannot be empty"),
        ));
    }
    Ok(())
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
    /// Not JSON, or JSON of the wrong shape.
    Malformed,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}
