use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First command id handed out after start or wrap-around
pub const COMMAND_ID_INITIAL: u32 = 10;
/// Largest command id before the counter wraps
pub const COMMAND_ID_MAX: u32 = 1_000_000;

/// Outbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Overwritten by the connection when the command is sent
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub feature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Get,
    Set,
}

/// Inbound result or notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Inbound message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Result,
    Notify,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Command {
    /// Create a `get` request for a feature
    pub fn get(feature: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind: CommandKind::Get,
            feature: feature.into(),
            value: None,
        }
    }

    /// Create a `set` request for a feature
    pub fn set(feature: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            id: 0,
            kind: CommandKind::Set,
            feature: feature.into(),
            value: Some(value.into()),
        }
    }
}

impl Message {
    /// Whether this is a result for the given feature
    pub fn is_result_for(&self, feature: &str) -> bool {
        self.kind == MessageKind::Result && self.feature.as_deref() == Some(feature)
    }

    /// Whether this is a result acknowledging a `set`
    pub fn is_ack(&self) -> bool {
        self.kind == MessageKind::Result && self.value.as_ref().is_some_and(crate::types::is_ack)
    }
}

/// Hands out command ids, wrapping back to the initial value after the maximum
#[derive(Debug, Clone)]
pub(crate) struct CommandIds {
    last: u32,
}

impl CommandIds {
    pub(crate) fn new() -> Self {
        Self {
            last: COMMAND_ID_INITIAL,
        }
    }

    pub(crate) fn next_id(&mut self) -> u32 {
        self.last += 1;
        if self.last > COMMAND_ID_MAX {
            self.last = COMMAND_ID_INITIAL;
        }
        self.last
    }
}
