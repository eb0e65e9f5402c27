use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
/// Dispatch mode a room applies to incoming turns.
pub enum RoomMode {
    #[default]
    Manual,
    Roundtable,
    Orchestrator,
}

impl RoomMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomMode::Manual => "manual",
            RoomMode::Roundtable => "roundtable",
            RoomMode::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for RoomMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(RoomMode::Manual),
            "roundtable" => Ok(RoomMode::Roundtable),
            "orchestrator" => Ok(RoomMode::Orchestrator),
            other => Err(format!(
                "unsupported room mode '{other}' (expected manual, roundtable or orchestrator)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `Room` used across Agora components.
pub struct Room {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub owner_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default)]
    pub current_mode: RoomMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_mode: Option<RoomMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Body of `POST /rooms`.
pub struct RoomDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl RoomDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goal: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn validate(&self) -> Result<(), AgoraError> {
        require_non_empty("room name", &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `Agent` used across Agora components.
pub struct Agent {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub key: String,
    pub name: String,
    pub model_alias: String,
    #[serde(default)]
    pub role_prompt: String,
    #[serde(default)]
    pub tool_permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Body of `POST /agents`.
pub struct AgentDraft {
    pub key: String,
    pub name: String,
    pub model_alias: String,
    #[serde(default)]
    pub role_prompt: String,
    #[serde(default)]
    pub tool_permissions: Vec<String>,
}

impl AgentDraft {
    pub fn validate(&self) -> Result<(), AgoraError> {
        require_non_empty("agent key", &self.key)?;
        require_non_empty("agent name", &self.name)?;
        require_non_empty("agent model alias", &self.model_alias)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Assignment of an agent to a room; `position` orders sequential dispatch.
pub struct RoomAgent {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_id_or_empty")]
    pub room_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub agent_id: String,
    #[serde(default)]
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Body of `POST /rooms/{id}/agents`.
pub struct RoomAgentDraft {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `Session` used across Agora components.
pub struct Session {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_id_or_empty")]
    pub room_id: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
/// Body of `POST /rooms/{id}/sessions`.
pub struct SessionDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One user-input to assistant-output cycle, as returned by the server.
pub struct Turn {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_id_or_empty")]
    pub session_id: String,
    #[serde(default)]
    pub turn_index: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_used: Option<RoomMode>,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub assistant_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_model: Option<String>,
    #[serde(default)]
    pub summary_triggered: bool,
    #[serde(default)]
    pub prune_triggered: bool,
    #[serde(default)]
    pub overflow_rejected: bool,
    #[serde(default)]
    pub low_balance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageRole` values.
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `Message` used across Agora components.
pub struct Message {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_id_or_empty")]
    pub session_id: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Body shared by the streaming and synchronous turn endpoints.
pub struct TurnRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_alias_override: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            model_alias_override: None,
        }
    }

    pub fn with_model_alias_override(mut self, alias: impl Into<String>) -> Self {
        self.model_alias_override = Some(alias.into());
        self
    }

    pub fn validate(&self) -> Result<(), AgoraError> {
        require_non_empty("turn message", &self.message)
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `AgoraError` values.
pub enum AgoraError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request to {endpoint} exceeded deadline of {timeout_ms}ms")]
    DeadlineExceeded { endpoint: String, timeout_ms: u64 },
    #[error("server returned status {status}: {detail}")]
    HttpStatus { status: u16, detail: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("session {session_id} already has a turn in flight")]
    TurnInFlight { session_id: String },
    #[error("turn cancelled")]
    Cancelled,
    #[error("turn failed after synchronous fallback: {fallback} (stream error: {stream})")]
    TurnFailed {
        input: TurnRequest,
        stream: Box<AgoraError>,
        fallback: Box<AgoraError>,
    },
}

impl AgoraError {
    /// The turn input the caller submitted, when the failure kept it for a retry.
    pub fn preserved_input(&self) -> Option<&TurnRequest> {
        match self {
            AgoraError::TurnFailed { input, .. } => Some(input),
            _ => None,
        }
    }

    /// Short message suitable for showing next to the failed action.
    pub fn user_message(&self) -> String {
        match self {
            AgoraError::HttpStatus { detail, .. } => detail.clone(),
            AgoraError::Validation(message) => message.clone(),
            AgoraError::TurnFailed { fallback, .. } => fallback.user_message(),
            other => other.to_string(),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), AgoraError> {
    if value.trim().is_empty() {
        return Err(AgoraError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Servers may emit identifiers as strings or integers; both map to a string.
pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_id(&value)
        .ok_or_else(|| serde::de::Error::custom("expected a string or integer identifier"))
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_to_id(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected a string or integer identifier")),
    }
}

fn deserialize_id_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_id(deserializer)?.unwrap_or_default())
}
