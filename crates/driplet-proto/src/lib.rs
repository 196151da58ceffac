//! Shared wire definitions for agent ↔ relay communication.
//! Kept in a dedicated crate so the relay side can depend on the exact
//! shapes the agent emits without pulling in the agent runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A service the agent is authorized to stream logs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(rename = "logCommand", alias = "LogCommand", alias = "log_command")]
    pub log_command: String,
}

/// First frame sent on every relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAuthRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "serviceID")]
    pub service_id: String,
}

/// Traffic that follows the auth request on a relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StreamRecord", into = "StreamRecord")]
pub enum StreamMessage {
    LogLine {
        service_id: String,
        user_id: String,
        text: String,
    },
    Heartbeat {
        service_id: String,
        user_id: String,
    },
}

impl StreamMessage {
    pub fn log_line(
        service_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        StreamMessage::LogLine {
            service_id: service_id.into(),
            user_id: user_id.into(),
            text: text.into(),
        }
    }

    pub fn heartbeat(service_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        StreamMessage::Heartbeat {
            service_id: service_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn service_id(&self) -> &str {
        match self {
            StreamMessage::LogLine { service_id, .. } | StreamMessage::Heartbeat { service_id, .. } => {
                service_id
            }
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            StreamMessage::LogLine { .. } => MessageKind::Log,
            StreamMessage::Heartbeat { .. } => MessageKind::Heartbeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Log,
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Log => "log",
            MessageKind::Heartbeat => "heartbeat",
        }
    }
}

/// Flat record as transmitted: `{serviceID, userID, log?, heartbeat?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "serviceID")]
    pub service_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub heartbeat: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record carries both log text and a heartbeat flag")]
    Ambiguous,
    #[error("record carries neither log text nor a heartbeat flag")]
    Empty,
}

impl TryFrom<StreamRecord> for StreamMessage {
    type Error = RecordError;

    fn try_from(record: StreamRecord) -> Result<Self, Self::Error> {
        let text = record.log.filter(|text| !text.is_empty());
        match (text, record.heartbeat) {
            (Some(_), true) => Err(RecordError::Ambiguous),
            (None, false) => Err(RecordError::Empty),
            (Some(text), false) => Ok(StreamMessage::LogLine {
                service_id: record.service_id,
                user_id: record.user_id,
                text,
            }),
            (None, true) => Ok(StreamMessage::Heartbeat {
                service_id: record.service_id,
                user_id: record.user_id,
            }),
        }
    }
}

impl From<StreamMessage> for StreamRecord {
    fn from(message: StreamMessage) -> Self {
        match message {
            StreamMessage::LogLine {
                service_id,
                user_id,
                text,
            } => StreamRecord {
                service_id,
                user_id,
                log: Some(text),
                heartbeat: false,
            },
            StreamMessage::Heartbeat {
                service_id,
                user_id,
            } => StreamRecord {
                service_id,
                user_id,
                log: None,
                heartbeat: true,
            },
        }
    }
}

/// Anything the relay can receive from the agent, in the order it arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentFrame {
    Auth(SessionAuthRequest),
    Stream(StreamMessage),
}

impl AgentFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
