//! Post-handshake message formats.
//!
//! Inbound: `{op: "subscribe"|"unsubscribe", scope}` (plus `ping`).
//! Outbound: event frames (see [`crate::Event`]) and control frames whose
//! `type` carries the reserved `session.` prefix.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use labflow_core::{ConnectionId, OrganizationId, ScopeRef, UserId};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl WireError {
    pub fn code(&self) -> &'static str {
        "malformed_message"
    }
}

/// Message sent by a client after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { scope: ScopeRef },
    Unsubscribe { scope: ScopeRef },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Session control frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "session.ready")]
    Ready {
        connection_id: ConnectionId,
        user_id: UserId,
        organization_id: OrganizationId,
    },
    #[serde(rename = "session.subscribed")]
    Subscribed { scope: ScopeRef },
    #[serde(rename = "session.unsubscribed")]
    Unsubscribed { scope: ScopeRef },
    #[serde(rename = "session.error")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<ScopeRef>,
    },
    #[serde(rename = "session.resync")]
    Resync { dropped: u64 },
    #[serde(rename = "session.evicted")]
    Evicted { reason: String },
    #[serde(rename = "session.pong")]
    Pong,
}

impl ControlFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>, scope: Option<ScopeRef>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            scope,
        }
    }

    pub fn to_text(&self) -> String {
        // Control frames contain only strings, ids and integers.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"session.error"}"#.to_string())
    }
}
