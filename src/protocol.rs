//! JSON frames exchanged over `/ws`.
//!
//! Every frame is an object with a `type` tag. Terminal bytes travel as
//! base64 strings so that partial UTF-8 sequences survive the trip.

use crate::error::{LifecycleError, ProvisionError, TerminalError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "login")]
    Login { username: String, password: String },

    #[serde(rename = "terminal.input")]
    TerminalInput {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    #[serde(rename = "terminal.resize")]
    TerminalResize { cols: u16, rows: u16 },

    #[serde(rename = "observe.start")]
    ObserveStart { username: String },

    #[serde(rename = "observe.stop")]
    ObserveStop { username: String },

    #[serde(rename = "presence.list")]
    PresenceList,

    #[serde(rename = "reset")]
    Reset { username: String },

    #[serde(rename = "extend")]
    Extend { username: String },

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "login.ok")]
    LoginOk {
        sandbox_id: String,
        created: bool,
        message: String,
    },

    #[serde(rename = "provision.progress")]
    ProvisionProgress { percent: u8, message: String },

    #[serde(rename = "terminal.output")]
    TerminalOutput {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    #[serde(rename = "terminal.exit")]
    TerminalExit,

    #[serde(rename = "observe.output")]
    ObserveOutput {
        username: String,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    #[serde(rename = "observe.ended")]
    ObserveEnded { username: String },

    #[serde(rename = "presence.users")]
    PresenceUsers { users: Vec<String> },

    #[serde(rename = "presence.joined")]
    PresenceJoined { username: String },

    #[serde(rename = "presence.left")]
    PresenceLeft { username: String },

    #[serde(rename = "presence.reset")]
    PresenceReset { username: String },

    #[serde(rename = "reset.ok")]
    ResetOk { sandbox_id: String, message: String },

    #[serde(rename = "extend.ok")]
    ExtendOk { deadline: DateTime<Utc> },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Stable, machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidIdentity,
    WeakCredential,
    AuthenticationFailed,
    ProvisionFailed,
    EngineUnavailable,
    SandboxNotFound,
    SpawnFailed,
    SessionNotFound,
    NotLoggedIn,
    Forbidden,
    Evicted,
    BadRequest,
    Internal,
}

impl From<&LifecycleError> for ErrorCode {
    fn from(err: &LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidIdentity(_) => ErrorCode::InvalidIdentity,
            LifecycleError::WeakCredential { .. } => ErrorCode::WeakCredential,
            LifecycleError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            LifecycleError::SandboxNotFound(_) => ErrorCode::SandboxNotFound,
            LifecycleError::Provision(ProvisionError::EngineUnavailable(_)) => {
                ErrorCode::EngineUnavailable
            }
            LifecycleError::Provision(_) => ErrorCode::ProvisionFailed,
            LifecycleError::Credentials(_) => ErrorCode::Internal,
        }
    }
}

impl From<&TerminalError> for ErrorCode {
    fn from(err: &TerminalError) -> Self {
        match err {
            TerminalError::SpawnError(_) => ErrorCode::SpawnFailed,
            TerminalError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            TerminalError::Io(_) => ErrorCode::Internal,
        }
    }
}

impl From<&LifecycleError> for ServerMessage {
    fn from(err: &LifecycleError) -> Self {
        ServerMessage::error(err.into(), err.to_string())
    }
}

impl From<&TerminalError> for ServerMessage {
    fn from(err: &TerminalError) -> Self {
        ServerMessage::error(err.into(), err.to_string())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
