//! Connection and payload error types.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::TransportKind;

/// Failures of the real-time connection, as delivered to the caller's
/// error handler.
///
/// Heartbeat and connection timeouts are funneled into the same reconnect
/// path as transport errors; only terminal variants ever reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport could not even be started (unsupported, bad URL, no runtime).
    #[error("{kind} transport could not be constructed: {message}")]
    Construction { kind: TransportKind, message: String },

    /// The transport reported an error or closed unexpectedly.
    #[error("{kind} transport failed: {message}")]
    Transport { kind: TransportKind, message: String },

    /// The transport did not open within the configured timeout.
    #[error("{kind} connection timed out after {after:?}")]
    ConnectionTimeout { kind: TransportKind, after: Duration },

    /// No inbound activity within twice the heartbeat interval.
    #[error("{kind} heartbeat timed out: no activity for {after:?}")]
    HeartbeatTimeout { kind: TransportKind, after: Duration },

    /// The server rejected the post-open authentication message.
    #[error("{kind} authentication rejected: {message}")]
    AuthRejected { kind: TransportKind, message: String },

    /// Every reconnection attempt failed.
    #[error("{kind} gave up after {attempts} reconnection attempts: {last_error}")]
    Exhausted {
        kind: TransportKind,
        attempts: u32,
        last_error: String,
    },

    /// Neither transport kind is available.
    #[error("no supported transport: {message}")]
    Unsupported { message: String },
}

impl ConnectionError {
    /// Transport kind the error originated from, if any.
    pub fn kind(&self) -> Option<TransportKind> {
        match self {
            ConnectionError::Construction { kind, .. }
            | ConnectionError::Transport { kind, .. }
            | ConnectionError::ConnectionTimeout { kind, .. }
            | ConnectionError::HeartbeatTimeout { kind, .. }
            | ConnectionError::AuthRejected { kind, .. }
            | ConnectionError::Exhausted { kind, .. } => Some(*kind),
            ConnectionError::Unsupported { .. } => None,
        }
    }

    /// Terminal errors end a connection session; the others trigger a
    /// reconnect attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Construction { .. }
                | ConnectionError::AuthRejected { .. }
                | ConnectionError::Exhausted { .. }
                | ConnectionError::Unsupported { .. }
        )
    }
}

/// A malformed inbound payload. Logged and dropped, never surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("invalid notification: {0}")]
    InvalidNotification(String),
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}
