//! Session state and report types.

use crate::protocol::DecodedValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No socket. Initial state, and the state after close or a transport error.
    Disconnected,
    /// Connection attempts in progress.
    Connecting,
    /// Ready for `execute`.
    Connected,
    /// Every connection attempt failed.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Information about a session (serializable for status output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// Engine host name or address.
    pub host: Option<String>,
    /// Engine port the session is connected to.
    pub port: Option<u16>,
    pub state: SessionState,
    /// When the connection was established.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// Commands sent since connecting.
    pub commands_sent: u64,
    /// Replies that arrived shorter than announced.
    pub truncated_replies: u64,
}

/// Outcome of a successful `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    /// Port actually connected to.
    pub port: u16,
    /// Port the caller asked for, if it was taken and replaced.
    pub substituted_from: Option<u16>,
    /// Failed attempts before the connection succeeded.
    pub failed_attempts: u32,
}

impl ConnectReport {
    /// Status text in the engine client's traditional wording; empty when
    /// nothing noteworthy happened.
    pub fn notes(&self) -> String {
        match self.substituted_from {
            Some(requested) => format!(
                "Port No: {} is not available\nUsing Port No: {} instead.\n",
                requested, self.port
            ),
            None => String::new(),
        }
    }
}

/// Whether a reply payload arrived in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Integrity {
    Complete,
    /// Fewer bytes than the length header announced. The chunk size or delay
    /// is likely too aggressive for this payload.
    Truncated { expected: usize, received: usize },
    /// A read timed out before the payload was complete. The rest of the
    /// payload may still arrive, so the session that read it is closed.
    Interrupted { expected: usize, received: usize },
}

/// A decoded reply together with its transfer integrity.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub value: DecodedValue,
    pub integrity: Integrity,
}

impl Reply {
    pub fn is_complete(&self) -> bool {
        self.integrity == Integrity::Complete
    }
}
