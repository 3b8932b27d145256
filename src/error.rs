//! Error types for the engine client.
//!
//! Transport failures are fatal to the session that raised them. Reply
//! decoding never errors: unrecognized replies degrade to raw text inside
//! [`crate::DecodedValue`].

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors raised by sessions, the port allocator and framing.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to connect to the application at {host}:{port} after {attempts} attempts: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },

    #[error("Application not initialised: session is not connected")]
    NotConnected,

    #[error("This session is already in use (connected on port {0})")]
    AlreadyInUse(u16),

    #[error("Transport error while {stage}: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed command template: {0}")]
    Template(#[from] TemplateError),

    #[error("No free port found after scanning {0} candidates")]
    PortExhausted(usize),

    #[error("Command batch of {0} bytes does not fit the length field")]
    FrameTooLarge(usize),

    #[error("Could not start the application: {0}")]
    SpawnFailed(String),

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LinkError {
    pub(crate) fn transport(stage: &'static str, source: std::io::Error) -> Self {
        LinkError::Transport { stage, source }
    }
}

/// Failures while expanding `{...}` regions of a command template.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("placeholder #{index} has no value ({available} values supplied)")]
    MissingValue { index: usize, available: usize },

    #[error("unknown name `{0}` in expression")]
    UnknownName(String),

    #[error("syntax error in expression `{expr}`: {reason}")]
    Syntax { expr: String, reason: String },

    #[error("cannot apply `{op}` to text in expression `{expr}`")]
    TypeMismatch { op: char, expr: String },

    #[error("division by zero in expression `{0}`")]
    DivisionByZero(String),

    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedQuote(usize),
}
