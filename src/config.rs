//! Connection and transfer tunables.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default engine port.
pub const DEFAULT_PORT: u16 = 5101;
/// Default number of connection attempts before giving up.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
/// Default maximum bytes requested per `read` call.
///
/// 4096 is the more stable choice, 8192 is faster on a responsive engine.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 4096;
/// Default pause between payload chunks, in milliseconds.
pub const DEFAULT_CHUNK_DELAY_MS: u64 = 10;
/// Width of the ASCII length field in both request and reply frames.
pub const DEFAULT_LENGTH_FIELD_WIDTH: usize = 20;

/// Tunables for a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Port used when the caller does not name one.
    pub default_port: u16,
    /// Connection attempts before the session is marked failed.
    pub connect_attempts: u32,
    /// Upper bound on bytes requested per read while receiving a payload.
    pub max_chunk_size: usize,
    /// Pause between chunk reads, in milliseconds.
    pub chunk_delay_ms: u64,
    /// Width of the length field framing every message.
    pub length_field_width: usize,
    /// Socket read timeout in milliseconds; `None` blocks indefinitely.
    pub read_timeout_ms: Option<u64>,
    /// Socket write timeout in milliseconds; `None` blocks indefinitely.
    pub write_timeout_ms: Option<u64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunk_delay_ms: DEFAULT_CHUNK_DELAY_MS,
            length_field_width: DEFAULT_LENGTH_FIELD_WIDTH,
            read_timeout_ms: None,
            write_timeout_ms: None,
        }
    }
}

impl LinkConfig {
    /// Load a configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("{}: {}", path.display(), e)))?;
        let config: LinkConfig = serde_json::from_str(&text)
            .map_err(|e| LinkError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the transfer loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.connect_attempts == 0 {
            return Err(LinkError::Config("connect_attempts must be at least 1".into()));
        }
        if self.max_chunk_size == 0 {
            return Err(LinkError::Config("max_chunk_size must be at least 1".into()));
        }
        if self.length_field_width < 2 {
            return Err(LinkError::Config(
                "length_field_width must be at least 2".into(),
            ));
        }
        Ok(())
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}
