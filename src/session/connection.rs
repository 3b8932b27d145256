//! A single connection to the engine's command interpreter.
//!
//! The protocol is strictly request/response: each flush sends one framed
//! batch and reads exactly one framed reply. `execute` borrows the session
//! mutably, so one owner can never interleave two requests; sharing a
//! session between threads needs an outer lock.

use super::port_allocator::PortAllocator;
use super::types::{ConnectReport, Integrity, Reply, SessionInfo, SessionState};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{
    decode, encode_request, interpolate, parse_length_header, DecodedValue, Namespace,
    ReplyHeader, TemplateValue,
};
use chrono::{DateTime, Utc};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STAGE_CONFIGURE: &str = "configuring socket";
const STAGE_SEND: &str = "sending command batch";
const STAGE_HEADER: &str = "receiving reply header";
const STAGE_PAYLOAD: &str = "receiving reply payload";

/// Commands queued client-side until the next flush.
#[derive(Debug, Default, Clone)]
pub struct CommandBatch {
    commands: Vec<String>,
}

impl CommandBatch {
    /// Queue a command, terminating it with `;`. The engine tolerates the
    /// extra semicolon when the command already ends with one.
    pub fn push(&mut self, command: &str) {
        self.commands.push(format!("{};", command));
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Take the concatenated batch text, leaving the batch empty.
    fn take_text(&mut self) -> String {
        let text = self.commands.concat();
        self.commands.clear();
        text
    }
}

/// A connection to one engine instance.
pub struct Session {
    id: String,
    config: LinkConfig,
    ports: Arc<PortAllocator>,
    stream: Option<TcpStream>,
    host: Option<String>,
    port: Option<u16>,
    state: SessionState,
    pending: CommandBatch,
    namespace: Namespace,
    connected_at: Option<DateTime<Utc>>,
    commands_sent: u64,
    truncated_replies: u64,
}

impl Session {
    /// Create a disconnected session using the process-wide port allocator.
    pub fn new(config: LinkConfig) -> Self {
        Self::with_allocator(config, PortAllocator::global())
    }

    /// Create a disconnected session with its own port bookkeeping.
    pub fn with_allocator(config: LinkConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            ports,
            stream: None,
            host: None,
            port: None,
            state: SessionState::Disconnected,
            pending: CommandBatch::default(),
            namespace: Namespace::new(),
            connected_at: None,
            commands_sent: 0,
            truncated_replies: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Port of the current connection.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Names available to `{...}` regions of command templates.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    /// Commands queued by [`add_command`](Self::add_command) and not yet sent.
    pub fn pending(&self) -> &CommandBatch {
        &self.pending
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            state: self.state,
            connected_at: self.connected_at,
            commands_sent: self.commands_sent,
            truncated_replies: self.truncated_replies,
        }
    }

    /// Connect to an engine that is already serving on `host:port`.
    ///
    /// If another session in this process holds `port`, the next free port
    /// is used instead and the report says so.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<ConnectReport> {
        self.ensure_unused()?;
        let (port, substituted_from) = self.select_port(port)?;
        let mut report = self.connect_to(host, port)?;
        report.substituted_from = substituted_from;
        Ok(report)
    }

    /// Launch the engine executable serving on `port`, then connect to it.
    ///
    /// The engine is started detached with `-pt <port>` from its own
    /// directory and keeps running after this session closes.
    pub fn start_app(&mut self, executable: impl AsRef<Path>, port: u16) -> Result<ConnectReport> {
        let executable = executable.as_ref();
        self.ensure_unused()?;
        let (port, substituted_from) = self.select_port(port)?;

        let mut command = Command::new(executable);
        command
            .arg("-pt")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = executable.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let child = command
            .spawn()
            .map_err(|e| LinkError::SpawnFailed(format!("{}: {}", executable.display(), e)))?;
        info!(
            executable = %executable.display(),
            pid = child.id(),
            port = port,
            "Started application"
        );

        let mut report = self.connect_to("localhost", port)?;
        report.substituted_from = substituted_from;
        Ok(report)
    }

    fn ensure_unused(&self) -> Result<()> {
        match (&self.stream, self.port) {
            (Some(_), Some(port)) => Err(LinkError::AlreadyInUse(port)),
            _ => Ok(()),
        }
    }

    fn select_port(&self, requested: u16) -> Result<(u16, Option<u16>)> {
        if self.ports.is_available(requested) {
            return Ok((requested, None));
        }
        let port = self.ports.next_available()?;
        warn!(requested = requested, using = port, "Port is not available");
        Ok((port, Some(requested)))
    }

    fn connect_to(&mut self, host: &str, port: u16) -> Result<ConnectReport> {
        self.state = SessionState::Connecting;
        info!(host = %host, port = port, "Attempting to connect to application");

        let attempts = self.config.connect_attempts;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match TcpStream::connect((host, port)) {
                Ok(stream) => {
                    self.attach(stream, host, port)?;
                    return Ok(ConnectReport {
                        port,
                        substituted_from: None,
                        failed_attempts: attempt - 1,
                    });
                }
                Err(e) => {
                    debug!(attempt = attempt, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        self.state = SessionState::Failed;
        error!(host = %host, port = port, attempts = attempts, "Failed to connect to the application");
        Err(LinkError::ConnectFailed {
            host: host.to_string(),
            port,
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    fn attach(&mut self, stream: TcpStream, host: &str, port: u16) -> Result<()> {
        let configured = stream
            .set_read_timeout(self.config.read_timeout())
            .and_then(|_| stream.set_write_timeout(self.config.write_timeout()));
        if let Err(e) = configured {
            self.state = SessionState::Failed;
            return Err(LinkError::transport(STAGE_CONFIGURE, e));
        }
        let _ = stream.set_nodelay(true);

        self.ports.reserve(port);
        self.stream = Some(stream);
        self.host = Some(host.to_string());
        self.port = Some(port);
        self.state = SessionState::Connected;
        self.connected_at = Some(Utc::now());
        info!(session_id = %self.id, host = %host, port = port, "Connected to application");
        Ok(())
    }

    /// Expand a command template and queue it without sending.
    pub fn add_command(&mut self, command: &str, values: &[TemplateValue]) -> Result<()> {
        let expanded = interpolate(command, values, &self.namespace)?;
        self.pending.push(&expanded);
        Ok(())
    }

    /// Queue `command` behind any pending commands, send the batch and
    /// return the decoded reply.
    pub fn execute(&mut self, command: &str, values: &[TemplateValue]) -> Result<DecodedValue> {
        self.execute_with_report(command, values)
            .map(|reply| reply.value)
    }

    /// Like [`execute`](Self::execute), also reporting whether the reply
    /// arrived in full.
    pub fn execute_with_report(
        &mut self,
        command: &str,
        values: &[TemplateValue],
    ) -> Result<Reply> {
        if self.stream.is_none() {
            return Err(LinkError::NotConnected);
        }
        self.add_command(command, values)?;
        self.flush()
    }

    /// Send the pending batch and read the reply. An empty batch sends
    /// nothing.
    pub fn flush(&mut self) -> Result<Reply> {
        if self.stream.is_none() {
            return Err(LinkError::NotConnected);
        }
        if self.pending.is_empty() {
            return Ok(Reply {
                value: DecodedValue::Empty,
                integrity: Integrity::Complete,
            });
        }

        let count = self.pending.len();
        let batch = self.pending.take_text();
        let frame = encode_request(&batch, self.config.length_field_width)?;
        debug!(session_id = %self.id, commands = count, bytes = frame.len(), "Sending command batch");

        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        if let Err(e) = stream.write_all(&frame).and_then(|_| stream.flush()) {
            self.teardown(STAGE_SEND, &e);
            return Err(LinkError::transport(STAGE_SEND, e));
        }
        self.commands_sent += count as u64;

        match read_reply(stream, &self.config) {
            Ok(reply) => {
                if !reply.is_complete() {
                    self.truncated_replies += 1;
                }
                if let Integrity::Interrupted { expected, received } = reply.integrity {
                    warn!(
                        session_id = %self.id,
                        expected = expected,
                        received = received,
                        "Reply interrupted by read timeout, closing session"
                    );
                    self.close();
                }
                Ok(reply)
            }
            Err(ReadError { stage, source }) => {
                self.teardown(stage, &source);
                Err(LinkError::transport(stage, source))
            }
        }
    }

    /// Ask the engine how many projects it has open. Confirms the
    /// connection reaches a live engine.
    pub fn verify(&mut self) -> Result<usize> {
        const COMMAND: &str = "app.numsubnodes()";
        let reply = self.execute(COMMAND, &[])?;
        match reply.as_f64() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
            _ => Err(LinkError::UnexpectedReply {
                command: COMMAND.to_string(),
                reply: reply.stripped().to_string(),
            }),
        }
    }

    /// Tell the engine to exit, then close the session.
    ///
    /// The engine may drop the connection instead of answering; that counts
    /// as success.
    pub fn exit_app(&mut self) -> Result<()> {
        let result = match self.execute("app.exit", &[]) {
            Ok(_) => Ok(()),
            Err(LinkError::Transport { stage, .. }) if stage == STAGE_HEADER => Ok(()),
            Err(e) => Err(e),
        };
        self.close();
        result
    }

    /// Close the socket and release the port. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            info!(session_id = %self.id, port = ?self.port, "Closed connection");
        }
        if let Some(port) = self.port.take() {
            self.ports.release(port);
        }
        self.pending.clear();
        self.connected_at = None;
        self.state = SessionState::Disconnected;
    }

    fn teardown(&mut self, stage: &str, cause: &io::Error) {
        warn!(session_id = %self.id, stage = stage, error = %cause, "Transport failure, closing session");
        self.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[derive(Debug)]
struct ReadError {
    stage: &'static str,
    source: io::Error,
}

/// Read one reply frame and decode it.
fn read_reply<R: Read>(reader: &mut R, config: &LinkConfig) -> std::result::Result<Reply, ReadError> {
    let field = read_header(reader, config.length_field_width)?;
    let expected = match parse_length_header(&field) {
        ReplyHeader::Payload(len) => len,
        ReplyHeader::Directive(text) => {
            debug!(directive = %text, "Reply carries no payload");
            return Ok(Reply {
                value: DecodedValue::Empty,
                integrity: Integrity::Complete,
            });
        }
    };

    let (payload, timed_out) = read_payload(reader, expected, config)?;
    let received = payload.len();
    let integrity = if received >= expected {
        Integrity::Complete
    } else if timed_out {
        Integrity::Interrupted { expected, received }
    } else {
        Integrity::Truncated { expected, received }
    };
    if integrity != Integrity::Complete {
        warn!(
            target: "fimmlink::integrity",
            expected = expected,
            received = received,
            timed_out = timed_out,
            "Some of the data sent by the application has not been received; \
             reduce max_chunk_size or increase chunk_delay_ms"
        );
    }

    let text = String::from_utf8_lossy(&payload);
    Ok(Reply {
        value: decode(&text),
        integrity,
    })
}

/// Read the fixed-width length field, stopping early only at end of stream.
fn read_header<R: Read>(reader: &mut R, width: usize) -> std::result::Result<Vec<u8>, ReadError> {
    let mut field = vec![0u8; width];
    let mut filled = 0;
    while filled < width {
        match reader.read(&mut field[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ReadError {
                    stage: STAGE_HEADER,
                    source,
                })
            }
        }
    }
    if filled == 0 {
        return Err(ReadError {
            stage: STAGE_HEADER,
            source: io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by the application",
            ),
        });
    }
    field.truncate(filled);
    Ok(field)
}

/// Read up to `expected` payload bytes in chunks of at most
/// `max_chunk_size`, pausing between chunks when more than one is needed.
/// Stops early when the peer closes or a read times out; the flag is set in
/// the second case.
///
/// The buffer grows only as bytes arrive, so a bogus length field cannot
/// trigger a huge allocation.
fn read_payload<R: Read>(
    reader: &mut R,
    expected: usize,
    config: &LinkConfig,
) -> std::result::Result<(Vec<u8>, bool), ReadError> {
    let mut payload = Vec::with_capacity(expected.min(config.max_chunk_size));
    let chunked = expected > config.max_chunk_size;
    let mut chunk = vec![0u8; config.max_chunk_size.min(expected).max(1)];

    while payload.len() < expected {
        let want = (expected - payload.len()).min(chunk.len());
        match reader.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => {
                payload.extend_from_slice(&chunk[..n]);
                if chunked && payload.len() < expected && config.chunk_delay_ms > 0 {
                    thread::sleep(config.chunk_delay());
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                debug!(received = payload.len(), expected = expected, "Payload read timed out");
                return Ok((payload, true));
            }
            Err(source) => {
                return Err(ReadError {
                    stage: STAGE_PAYLOAD,
                    source,
                })
            }
        }
    }
    Ok((payload, false))
}
