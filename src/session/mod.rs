//! Engine sessions.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SessionManager (optional shared context)      │
//! │  ├─ sessions: HashMap<id, Mutex<Session>>     │
//! │  └─ active_session_id                         │
//! │                                               │
//! │ Session                                       │
//! │  ├─ pending CommandBatch                      │
//! │  ├─ Namespace for template names              │
//! │  └─ TcpStream ── framed batch ──▶ engine      │
//! │                ◀── framed reply ──            │
//! │                                               │
//! │ PortAllocator (process-wide by default)       │
//! └──────────────────────────────────────────────┘
//! ```

mod connection;
mod manager;
mod port_allocator;
mod types;

pub use connection::{CommandBatch, Session};
pub use manager::{SessionManager, SessionStats};
pub use port_allocator::{PortAllocator, MAX_PORT_SEARCH};
pub use types::{ConnectReport, Integrity, Reply, SessionInfo, SessionState};
