//! Client for a photonic simulation engine's TCP command server.
//!
//! The engine accepts scripting commands as length-prefixed text frames and
//! answers with length-prefixed, tag-annotated text. This crate frames and
//! batches commands, reassembles chunked replies and decodes them into typed
//! values.
//!
//! # Architecture
//!
//! - **protocol**: pure functions. Request framing, reply header parsing,
//!   reply decoding and the safe template language used to build commands.
//!
//! - **Session**: one blocking TCP connection to an engine. Owns its pending
//!   command batch and its template namespace. At most one request is in
//!   flight per session.
//!
//! - **SessionManager**: optional shared context holding several sessions
//!   and routing commands to the active one.
//!
//! - **PortAllocator**: process-wide record of ports held by open sessions,
//!   so two sessions never talk to the same engine port.
//!
//! # Example
//!
//! ```no_run
//! use fimmlink::{LinkConfig, Session};
//!
//! let mut session = Session::new(LinkConfig::default());
//! session.connect("localhost", 5101)?;
//! session.namespace_mut().set("wg", "app.subnodes[1].subnodes[1]");
//! let neff = session.execute("{wg}.evlist.list[%].neff()", &[1.into()])?;
//! println!("{}", neff);
//! # Ok::<(), fimmlink::LinkError>(())
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

pub use config::LinkConfig;
pub use error::{LinkError, Result, TemplateError};
pub use protocol::{DecodedValue, Namespace, Scalar, TemplateValue};
pub use session::{
    CommandBatch, ConnectReport, Integrity, PortAllocator, Reply, Session, SessionInfo,
    SessionManager, SessionState, SessionStats,
};
