//! Session manager holding several engine connections.
//!
//! Replaces a process-wide connection object: callers create a manager,
//! open sessions through it and route commands either to a named session or
//! to the active one.

use super::connection::Session;
use super::port_allocator::PortAllocator;
use super::types::{ConnectReport, SessionInfo, SessionState};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{DecodedValue, TemplateValue};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

type SharedSession = Arc<Mutex<Session>>;

/// Manager for multiple engine sessions.
pub struct SessionManager {
    /// Map of session ID to session.
    sessions: RwLock<HashMap<String, SharedSession>>,
    /// Currently active session ID.
    active_session_id: RwLock<Option<String>>,
    /// Port bookkeeping shared by every session of this manager.
    ports: Arc<PortAllocator>,
    config: LinkConfig,
}

impl SessionManager {
    /// Create a manager whose sessions use the process-wide port allocator.
    pub fn new(config: LinkConfig) -> Self {
        Self::with_allocator(config, PortAllocator::global())
    }

    pub fn with_allocator(config: LinkConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            active_session_id: RwLock::new(None),
            ports,
            config,
        }
    }

    /// Connect a new session to a running engine.
    pub fn open(&self, host: &str, port: u16) -> Result<(SessionInfo, ConnectReport)> {
        let mut session = Session::with_allocator(self.config.clone(), Arc::clone(&self.ports));
        let report = session.connect(host, port)?;
        Ok((self.register(session), report))
    }

    /// Start an engine executable and connect a new session to it.
    pub fn open_spawned(
        &self,
        executable: impl AsRef<Path>,
        port: u16,
    ) -> Result<(SessionInfo, ConnectReport)> {
        let mut session = Session::with_allocator(self.config.clone(), Arc::clone(&self.ports));
        let report = session.start_app(executable, port)?;
        Ok((self.register(session), report))
    }

    fn register(&self, session: Session) -> SessionInfo {
        let info = session.info();
        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.insert(info.id.clone(), Arc::new(Mutex::new(session)));
        }

        let mut active = self
            .active_session_id
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if active.is_none() {
            *active = Some(info.id.clone());
        }
        info!(session_id = %info.id, port = ?info.port, "Registered session");
        info
    }

    fn get(&self, session_id: &str) -> Result<SharedSession> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| LinkError::SessionNotFound(session_id.to_string()))
    }

    /// Run a command on a specific session.
    pub fn execute_on(
        &self,
        session_id: &str,
        command: &str,
        values: &[TemplateValue],
    ) -> Result<DecodedValue> {
        let shared = self.get(session_id)?;
        let mut session = shared.lock().unwrap_or_else(|e| e.into_inner());
        session.execute(command, values)
    }

    /// Run a command on the active session.
    pub fn execute(&self, command: &str, values: &[TemplateValue]) -> Result<DecodedValue> {
        let session_id = self.active_id().ok_or(LinkError::NoActiveSession)?;
        self.execute_on(&session_id, command, values)
    }

    /// Run a closure with exclusive access to a session.
    pub fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let shared = self.get(session_id)?;
        let mut session = shared.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut session)
    }

    /// Make another connected session the active one.
    pub fn switch(&self, session_id: &str) -> Result<SessionInfo> {
        let info = self.info(session_id)?;
        if info.state != SessionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let mut active = self
            .active_session_id
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *active = Some(session_id.to_string());
        info!(session_id = %session_id, "Switched active session");
        Ok(info)
    }

    pub fn active_id(&self) -> Option<String> {
        self.active_session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn info(&self, session_id: &str) -> Result<SessionInfo> {
        let shared = self.get(session_id)?;
        let session = shared.lock().unwrap_or_else(|e| e.into_inner());
        Ok(session.info())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<SharedSession> = {
            let map = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        sessions
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).info())
            .collect()
    }

    /// Close and forget a session. If it was active, another connected
    /// session takes its place.
    pub fn close(&self, session_id: &str) -> Result<()> {
        let shared = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions
                .remove(session_id)
                .ok_or_else(|| LinkError::SessionNotFound(session_id.to_string()))?
        };
        shared.lock().unwrap_or_else(|e| e.into_inner()).close();
        info!(session_id = %session_id, "Closed session");

        let replacement = self
            .list()
            .into_iter()
            .find(|s| s.state == SessionState::Connected)
            .map(|s| s.id);
        let mut active = self
            .active_session_id
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(session_id) {
            *active = replacement;
        }
        Ok(())
    }

    /// Close every session.
    pub fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.close(&id) {
                warn!(session_id = %id, error = %e, "Failed to close session during shutdown");
            }
        }
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.list();
        SessionStats {
            total_sessions: sessions.len(),
            connected_sessions: sessions
                .iter()
                .filter(|s| s.state == SessionState::Connected)
                .count(),
            active_session_id: self.active_id(),
            reserved_ports: self.ports.reserved_count(),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Statistics about sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub active_session_id: Option<String>,
    pub reserved_ports: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    /// Engine that answers every request with `RETVAL:<tag>`.
    fn spawn_echo_engine(tag: &'static str, requests: usize) -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            for _ in 0..requests {
                answer(&mut stream, tag);
            }
        });
        (port, handle)
    }

    fn answer(stream: &mut TcpStream, tag: &str) {
        let mut header = [0u8; 20];
        stream.read_exact(&mut header).expect("header");
        let len: usize = String::from_utf8_lossy(&header)
            .trim()
            .parse()
            .expect("length");
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).expect("body");

        let payload = format!("RETVAL:{}\n\0", tag);
        let mut reply = format!("{:<20}", payload.len()).into_bytes();
        reply.extend_from_slice(payload.as_bytes());
        stream.write_all(&reply).expect("reply");
    }

    fn manager() -> SessionManager {
        SessionManager::with_allocator(LinkConfig::default(), Arc::new(PortAllocator::default()))
    }

    #[test]
    fn first_session_becomes_active() {
        let (port_a, engine_a) = spawn_echo_engine("1", 2);
        let (port_b, engine_b) = spawn_echo_engine("2", 1);
        let manager = manager();

        let (a, _) = manager.open("127.0.0.1", port_a).expect("open a");
        let (b, _) = manager.open("127.0.0.1", port_b).expect("open b");
        assert_eq!(manager.active_id(), Some(a.id.clone()));

        assert_eq!(manager.execute("app.numsubnodes()", &[]).expect("exec").as_f64(), Some(1.0));
        assert_eq!(
            manager
                .execute_on(&b.id, "app.numsubnodes()", &[])
                .expect("exec b")
                .as_f64(),
            Some(2.0)
        );

        manager.switch(&b.id).expect("switch");
        assert_eq!(manager.active_id(), Some(b.id.clone()));
        manager.switch(&a.id).expect("switch back");
        assert_eq!(manager.execute("app.numsubnodes()", &[]).expect("exec").as_f64(), Some(1.0));

        let stats = manager.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.connected_sessions, 2);
        assert_eq!(stats.reserved_ports, 2);

        manager.shutdown_all();
        engine_a.join().expect("engine a");
        engine_b.join().expect("engine b");
    }

    #[test]
    fn closing_active_promotes_another() {
        let (port_a, engine_a) = spawn_echo_engine("1", 0);
        let (port_b, engine_b) = spawn_echo_engine("2", 0);
        let manager = manager();

        let (a, _) = manager.open("127.0.0.1", port_a).expect("open a");
        let (b, _) = manager.open("127.0.0.1", port_b).expect("open b");
        manager.close(&a.id).expect("close a");

        assert_eq!(manager.active_id(), Some(b.id.clone()));
        assert!(matches!(
            manager.info(&a.id),
            Err(LinkError::SessionNotFound(_))
        ));

        manager.close(&b.id).expect("close b");
        assert_eq!(manager.active_id(), None);
        assert!(matches!(
            manager.execute("app.exit", &[]),
            Err(LinkError::NoActiveSession)
        ));
        assert_eq!(manager.stats().reserved_ports, 0);
        engine_a.join().expect("engine a");
        engine_b.join().expect("engine b");
    }

    #[test]
    fn unknown_session_is_reported() {
        let manager = manager();
        assert!(matches!(
            manager.execute_on("nope", "app.exit", &[]),
            Err(LinkError::SessionNotFound(_))
        ));
        assert!(manager.close("nope").is_err());
    }

    #[test]
    fn session_namespace_is_reachable() {
        let (port, engine) = spawn_echo_engine("0.5", 1);
        let manager = manager();
        let (info, _) = manager.open("127.0.0.1", port).expect("open");

        let value = manager
            .with_session(&info.id, |session| {
                session.namespace_mut().set("wg", "app.subnodes[1].subnodes[1]");
                session.execute("{wg}.width", &[])
            })
            .expect("exec");
        assert_eq!(value.as_f64(), Some(0.5));
        engine.join().expect("engine");
    }
}
