//! Port bookkeeping for engine sessions.

use crate::config::DEFAULT_PORT;
use crate::error::{LinkError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

/// Upper bound on candidates scanned by [`PortAllocator::next_available`].
pub const MAX_PORT_SEARCH: usize = 1024;

struct PortState {
    /// Ports held by open sessions.
    reserved: HashSet<u16>,
    /// Next candidate; only ever advances.
    next_candidate: u16,
}

/// Tracks which ports are held by open sessions in this process.
pub struct PortAllocator {
    state: Mutex<PortState>,
}

impl PortAllocator {
    /// Create an allocator whose candidate counter starts at `first_candidate`.
    pub fn new(first_candidate: u16) -> Self {
        Self {
            state: Mutex::new(PortState {
                reserved: HashSet::new(),
                next_candidate: first_candidate,
            }),
        }
    }

    /// The process-wide allocator shared by sessions that are not given one.
    pub fn global() -> Arc<PortAllocator> {
        static GLOBAL: OnceLock<Arc<PortAllocator>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(PortAllocator::default())))
    }

    /// Check if a specific port is free.
    pub fn is_available(&self, port: u16) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.reserved.contains(&port)
    }

    /// Find the first unreserved port at or after the candidate counter.
    ///
    /// The counter moves past every rejected candidate and never goes back,
    /// so a port passed over once is not offered again in this process.
    /// The returned port is not reserved; call [`reserve`](Self::reserve)
    /// once it is in use.
    pub fn next_available(&self) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for scanned in 0..MAX_PORT_SEARCH {
            let candidate = state.next_candidate;
            if !state.reserved.contains(&candidate) {
                return Ok(candidate);
            }
            match candidate.checked_add(1) {
                Some(next) => state.next_candidate = next,
                None => return Err(LinkError::PortExhausted(scanned + 1)),
            }
        }
        Err(LinkError::PortExhausted(MAX_PORT_SEARCH))
    }

    pub fn reserve(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reserved.insert(port);
    }

    /// Release a port. Releasing a port that is not reserved does nothing.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reserved.remove(&port);
    }

    /// Number of ports currently reserved.
    pub fn reserved_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reserved.len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let allocator = PortAllocator::new(5101);
        assert!(allocator.is_available(5101));

        allocator.reserve(5101);
        assert!(!allocator.is_available(5101));
        assert_eq!(allocator.reserved_count(), 1);

        allocator.release(5101);
        assert!(allocator.is_available(5101));

        // Releasing again is a no-op
        allocator.release(5101);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn test_next_available_skips_reserved() {
        let allocator = PortAllocator::new(5101);
        allocator.reserve(5101);
        allocator.reserve(5102);
        assert_eq!(allocator.next_available().expect("port"), 5103);
        // Not reserved by next_available itself
        assert_eq!(allocator.next_available().expect("port"), 5103);
    }

    #[test]
    fn test_reserved_port_never_offered() {
        let allocator = PortAllocator::new(5101);
        allocator.reserve(5101);
        for _ in 0..5 {
            let port = allocator.next_available().expect("port");
            assert_ne!(port, 5101);
            allocator.reserve(port);
        }
    }

    #[test]
    fn test_counter_never_moves_back() {
        let allocator = PortAllocator::new(5101);
        allocator.reserve(5101);
        assert_eq!(allocator.next_available().expect("port"), 5102);

        // 5101 was passed over; releasing it does not rewind the counter.
        allocator.release(5101);
        assert_eq!(allocator.next_available().expect("port"), 5102);
    }

    #[test]
    fn test_exhaustion_is_bounded() {
        let allocator = PortAllocator::new(u16::MAX - 1);
        allocator.reserve(u16::MAX - 1);
        allocator.reserve(u16::MAX);
        assert!(matches!(
            allocator.next_available(),
            Err(LinkError::PortExhausted(2))
        ));

        let allocator = PortAllocator::new(6000);
        for port in 6000..6000 + MAX_PORT_SEARCH as u16 {
            allocator.reserve(port);
        }
        assert!(matches!(
            allocator.next_available(),
            Err(LinkError::PortExhausted(MAX_PORT_SEARCH))
        ));
    }
}
