//! C3 Port allocator (spec §4.3).
//!
//! Assigns disjoint port ranges per task. No direct teacher precedent for
//! this component; implemented in the teacher's idiom — a small struct
//! guarding its state the way `WorktreeBridge` guards `base_dir`, probing
//! bind-ability with `std::net::TcpListener`.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::{AdwError, AdwResult};

const DEFAULT_POOL_START: u16 = 3000;
const DEFAULT_POOL_END: u16 = 9999;

#[derive(Debug, Clone)]
pub struct PortPool {
    pub start: u16,
    pub end: u16,
}

impl Default for PortPool {
    fn default() -> Self {
        Self {
            start: DEFAULT_POOL_START,
            end: DEFAULT_POOL_END,
        }
    }
}

fn is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Single-threaded arbiter: all allocation decisions happen under one lock,
/// per spec §5's "the allocator is the sole arbiter and is single-threaded".
pub struct PortAllocator {
    pool: PortPool,
    state: Mutex<PortAllocatorState>,
}

#[derive(Default)]
struct PortAllocatorState {
    assigned: HashMap<String, HashMap<String, u16>>,
    in_use: std::collections::HashSet<u16>,
}

impl PortAllocator {
    pub fn new(pool: PortPool) -> Self {
        Self {
            pool,
            state: Mutex::new(PortAllocatorState::default()),
        }
    }

    /// `allocate(adw_id, kinds) -> map kind->port`. Probes successive ports
    /// in the pool, skipping any already assigned in this process or not
    /// free on loopback; pool exhaustion is a fatal allocation error.
    pub fn allocate(&self, adw_id: &str, kinds: &[&str]) -> AdwResult<HashMap<String, u16>> {
        let mut state = self.state.lock().expect("port allocator mutex poisoned");
        let mut result = HashMap::new();

        for kind in kinds {
            let mut candidate = self.pool.start;
            let port = loop {
                if candidate > self.pool.end {
                    return Err(AdwError::invariant(format!(
                        "port pool {}..={} exhausted while allocating '{kind}' for {adw_id}",
                        self.pool.start, self.pool.end
                    )));
                }
                if !state.in_use.contains(&candidate) && is_free(candidate) {
                    break candidate;
                }
                candidate += 1;
            };
            state.in_use.insert(port);
            result.insert((*kind).to_string(), port);
        }

        state.assigned.insert(adw_id.to_string(), result.clone());
        Ok(result)
    }

    /// Releases all ports held by `adw_id` back to the pool.
    pub fn release(&self, adw_id: &str) {
        let mut state = self.state.lock().expect("port allocator mutex poisoned");
        if let Some(ports) = state.assigned.remove(adw_id) {
            for port in ports.values() {
                state.in_use.remove(port);
            }
        }
    }

    pub fn ports_for(&self, adw_id: &str) -> Option<HashMap<String, u16>> {
        let state = self.state.lock().expect("port allocator mutex poisoned");
        state.assigned.get(adw_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_gives_disjoint_ports_across_adw_ids() {
        let allocator = PortAllocator::new(PortPool { start: 20000, end: 20010 });
        let a = allocator.allocate("a", &["frontend", "backend"]).unwrap();
        let b = allocator.allocate("b", &["frontend", "backend"]).unwrap();

        let a_ports: std::collections::HashSet<_> = a.values().collect();
        let b_ports: std::collections::HashSet<_> = b.values().collect();
        assert!(a_ports.is_disjoint(&b_ports));
    }

    #[test]
    fn release_frees_ports_for_reuse() {
        let allocator = PortAllocator::new(PortPool { start: 20100, end: 20100 });
        let a = allocator.allocate("a", &["frontend"]).unwrap();
        allocator.release("a");
        let b = allocator.allocate("b", &["frontend"]).unwrap();
        assert_eq!(a.get("frontend"), b.get("frontend"));
    }

    #[test]
    fn pool_exhaustion_is_fatal() {
        let allocator = PortAllocator::new(PortPool { start: 20200, end: 20200 });
        allocator.allocate("a", &["frontend"]).unwrap();
        let err = allocator.allocate("b", &["frontend"]);
        assert!(err.is_err());
    }
}
