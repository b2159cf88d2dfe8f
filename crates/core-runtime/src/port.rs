//! Loopback port reservation. A single `PortAllocator` is the one OS-wide shared
//! resource internal to the process — every worker instance goes through it.

use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_ALLOCATE_RETRIES: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            min: 20000,
            max: 29999,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no free ports available in range after retrying")]
    NoPorts,
}

impl core_common::error::Classify for PortError {
    fn kind(&self) -> core_common::error::ErrorKind {
        core_common::error::ErrorKind::Fatal
    }
}

/// Reserves ports within `range`, verifying OS-level availability by binding before
/// handing one out.
pub struct PortAllocator {
    range: PortRange,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Picks a random candidate in range, rejects ones already reserved, and verifies
    /// the OS will actually let us bind it before committing. Bounded retries
    /// (`DEFAULT_ALLOCATE_RETRIES`) guard against an exhausted range.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let span = self.range.max - self.range.min + 1;
        let mut rng = rand::rng();
        let mut reserved = self.reserved.lock().unwrap();

        for _ in 0..DEFAULT_ALLOCATE_RETRIES.max(span as u32) {
            let candidate = self.range.min + rng.random_range(0..span);
            if reserved.contains(&candidate) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                reserved.insert(candidate);
                debug!(port = candidate, "allocated port");
                return Ok(candidate);
            }
        }
        warn!("exhausted port allocation retries");
        Err(PortError::NoPorts)
    }

    /// Idempotent: releasing a port that was never (or is no longer) reserved is a
    /// no-op.
    pub fn release(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
        debug!(port, "released port");
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ports_are_unique() {
        let allocator = PortAllocator::new(PortRange { min: 31000, max: 31010 });
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let port = allocator.allocate().unwrap();
            assert!(seen.insert(port), "port {port} allocated twice while live");
        }
    }

    #[test]
    fn exhausted_range_fails_with_no_ports() {
        let allocator = PortAllocator::new(PortRange { min: 31100, max: 31101 });
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        assert!(matches!(allocator.allocate(), Err(PortError::NoPorts)));
    }

    #[test]
    fn release_is_idempotent_and_frees_for_reuse() {
        let allocator = PortAllocator::new(PortRange { min: 31200, max: 31200 });
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        allocator.release(port);
        assert_eq!(allocator.reserved_count(), 0);
        let reallocated = allocator.allocate().unwrap();
        assert_eq!(reallocated, port);
    }
}
