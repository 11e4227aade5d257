//! Port pools for tunnel endpoints.
//!
//! Each [`PortPool`] hands out the lowest free port of its range so the
//! allocated set stays compact and allocation order is deterministic.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use tracing::debug;

use super::config::{BrokerConfig, PortRange};
use super::error::{BrokerError, BrokerResult};

/// Named pools a tunnel can draw ports from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortPool {
    /// bindPort of standard tunnels
    Standard,
    /// bindPort/tunnelPort of reverse tunnels
    Reverse,
    /// sshdPort of reverse tunnels
    Sshd,
}

impl fmt::Display for PortPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortPool::Standard => write!(f, "standard"),
            PortPool::Reverse => write!(f, "reverse"),
            PortPool::Sshd => write!(f, "sshd"),
        }
    }
}

struct RangeAllocator {
    range: PortRange,
    allocated: RwLock<BTreeSet<u16>>,
}

impl RangeAllocator {
    fn new(range: PortRange) -> Self {
        Self {
            range,
            allocated: RwLock::new(BTreeSet::new()),
        }
    }

    fn allocate(&self) -> Option<u16> {
        let mut allocated = self.allocated.write();
        let port = (self.range.start..=self.range.end).find(|p| !allocated.contains(p))?;
        allocated.insert(port);
        Some(port)
    }
}

/// Allocates ports from per-pool ranges.
///
/// Mutations are serialized per pool; reads take a shared lock.
pub struct PortAllocator {
    pools: HashMap<PortPool, RangeAllocator>,
}

impl PortAllocator {
    pub fn new(standard: PortRange, reverse: PortRange, sshd: PortRange) -> Self {
        let mut pools = HashMap::new();
        pools.insert(PortPool::Standard, RangeAllocator::new(standard));
        pools.insert(PortPool::Reverse, RangeAllocator::new(reverse));
        pools.insert(PortPool::Sshd, RangeAllocator::new(sshd));
        Self { pools }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.standard_ports,
            config.reverse_ports,
            config.sshd_ports,
        )
    }

    fn pool(&self, pool: PortPool) -> BrokerResult<&RangeAllocator> {
        self.pools
            .get(&pool)
            .ok_or_else(|| BrokerError::Internal(format!("port pool {} is not configured", pool)))
    }

    /// Takes the lowest free port of `pool`.
    pub fn allocate(&self, pool: PortPool) -> BrokerResult<u16> {
        let allocator = self.pool(pool)?;
        let port = allocator.allocate().ok_or_else(|| {
            BrokerError::ResourceExhausted(format!(
                "no free port in {} range {}",
                pool, allocator.range
            ))
        })?;
        debug!(%pool, port, "allocated port");
        Ok(port)
    }

    /// Returns a port to its pool. Releasing a free port is a no-op.
    pub fn release(&self, pool: PortPool, port: u16) {
        if let Ok(allocator) = self.pool(pool)
            && allocator.allocated.write().remove(&port)
        {
            debug!(%pool, port, "released port");
        }
    }

    pub fn is_allocated(&self, pool: PortPool, port: u16) -> bool {
        self.pool(pool)
            .map(|allocator| allocator.allocated.read().contains(&port))
            .unwrap_or(false)
    }

    /// Number of ports currently held in `pool`.
    pub fn allocated_count(&self, pool: PortPool) -> usize {
        self.pool(pool)
            .map(|allocator| allocator.allocated.read().len())
            .unwrap_or(0)
    }
}

/// Ports held by one tunnel, released together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortLease {
    ports: Vec<(PortPool, u16)>,
}

impl PortLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates one more port into the lease.
    pub fn take(&mut self, allocator: &PortAllocator, pool: PortPool) -> BrokerResult<u16> {
        let port = allocator.allocate(pool)?;
        self.ports.push((pool, port));
        Ok(port)
    }

    /// Releases every port in the lease. Calling it again does nothing.
    pub fn release_all(&mut self, allocator: &PortAllocator) {
        for (pool, port) in self.ports.drain(..) {
            allocator.release(pool, port);
        }
    }

    pub fn ports(&self) -> &[(PortPool, u16)] {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small_allocator() -> PortAllocator {
        PortAllocator::new(
            PortRange::new(40000, 40002),
            PortRange::new(41000, 41001),
            PortRange::new(42000, 42000),
        )
    }

    mod allocation {
        use super::*;

        #[test]
        fn test_allocates_lowest_first() {
            let allocator = small_allocator();
            assert_eq!(allocator.allocate(PortPool::Standard).unwrap(), 40000);
            assert_eq!(allocator.allocate(PortPool::Standard).unwrap(), 40001);
            assert_eq!(allocator.allocate(PortPool::Standard).unwrap(), 40002);
        }

        #[test]
        fn test_exhaustion_is_resource_exhausted() {
            let allocator = small_allocator();
            allocator.allocate(PortPool::Sshd).unwrap();
            let err = allocator.allocate(PortPool::Sshd).unwrap_err();
            assert!(matches!(err, BrokerError::ResourceExhausted(_)));
        }

        #[test]
        fn test_released_port_is_reused_first() {
            let allocator = small_allocator();
            let a = allocator.allocate(PortPool::Standard).unwrap();
            let _b = allocator.allocate(PortPool::Standard).unwrap();
            allocator.release(PortPool::Standard, a);
            assert_eq!(allocator.allocate(PortPool::Standard).unwrap(), a);
        }

        #[test]
        fn test_pools_are_independent() {
            let allocator = small_allocator();
            allocator.allocate(PortPool::Sshd).unwrap();
            assert!(allocator.allocate(PortPool::Reverse).is_ok());
            assert_eq!(allocator.allocated_count(PortPool::Standard), 0);
        }

        #[test]
        fn test_freeing_after_exhaustion_allows_one_more() {
            let allocator = small_allocator();
            let first = allocator.allocate(PortPool::Reverse).unwrap();
            allocator.allocate(PortPool::Reverse).unwrap();
            assert!(allocator.allocate(PortPool::Reverse).is_err());

            allocator.release(PortPool::Reverse, first);
            assert_eq!(allocator.allocate(PortPool::Reverse).unwrap(), first);
            assert!(allocator.allocate(PortPool::Reverse).is_err());
        }
    }

    mod release {
        use super::*;

        #[test]
        fn test_release_is_idempotent() {
            let allocator = small_allocator();
            let port = allocator.allocate(PortPool::Standard).unwrap();
            allocator.release(PortPool::Standard, port);
            allocator.release(PortPool::Standard, port);
            assert!(!allocator.is_allocated(PortPool::Standard, port));
            assert_eq!(allocator.allocated_count(PortPool::Standard), 0);
        }

        #[test]
        fn test_release_of_never_allocated_port_is_noop() {
            let allocator = small_allocator();
            allocator.release(PortPool::Standard, 1);
            assert_eq!(allocator.allocated_count(PortPool::Standard), 0);
        }

        #[test]
        fn test_double_release_does_not_free_a_reallocated_port() {
            let allocator = small_allocator();
            let mut lease = PortLease::new();
            let port = lease.take(&allocator, PortPool::Standard).unwrap();
            lease.release_all(&allocator);

            let reused = allocator.allocate(PortPool::Standard).unwrap();
            assert_eq!(reused, port);

            lease.release_all(&allocator);
            assert!(allocator.is_allocated(PortPool::Standard, reused));
        }
    }

    mod concurrency {
        use super::*;

        #[test]
        fn test_concurrent_allocations_are_unique() {
            let allocator = Arc::new(PortAllocator::new(
                PortRange::new(30000, 30199),
                PortRange::new(31000, 31000),
                PortRange::new(32000, 32000),
            ));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let allocator = allocator.clone();
                    std::thread::spawn(move || {
                        (0..25)
                            .map(|_| allocator.allocate(PortPool::Standard).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut ports: Vec<u16> = handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            ports.sort_unstable();
            ports.dedup();
            assert_eq!(ports.len(), 200);
            assert!(allocator.allocate(PortPool::Standard).is_err());
        }
    }
}
