use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use thiserror::Error;

/// Cloud/external model endpoints draw from the low range, self-hosted model
/// endpoints from the high one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClass {
    Cloud,
    SelfHosted,
}

impl PortClass {
    fn range(&self) -> (u16, u16) {
        match self {
            PortClass::Cloud => (2000, 2500),
            PortClass::SelfHosted => (3000, 15000),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no free port in range for requested class")]
pub struct NoPort;

struct Pool {
    free: VecDeque<u16>,
    in_use: HashSet<u16>,
}

impl Pool {
    fn new(lo: u16, hi: u16) -> Self {
        Self { free: (lo..=hi).collect(), in_use: HashSet::new() }
    }
}

struct Pools {
    cloud: Pool,
    self_hosted: Pool,
}

impl Pools {
    fn for_class(&mut self, class: PortClass) -> &mut Pool {
        match class {
            PortClass::Cloud => &mut self.cloud,
            PortClass::SelfHosted => &mut self.self_hosted,
        }
    }
}

/// First-free port allocator over the two reservation ranges, one mutex,
/// O(1) amortized via the free queues. A port is held by exactly one active
/// reservation; termination returns it.
pub struct PortAllocator {
    inner: Mutex<Pools>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        let (clo, chi) = PortClass::Cloud.range();
        let (slo, shi) = PortClass::SelfHosted.range();
        Self {
            inner: Mutex::new(Pools {
                cloud: Pool::new(clo, chi),
                self_hosted: Pool::new(slo, shi),
            }),
        }
    }

    pub fn allocate(&self, class: PortClass) -> Result<u16, NoPort> {
        let mut pools = self.inner.lock().expect("mutex poisoned");
        let pool = pools.for_class(class);
        let port = pool.free.pop_front().ok_or(NoPort)?;
        pool.in_use.insert(port);
        Ok(port)
    }

    /// Returning an unknown or already-free port is a no-op.
    pub fn release(&self, port: u16) {
        let class = if port <= PortClass::Cloud.range().1 {
            PortClass::Cloud
        } else {
            PortClass::SelfHosted
        };
        let mut pools = self.inner.lock().expect("mutex poisoned");
        let pool = pools.for_class(class);
        if pool.in_use.remove(&port) {
            pool.free.push_back(port);
        }
    }

    pub fn in_use(&self, class: PortClass) -> usize {
        let mut pools = self.inner.lock().expect("mutex poisoned");
        pools.for_class(class).in_use.len()
    }
}
