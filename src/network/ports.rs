// Port Allocator (C1): a cluster-shared pool of TCP port numbers, one
// disjoint range per node, handed out and returned for the lifetime of a
// single Exchange mesh setup.
//
// Adapted from the allocation-strategy port allocator this crate used to
// carry: that allocator tracked a `HashSet` of in-use ports under any of
// several strategies; this pool is simpler by specification — a plain LIFO
// stack, because an Exchange only ever needs "some free port in my range",
// never a particular one.

use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

struct Inner {
    free: Vec<u16>,
}

/// LIFO stack of available ports within `[range_start, range_end)`,
/// protected by a single mutex. `Pop`/`Push` are both short,
/// non-blocking operations.
pub struct PortPool {
    inner: Mutex<Inner>,
    range_start: u16,
    range_end: u16,
}

impl PortPool {
    /// Build a pool covering `[range_start, range_end)`. Ports are pushed in
    /// descending order so the first `pop()` returns `range_start` (purely
    /// cosmetic — callers must not depend on allocation order).
    pub fn new(range_start: u16, range_end: u16) -> Self {
        assert!(range_start < range_end, "empty port range");
        let mut free: Vec<u16> = (range_start..range_end).collect();
        free.reverse();
        Self {
            inner: Mutex::new(Inner { free }),
            range_start,
            range_end,
        }
    }

    pub fn for_node(my_node: u32, pool_size: u16, base: u16) -> Self {
        let start = base + (my_node as u16) * pool_size;
        Self::new(start, start + pool_size)
    }

    /// Reserve a port, failing with `ResourceExhausted` if the pool is
    /// empty. Prefer [`PortPool::lease`] so the port is returned
    /// automatically on every exit path.
    pub fn pop(&self) -> Result<u16> {
        self.inner
            .lock()
            .free
            .pop()
            .ok_or_else(|| DbError::ResourceExhausted(format!(
                "port pool [{}, {}) exhausted",
                self.range_start, self.range_end
            )))
    }

    /// Return a port to the pool. Idempotent beyond double-push protection
    /// is not attempted here — callers only push what they popped, enforced
    /// by `PortLease`'s single-use `Drop`.
    pub fn push(&self, port: u16) {
        self.inner.lock().free.push(port);
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        (self.range_end - self.range_start) as usize
    }
}

/// RAII guard over one loaned port. Always pushes the port back to its pool
/// on drop, so every early-return error path (mesh setup failure, query
/// cancellation) releases it without bespoke cleanup code.
pub struct PortLease {
    pool: Arc<PortPool>,
    port: Option<u16>,
}

impl PortLease {
    pub fn acquire(pool: Arc<PortPool>) -> Result<Self> {
        let port = pool.pop()?;
        Ok(Self {
            pool,
            port: Some(port),
        })
    }

    pub fn port(&self) -> u16 {
        self.port.expect("PortLease used after release")
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.pool.push(port);
        }
    }
}
