//! Shared pool of internal worker ports
//!
//! Every instance across all apps draws its internal port from one pool, so
//! two instances can never collide on a port. Ports are handed out
//! lowest-first to keep allocation deterministic.

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Allocator for the configured inclusive port range
pub struct PortPool {
    inner: Mutex<Inner>,
}

struct Inner {
    free: BTreeSet<u16>,
    in_use: BTreeSet<u16>,
}

impl PortPool {
    /// Create a pool over the inclusive range `[from, to]`
    pub fn new(from: u16, to: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: (from..=to).collect(),
                in_use: BTreeSet::new(),
            }),
        }
    }

    /// Take the lowest free port out of the pool
    pub fn reserve(&self) -> Result<u16, Error> {
        let mut inner = self.inner.lock();
        let port = inner
            .free
            .iter()
            .next()
            .copied()
            .ok_or(Error::PortsExhausted)?;
        inner.free.remove(&port);
        inner.in_use.insert(port);
        Ok(port)
    }

    /// Return a previously reserved port to the pool.
    ///
    /// Releasing a port that is not in use is a bug in the caller.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock();
        let was_in_use = inner.in_use.remove(&port);
        debug_assert!(was_in_use, "released port {} that was not in use", port);
        if was_in_use {
            inner.free.insert(port);
        }
    }

    /// Number of ports currently free
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of ports currently held by instances
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }
}
