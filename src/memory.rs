//! Global memory accounting for frame data.
//!
//! Every plane allocation charges its byte cost here and credits it back
//! on release. The configured limit is the cache budget: the caches evict
//! least-recently-used frames whenever charged bytes exceed it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks bytes charged by live frame allocations against a soft limit.
///
/// The limit is soft in the sense that allocation never fails outright;
/// crossing it triggers cache eviction instead. In-flight frames that are
/// pinned by running requests are allowed to push usage past the limit by
/// at most one frame's worth (the "one in-flight frame" slack).
pub struct MemoryAccountant {
    used: AtomicUsize,
    limit: AtomicUsize,
}

/// Default cache budget: 1 GiB.
pub const DEFAULT_CACHE_BYTES: usize = 1024 * 1024 * 1024;

impl MemoryAccountant {
    /// Create an accountant with the given byte limit.
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Charge `bytes` of a fresh allocation.
    pub fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Credit `bytes` of a released allocation.
    pub fn credit(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "memory accountant underflow");
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// The configured limit in bytes.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Replace the limit, returning the previous value.
    pub fn set_limit(&self, bytes: usize) -> usize {
        self.limit.swap(bytes, Ordering::Relaxed)
    }

    /// Whether charged bytes currently exceed the limit.
    pub fn over_budget(&self) -> bool {
        self.used() > self.limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_credit_roundtrip() {
        let acc = MemoryAccountant::new(1000);
        acc.charge(600);
        assert_eq!(acc.used(), 600);
        assert!(!acc.over_budget());

        acc.charge(600);
        assert!(acc.over_budget());

        acc.credit(600);
        acc.credit(600);
        assert_eq!(acc.used(), 0);
    }

    #[test]
    fn test_set_limit() {
        let acc = MemoryAccountant::new(100);
        acc.charge(150);
        assert!(acc.over_budget());
        assert_eq!(acc.set_limit(200), 100);
        assert!(!acc.over_budget());
    }
}
