//! Per-node frame caches under a global byte budget.
//!
//! Each node output cache maps `(output index, frame index)` to a frame
//! reference with LRU ordering; a core-wide registry coordinates eviction
//! across all caches when charged memory exceeds the configured budget.
//! Entries currently referenced elsewhere (by a context's resolved
//! dictionary or a host) are pinned and skipped by the eviction walk.

use crate::frame::FrameRef;
use crate::memory::MemoryAccountant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct CacheEntry {
    frame: FrameRef,
    last_touch: u64,
    bytes: usize,
}

/// Cache contents of one node.
#[derive(Default)]
pub(crate) struct NodeCache {
    entries: HashMap<(usize, usize), CacheEntry>,
}

/// One node's cache plus its behavior flags.
pub(crate) struct CacheHandle {
    node_name: String,
    /// Single-slot mode: hold only the most recent frame.
    single_slot: bool,
    map: Mutex<NodeCache>,
}

impl CacheHandle {
    pub(crate) fn new(node_name: String, single_slot: bool) -> Arc<Self> {
        Arc::new(Self {
            node_name,
            single_slot,
            map: Mutex::new(NodeCache::default()),
        })
    }
}

/// Core-wide view over every node cache, driving global LRU eviction.
pub(crate) struct CacheRegistry {
    caches: Mutex<Vec<Weak<CacheHandle>>>,
    accountant: Arc<MemoryAccountant>,
    tick: AtomicU64,
}

impl CacheRegistry {
    pub(crate) fn new(accountant: Arc<MemoryAccountant>) -> Self {
        Self {
            caches: Mutex::new(Vec::new()),
            accountant,
            tick: AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self, handle: &Arc<CacheHandle>) {
        let mut caches = self.caches.lock().unwrap();
        caches.retain(|weak| weak.strong_count() > 0);
        caches.push(Arc::downgrade(handle));
    }

    fn touch(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a cached frame, refreshing its LRU position on a hit.
    pub(crate) fn get(
        &self,
        handle: &CacheHandle,
        output: usize,
        n: usize,
    ) -> Option<FrameRef> {
        let mut cache = handle.map.lock().unwrap();
        let entry = cache.entries.get_mut(&(output, n))?;
        entry.last_touch = self.touch();
        Some(Arc::clone(&entry.frame))
    }

    /// Publish a frame into a node's cache, then evict across all caches
    /// until the accountant is back under budget or only pinned entries
    /// remain.
    pub(crate) fn insert(&self, handle: &CacheHandle, output: usize, n: usize, frame: FrameRef) {
        let bytes = frame.total_bytes();
        {
            let mut cache = handle.map.lock().unwrap();
            if handle.single_slot {
                cache.entries.clear();
            }
            cache.entries.insert(
                (output, n),
                CacheEntry {
                    frame,
                    last_touch: self.touch(),
                    bytes,
                },
            );
        }
        self.enforce_budget();
    }

    /// Evict global-LRU entries while the accountant is over budget.
    ///
    /// An entry is evictable only when the cache holds the last reference
    /// to its frame; anything a context or host still references stays.
    pub(crate) fn enforce_budget(&self) {
        while self.accountant.over_budget() {
            let caches: Vec<Arc<CacheHandle>> = {
                let mut list = self.caches.lock().unwrap();
                list.retain(|weak| weak.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };

            let mut victim: Option<(Arc<CacheHandle>, (usize, usize), u64)> = None;
            for handle in &caches {
                let cache = handle.map.lock().unwrap();
                for (key, entry) in cache.entries.iter() {
                    if Arc::strong_count(&entry.frame) > 1 {
                        continue;
                    }
                    if victim
                        .as_ref()
                        .map_or(true, |(_, _, touch)| entry.last_touch < *touch)
                    {
                        victim = Some((Arc::clone(handle), *key, entry.last_touch));
                    }
                }
            }

            let Some((handle, key, _)) = victim else {
                break;
            };
            let mut cache = handle.map.lock().unwrap();
            if let Some(entry) = cache.entries.remove(&key) {
                tracing::debug!(
                    target: "vantage::cache",
                    node = %handle.node_name,
                    frame = key.1,
                    bytes = entry.bytes,
                    "evicted frame"
                );
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VideoFormat;
    use crate::frame::Frame;

    fn frame(acc: &Arc<MemoryAccountant>) -> FrameRef {
        Arc::new(Frame::new_video(VideoFormat::gray8(), 16, 16, None, acc).unwrap())
    }

    #[test]
    fn test_hit_and_miss() {
        let acc = Arc::new(MemoryAccountant::new(usize::MAX));
        let registry = CacheRegistry::new(Arc::clone(&acc));
        let handle = CacheHandle::new("n".into(), false);
        registry.register(&handle);

        assert!(registry.get(&handle, 0, 0).is_none());
        registry.insert(&handle, 0, 0, frame(&acc));
        assert!(registry.get(&handle, 0, 0).is_some());
        assert!(registry.get(&handle, 0, 1).is_none());
    }

    #[test]
    fn test_lru_eviction_under_budget() {
        let acc = Arc::new(MemoryAccountant::new(usize::MAX));
        let registry = CacheRegistry::new(Arc::clone(&acc));
        let handle = CacheHandle::new("n".into(), false);
        registry.register(&handle);

        let one = frame(&acc);
        let per_frame = one.total_bytes();
        acc.set_limit(2 * per_frame);
        registry.insert(&handle, 0, 0, one);
        registry.insert(&handle, 0, 1, frame(&acc));
        // Refresh frame 0 so frame 1 is the LRU entry.
        registry.get(&handle, 0, 0);

        registry.insert(&handle, 0, 2, frame(&acc));
        assert!(acc.used() <= 2 * per_frame);
        assert!(registry.get(&handle, 0, 0).is_some());
        assert!(registry.get(&handle, 0, 1).is_none());
    }

    #[test]
    fn test_pinned_entries_survive() {
        let acc = Arc::new(MemoryAccountant::new(usize::MAX));
        let registry = CacheRegistry::new(Arc::clone(&acc));
        let handle = CacheHandle::new("n".into(), false);
        registry.register(&handle);

        let pinned = frame(&acc);
        let per_frame = pinned.total_bytes();
        registry.insert(&handle, 0, 0, Arc::clone(&pinned));

        acc.set_limit(per_frame / 2);
        registry.enforce_budget();
        // Still referenced here, so it must not have been evicted.
        assert!(registry.get(&handle, 0, 0).is_some());
        drop(pinned);

        registry.enforce_budget();
        assert!(registry.get(&handle, 0, 0).is_none());
    }

    #[test]
    fn test_single_slot_cache() {
        let acc = Arc::new(MemoryAccountant::new(usize::MAX));
        let registry = CacheRegistry::new(Arc::clone(&acc));
        let handle = CacheHandle::new("n".into(), true);
        registry.register(&handle);

        registry.insert(&handle, 0, 0, frame(&acc));
        registry.insert(&handle, 0, 1, frame(&acc));
        assert!(registry.get(&handle, 0, 0).is_none());
        assert!(registry.get(&handle, 0, 1).is_some());
    }
}
