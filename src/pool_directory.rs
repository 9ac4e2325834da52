//! Per-size-class free-pool queues, and the promotion/reclamation protocol
//! that binds a [`BlockPool`]'s lock-free hot path to the class-wide
//! reader/writer lock used to manage its queue membership.
//!
//! One [`ClassQueue`] exists per small class, per large class, and one more
//! for the small-container class (the 4 KiB-block pools used to carve
//! small-slabs out of a 2 MiB page). `Manager` owns the actual instances
//! and supplies the slab-procurement/reclamation glue as closures, so this
//! module only knows about queues of `Arc<BlockPool>` and the 3/8
//! re-enqueue threshold.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use crate::block_pool::BlockPool;
use crate::constants::{RECLAIM_DENOMINATOR, RECLAIM_NUMERATOR};

pub struct ClassQueue {
    pools: RwLock<VecDeque<Arc<BlockPool>>>,
}

impl ClassQueue {
    pub fn new() -> Self {
        ClassQueue {
            pools: RwLock::new(VecDeque::new()),
        }
    }

    /// Allocate a block from this class, refilling via `make_pool` if every
    /// queued pool is exhausted.
    ///
    /// Lock discipline: a reader-locked fast path tries the head pool's
    /// lock-free `allocate`; on failure we upgrade to the writer lock and
    /// drain exhausted heads before asking for a fresh slab.
    pub fn allocate(&self, make_pool: impl FnOnce() -> Arc<BlockPool>) -> usize {
        {
            let q = self.pools.read().unwrap();
            if let Some(head) = q.front() {
                if let Some(addr) = head.allocate() {
                    return addr;
                }
            }
        }

        let mut q = self.pools.write().unwrap();
        while let Some(head) = q.front() {
            if let Some(addr) = head.allocate() {
                return addr;
            }
            head.on_queue.store(false, Ordering::Relaxed);
            q.pop_front();
        }

        let pool = make_pool();
        pool.on_queue.store(true, Ordering::Relaxed);
        let addr = pool
            .allocate()
            .expect("freshly procured slab must have free capacity");
        q.push_front(pool);
        addr
    }

    /// Free a block back to `pool`, re-enqueueing it once it's crossed the
    /// 3/8-empty threshold and reclaiming its slab if it goes fully empty
    /// and isn't the queue's head (the head is retained as a standby pool
    /// so the class is never left without one once it has ever grown).
    pub fn free(&self, pool: &Arc<BlockPool>, address: usize, reclaim: impl FnOnce(&Arc<BlockPool>)) {
        let capacity = pool.capacity_bytes();
        let new_free = pool.free(address);
        let threshold = capacity * RECLAIM_NUMERATOR / RECLAIM_DENOMINATOR;
        if new_free < threshold {
            return;
        }

        if !pool.on_queue.load(Ordering::Relaxed) {
            let mut q = self.pools.write().unwrap();
            if !pool.on_queue.load(Ordering::Relaxed) {
                q.push_back(pool.clone());
                pool.on_queue.store(true, Ordering::Relaxed);
            }
        }

        if new_free == capacity {
            let mut q = self.pools.write().unwrap();
            if q.front().is_some_and(|h| Arc::ptr_eq(h, pool)) {
                return;
            }
            if let Some(pos) = q.iter().position(|p| Arc::ptr_eq(p, pool)) {
                q.remove(pos);
                pool.on_queue.store(false, Ordering::Relaxed);
                drop(q);
                reclaim(pool);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap().len()
    }
}

impl Default for ClassQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The full set of per-class queues: small classes, large classes, and the
/// small-container class.
pub struct PoolDirectory {
    pub small: Vec<ClassQueue>,
    pub large: Vec<ClassQueue>,
    pub container: ClassQueue,
}

impl PoolDirectory {
    pub fn new(small_classes: usize, large_classes: usize) -> Self {
        PoolDirectory {
            small: (0..small_classes).map(|_| ClassQueue::new()).collect(),
            large: (0..large_classes).map(|_| ClassQueue::new()).collect(),
            container: ClassQueue::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pool(block_size: usize, slab_size: usize) -> (Arc<BlockPool>, Vec<u8>) {
        let mut backing = vec![0u8; slab_size];
        let base = backing.as_mut_ptr() as usize;
        (Arc::new(BlockPool::new(base, slab_size, block_size)), backing)
    }

    #[test]
    fn allocate_refills_when_queue_empty() {
        let q = ClassQueue::new();
        let (pool, _b) = fresh_pool(64, 4096);
        let mut calls = 0;
        let addr = q.allocate(|| {
            calls += 1;
            pool.clone()
        });
        assert_eq!(calls, 1);
        assert_ne!(addr, 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reclaim_skipped_while_pool_is_head() {
        let q = ClassQueue::new();
        let (pool, _b) = fresh_pool(64, 4096);
        let addr = q.allocate(|| pool.clone());
        let mut reclaimed = false;
        q.free(&pool, addr, |_| reclaimed = true);
        // Single-pool queue: this pool is the head, so it must be retained
        // even though it's now fully empty.
        assert!(!reclaimed);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reclaim_fires_for_non_head_empty_pool() {
        let q = ClassQueue::new();
        let (pool_a, _a) = fresh_pool(64, 4096);
        let (pool_b, _b) = fresh_pool(64, 4096);

        // Manually enqueue both with `a` as a non-head standby.
        q.allocate(|| pool_a.clone());
        {
            let mut guard = q.pools.write().unwrap();
            guard.push_back(pool_b.clone());
            pool_b.on_queue.store(true, Ordering::Relaxed);
        }

        // Drain pool_b back to fully empty via its own previously handed
        // out block.
        let addr_b = pool_b.allocate().unwrap();
        let mut reclaimed = false;
        q.free(&pool_b, addr_b, |p| {
            reclaimed = true;
            assert!(Arc::ptr_eq(p, &pool_b));
        });
        assert!(reclaimed);
    }
}
