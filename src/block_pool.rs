//! Fixed-block allocator over a single contiguous [`Slab`]: a lock-free
//! Treiber stack of block indices, ABA-guarded by a generation tag packed
//! into the same word as the stack head (mimalloc uses a cookie-XOR'd
//! pointer for the analogous free list; we use an index + tag instead,
//! since blocks here are identified by offset, not raw pointer).
//!
//! The free-stack link cells live at the front of the slab, ahead of the
//! user data area -- see [`BlockPool::new`] for the layout math.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::constants::align_up;

const NIL: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// A contiguous region of backing memory carved into fixed-size blocks.
pub struct BlockPool {
    base: usize,
    slab_size: usize,
    block_size: usize,
    data_offset: usize,
    num_blocks: usize,
    free_head: AtomicU64,
    free_bytes: AtomicUsize,
    /// Membership flag: is this pool currently enqueued in its class's
    /// free-pool queue? Guarded by the class lock in `PoolDirectory`, not
    /// by this pool itself -- see the concurrency protocol.
    pub on_queue: AtomicBool,
}

// SAFETY: all mutable state is behind atomics; `base` points at backing
// memory this pool exclusively owns for its lifetime.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Build a block pool over `[base, base + slab_size)`, carving off a
    /// header for the free-stack link cells and leaving the rest for
    /// `block_size`-sized blocks.
    ///
    /// `num_blocks = (slab_size - align(header)) / (block_size + align(entry))`,
    /// per the sizing note in the design docs.
    pub fn new(base: usize, slab_size: usize, block_size: usize) -> Self {
        assert!(block_size > 0 && block_size.is_multiple_of(8));
        let entry_size = std::mem::size_of::<u32>();
        let max_blocks = slab_size / (block_size + entry_size);
        let data_offset = align_up(max_blocks * entry_size, 8);
        // The header only has room for `max_blocks` link cells (that's what
        // sized it); recomputing from the aligned offset can round up to one
        // more block than that, which would make the last block's link cell
        // alias the first block's data. Clamp back down.
        let num_blocks = ((slab_size - data_offset) / block_size).min(max_blocks);
        assert!(num_blocks > 0, "slab too small for block_size {block_size}");

        let pool = BlockPool {
            base,
            slab_size,
            block_size,
            data_offset,
            num_blocks,
            free_head: AtomicU64::new(pack(0, NIL)),
            free_bytes: AtomicUsize::new(num_blocks * block_size),
            on_queue: AtomicBool::new(false),
        };
        // Single-threaded construction: link every block into the stack.
        for i in 0..num_blocks {
            let next = if i + 1 == num_blocks { NIL } else { (i + 1) as u32 };
            unsafe { pool.link_cell(i).write(next) };
        }
        pool.free_head.store(pack(0, 0), Ordering::Relaxed);
        pool
    }

    #[inline]
    unsafe fn link_cell(&self, index: usize) -> *mut u32 {
        (self.base as *mut u32).add(index)
    }

    #[inline]
    fn block_address(&self, index: usize) -> usize {
        self.base + self.data_offset + index * self.block_size
    }

    #[inline]
    fn index_of(&self, address: usize) -> usize {
        let idx = (address - self.base - self.data_offset) / self.block_size;
        debug_assert!(idx < self.num_blocks, "address 0x{address:x} out of range (num_blocks {})", self.num_blocks);
        idx
    }

    /// The slot index `address` occupies in this pool. Public so callers
    /// carving sub-regions out of a block (the small-container scheme)
    /// can recover the same index the pool itself uses internally,
    /// rather than re-deriving it from raw address bit-math that would
    /// need to know about `data_offset`'s alignment.
    pub fn slot_index(&self, address: usize) -> usize {
        self.index_of(address)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity_bytes(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    pub fn is_empty_of_allocations(&self) -> bool {
        self.free_bytes() == self.capacity_bytes()
    }

    /// Pop a free block, or `None` if the pool is exhausted. Lock-free.
    pub fn allocate(&self) -> Option<usize> {
        loop {
            let old = self.free_head.load(Ordering::Acquire);
            let (tag, idx) = unpack(old);
            if idx == NIL {
                return None;
            }
            debug_assert!((idx as usize) < self.num_blocks, "free-stack head corrupted: idx {idx} >= num_blocks {}", self.num_blocks);
            let next = unsafe { self.link_cell(idx as usize).read() };
            let new = pack(tag.wrapping_add(1), next);
            if self
                .free_head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.free_bytes.fetch_sub(self.block_size, Ordering::Relaxed);
                return Some(self.block_address(idx as usize));
            }
        }
    }

    /// Push `address` back onto the free stack. `address` must have been
    /// produced by this pool's `allocate` and not yet freed; violating this
    /// corrupts the stack (see crate-level error-handling notes).
    ///
    /// Returns the free-byte count *after* this push.
    pub fn free(&self, address: usize) -> usize {
        let idx = self.index_of(address) as u32;
        loop {
            let old = self.free_head.load(Ordering::Acquire);
            let (tag, old_idx) = unpack(old);
            unsafe { self.link_cell(idx as usize).write(old_idx) };
            let new = pack(tag.wrapping_add(1), idx);
            if self
                .free_head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return self.free_bytes.fetch_add(self.block_size, Ordering::Relaxed) + self.block_size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool(block_size: usize, slab_size: usize) -> (BlockPool, Vec<u8>) {
        let mut backing = vec![0u8; slab_size];
        let base = backing.as_mut_ptr() as usize;
        (BlockPool::new(base, slab_size, block_size), backing)
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let (pool, _backing) = make_pool(64, 4096);
        let cap = pool.capacity_bytes();
        let mut addrs = Vec::new();
        while let Some(a) = pool.allocate() {
            addrs.push(a);
        }
        assert_eq!(pool.free_bytes(), 0);
        assert!(!addrs.is_empty());

        for a in &addrs {
            pool.free(*a);
        }
        assert_eq!(pool.free_bytes(), cap);
    }

    #[test]
    fn blocks_are_disjoint_and_aligned() {
        let (pool, _backing) = make_pool(32, 8192);
        let mut seen = std::collections::HashSet::new();
        while let Some(a) = pool.allocate() {
            assert_eq!(a % 8, 0);
            assert!(seen.insert(a), "duplicate address handed out");
        }
    }

    #[test]
    fn concurrent_alloc_free_preserves_disjointness() {
        use std::sync::Arc;
        let slab_size = 1 << 20;
        let mut backing = vec![0u8; slab_size];
        let base = backing.as_mut_ptr() as usize;
        let pool = Arc::new(BlockPool::new(base, slab_size, 64));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..2000 {
                        if let Some(a) = pool.allocate() {
                            held.push(a);
                        }
                        if held.len() > 4 {
                            let a = held.swap_remove(0);
                            pool.free(a);
                        }
                    }
                    for a in held {
                        pool.free(a);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_bytes(), pool.capacity_bytes());
        let _ = backing;
    }
}
