//! Address-to-metadata index: given any address inside a live page, find
//! out who owns it without ever touching user data.
//!
//! Sharded by the low bits of the page number so concurrent `resolve`
//! calls from unrelated pages almost never contend; the shard locks are
//! held only transiently. Mutations (installing a fresh page, swapping a
//! descriptor on reclamation) happen while the caller also holds the
//! backing-store writer lock, so the shard lock here is a belt-and-braces
//! correctness net rather than the primary serialization point.

use std::sync::{Arc, RwLock};

use crate::block_pool::BlockPool;
use crate::constants::{page_number, SMALL_SLABS_PER_CONTAINER, TOTAL_PAGE_SHARDS};

pub enum PageDescriptor {
    /// Backing storage managed directly by a `ListPool`; `region` indexes
    /// into the manager's region table.
    Huge { region: usize },
    LargeBlock {
        pool: Arc<BlockPool>,
        region: usize,
    },
    SmallContainer {
        /// The 4 KiB-block pool used to carve small-slabs out of this page.
        container: Arc<BlockPool>,
        slots: Box<[Option<Arc<BlockPool>>; SMALL_SLABS_PER_CONTAINER]>,
        region: usize,
    },
}

impl PageDescriptor {
    pub fn huge(region: usize) -> Self {
        PageDescriptor::Huge { region }
    }

    pub fn large_block(pool: Arc<BlockPool>, region: usize) -> Self {
        PageDescriptor::LargeBlock { pool, region }
    }

    pub fn small_container(container: Arc<BlockPool>, region: usize) -> Self {
        PageDescriptor::SmallContainer {
            container,
            slots: Box::new(std::array::from_fn(|_| None)),
            region,
        }
    }
}

/// What a lookup dispatches a `free()` to.
pub enum Resolved {
    Huge(usize),
    LargeBlock(Arc<BlockPool>),
    SmallBlock(Arc<BlockPool>),
}

pub struct PageIndex {
    shards: Vec<RwLock<Vec<(u64, PageDescriptor)>>>,
}

impl PageIndex {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(TOTAL_PAGE_SHARDS);
        shards.resize_with(TOTAL_PAGE_SHARDS, || RwLock::new(Vec::new()));
        PageIndex { shards }
    }

    #[inline]
    fn shard_for(&self, page_num: u64) -> &RwLock<Vec<(u64, PageDescriptor)>> {
        let shard = page_num as usize & (TOTAL_PAGE_SHARDS - 1);
        &self.shards[shard]
    }

    /// Install a descriptor for a page that has never had one. Panics if
    /// the page is already present (an invariant violation upstream).
    pub fn install(&self, page_num: u64, descriptor: PageDescriptor) {
        let mut bucket = self.shard_for(page_num).write().unwrap();
        debug_assert!(
            !bucket.iter().any(|(p, _)| *p == page_num),
            "page {page_num} installed twice"
        );
        bucket.push((page_num, descriptor));
    }

    /// Swap the descriptor for an existing page, returning the old one.
    pub fn swap(&self, page_num: u64, descriptor: PageDescriptor) -> PageDescriptor {
        let mut bucket = self.shard_for(page_num).write().unwrap();
        for (p, d) in bucket.iter_mut() {
            if *p == page_num {
                return std::mem::replace(d, descriptor);
            }
        }
        panic!("swap on page {page_num} with no installed descriptor");
    }

    /// Run `f` against the descriptor for `page_num` under the shard's
    /// write lock, without replacing it. Used to punch a new small-slab
    /// pool into (or out of) a `SmallContainer`'s slot array, and to read
    /// back a descriptor's owning region at reclaim time.
    pub fn mutate<R>(&self, page_num: u64, f: impl FnOnce(&mut PageDescriptor) -> R) -> R {
        let mut bucket = self.shard_for(page_num).write().unwrap();
        for (p, d) in bucket.iter_mut() {
            if *p == page_num {
                return f(d);
            }
        }
        panic!("mutate on page {page_num} with no installed descriptor");
    }

    /// Resolve `address` to whoever should handle freeing it.
    pub fn resolve_for_free(&self, address: usize) -> Resolved {
        let page_num = page_number(address);
        let bucket = self.shard_for(page_num).read().unwrap();
        for (p, d) in bucket.iter() {
            if *p != page_num {
                continue;
            }
            return match d {
                PageDescriptor::Huge { region } => Resolved::Huge(*region),
                PageDescriptor::LargeBlock { pool, .. } => Resolved::LargeBlock(pool.clone()),
                PageDescriptor::SmallContainer { slots, container, .. } => {
                    let slot = container.slot_index(address);
                    let pool = slots[slot]
                        .clone()
                        .expect("small-slab slot has no installed pool");
                    Resolved::SmallBlock(pool)
                }
            };
        }
        panic!("resolve_for_free: address 0x{address:x} is not in any known page");
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_resolve_huge() {
        let idx = PageIndex::new();
        let addr = 5 * crate::constants::PAGE + 17;
        idx.install(page_number(addr), PageDescriptor::huge(3));
        match idx.resolve_for_free(addr) {
            Resolved::Huge(r) => assert_eq!(r, 3),
            _ => panic!("wrong descriptor kind"),
        }
    }

    #[test]
    fn swap_replaces_descriptor() {
        let idx = PageIndex::new();
        let addr = 9 * crate::constants::PAGE;
        idx.install(page_number(addr), PageDescriptor::huge(1));
        let old = idx.swap(page_number(addr), PageDescriptor::huge(2));
        assert!(matches!(old, PageDescriptor::Huge { region: 1 }));
        match idx.resolve_for_free(addr) {
            Resolved::Huge(r) => assert_eq!(r, 2),
            _ => panic!("wrong descriptor kind"),
        }
    }
}
