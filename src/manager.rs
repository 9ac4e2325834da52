//! The top-level allocator: routes a request to the small/large block-pool
//! hierarchy or straight to a backing region's list pool, and owns the
//! grow-on-demand backing store those pools carve their slabs out of.
//!
//! Lock ordering follows the class-then-backing-store rule throughout:
//! any path that needs both a [`ClassQueue`] lock and the backing-store
//! lock always takes the class lock first. `alloc_large_slab` and
//! `allocate_list_pool` are the only places that touch the backing store
//! directly, and neither is ever called while holding a class lock --
//! they're invoked from inside a `make_pool` closure, which `ClassQueue`
//! only calls after it has already decided to refill, not while scanning.

use std::sync::{Arc, RwLock};

use log::debug;

use crate::block_pool::BlockPool;
use crate::constants::{
    large_class_exact_index, large_class_index, page_number, small_class_exact_index,
    small_class_index, INITIAL_BACKING_SIZE, LARGE_POOL, LARGE_THRESHOLD, SMALL_POOL,
    SMALL_THRESHOLD,
};
use crate::list_pool::ListPool;
use crate::os::{self, Reservation};
use crate::page_index::{PageDescriptor, PageIndex, Resolved};
use crate::pool_directory::PoolDirectory;
use crate::stats::Stats;

struct BackingRegion {
    reservation: Reservation,
    list_pool: ListPool,
}

struct BackingStore {
    regions: Vec<BackingRegion>,
    next_region_size: usize,
}

/// A thread-safe, size-classed allocator core. See the module docs for the
/// lock-ordering contract; all public methods are safe to call from any
/// number of threads concurrently.
pub struct Manager {
    backing: RwLock<BackingStore>,
    page_index: PageIndex,
    pools: PoolDirectory,
    stats: Stats,
}

impl Manager {
    pub fn new() -> Self {
        Manager {
            backing: RwLock::new(BackingStore {
                regions: Vec::new(),
                next_region_size: INITIAL_BACKING_SIZE,
            }),
            page_index: PageIndex::new(),
            pools: PoolDirectory::new(crate::constants::SMALL_CLASSES.len(), crate::constants::LARGE_CLASSES.len()),
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Allocate `size` bytes, returning the address of the first byte.
    pub fn allocate(&self, size: usize) -> usize {
        self.stats.record_alloc();
        if size <= SMALL_THRESHOLD {
            let idx = small_class_index(size.max(1)).expect("size within small threshold");
            let block_size = crate::constants::SMALL_CLASSES[idx];
            self.pools.small[idx].allocate(|| self.procure_small_pool(block_size))
        } else if size <= LARGE_THRESHOLD {
            let idx = large_class_index(size).expect("size within large threshold");
            let block_size = crate::constants::LARGE_CLASSES[idx];
            self.pools.large[idx].allocate(|| self.procure_large_pool(block_size))
        } else {
            self.allocate_list_pool(size)
        }
    }

    /// Release a previously allocated address.
    pub fn free(&self, address: usize) {
        self.stats.record_free();
        match self.page_index.resolve_for_free(address) {
            Resolved::Huge(region) => {
                let mut backing = self.backing.write().unwrap();
                backing.regions[region].list_pool.free(address);
            }
            Resolved::LargeBlock(pool) => {
                let idx = large_class_exact_index(pool.block_size());
                self.pools.large[idx].free(&pool, address, |p| self.reclaim_large(p));
            }
            Resolved::SmallBlock(pool) => {
                let idx = small_class_exact_index(pool.block_size());
                self.pools.small[idx].free(&pool, address, |p| self.reclaim_small(p));
            }
        }
    }

    /// The size-class block size backing the live allocation at `address`.
    /// Diagnostic only -- not part of the documented external interface --
    /// for tests that need to check a returned address landed in the
    /// size class the request should have rounded up to.
    ///
    /// Panics if `address` falls in a page managed directly by a list
    /// pool (a huge allocation has no size class).
    pub fn block_size_of(&self, address: usize) -> usize {
        match self.page_index.resolve_for_free(address) {
            Resolved::Huge(_) => panic!("block_size_of: 0x{address:x} is a huge allocation"),
            Resolved::LargeBlock(pool) | Resolved::SmallBlock(pool) => pool.block_size(),
        }
    }

    /// Sum of free bytes held by every backing region's list pool. Space
    /// parked inside block pools carved out of those regions already
    /// counts as spent from the backing store's point of view, matching
    /// what a caller deciding whether to grow the process would want to
    /// know.
    pub fn report_free_bytes(&self) -> usize {
        let backing = self.backing.read().unwrap();
        backing.regions.iter().map(|r| r.list_pool.free_bytes()).sum()
    }

    /// Sum of every backing region's reserved size.
    pub fn report_total_bytes(&self) -> usize {
        let backing = self.backing.read().unwrap();
        backing.regions.iter().map(|r| r.reservation.size).sum()
    }

    fn procure_large_pool(&self, block_size: usize) -> Arc<BlockPool> {
        let mut made = None;
        self.alloc_large_slab(|addr, region| {
            let pool = Arc::new(BlockPool::new(addr, LARGE_POOL, block_size));
            made = Some(pool.clone());
            PageDescriptor::large_block(pool, region)
        });
        self.stats.segments_large.increase(1);
        made.expect("alloc_large_slab always installs before returning")
    }

    fn procure_small_pool(&self, block_size: usize) -> Arc<BlockPool> {
        let slab_addr = self.pools.container.allocate(|| self.procure_container_pool());
        let pool = Arc::new(BlockPool::new(slab_addr, SMALL_POOL, block_size));
        let page_num = page_number(slab_addr);
        self.page_index.mutate(page_num, |d| match d {
            PageDescriptor::SmallContainer { slots, container, .. } => {
                let slot = container.slot_index(slab_addr);
                assert!(
                    slots[slot].is_none(),
                    "slot {slot} already occupied when installing slab 0x{slab_addr:x}"
                );
                slots[slot] = Some(pool.clone());
            }
            _ => unreachable!("small-slab carved from a non-container page"),
        });
        self.stats.segments_small.increase(1);
        pool
    }

    fn procure_container_pool(&self) -> Arc<BlockPool> {
        let mut made = None;
        self.alloc_large_slab(|addr, region| {
            let pool = Arc::new(BlockPool::new(addr, LARGE_POOL, SMALL_POOL));
            made = Some(pool.clone());
            PageDescriptor::small_container(pool, region)
        });
        self.stats.segments_container.increase(1);
        made.expect("alloc_large_slab always installs before returning")
    }

    /// Carve a 2 MiB-aligned page out of some backing region, growing the
    /// backing store if none has room, and install `install(addr, region)`
    /// as that page's descriptor before releasing the backing-store lock.
    /// Keeping the carve and the descriptor swap under the same lock
    /// acquisition is what stops a concurrent procurement or reclamation
    /// from observing the page half-transitioned -- carved out of the
    /// list pool but still tagged `Huge`, or vice versa.
    fn alloc_large_slab(&self, install: impl FnOnce(usize, usize) -> PageDescriptor) -> usize {
        let mut backing = self.backing.write().unwrap();
        loop {
            for (region, r) in backing.regions.iter_mut().enumerate() {
                if let Some(addr) = r.list_pool.allocate_aligned(LARGE_POOL) {
                    self.page_index.swap(page_number(addr), install(addr, region));
                    return addr;
                }
            }
            self.grow(&mut backing);
        }
    }

    fn allocate_list_pool(&self, size: usize) -> usize {
        let mut backing = self.backing.write().unwrap();
        loop {
            for r in backing.regions.iter_mut() {
                if let Some(addr) = r.list_pool.allocate(size) {
                    return addr;
                }
            }
            self.grow(&mut backing);
        }
    }

    fn grow(&self, backing: &mut BackingStore) {
        let size = backing.next_region_size;
        debug!("growing backing store by {size} bytes (region {})", backing.regions.len());
        let reservation = os::reserve_aligned(size, crate::constants::PAGE);
        let list_pool = ListPool::new(reservation.base, size);
        let region = backing.regions.len();

        let mut addr = reservation.base;
        let end = reservation.base + size;
        while addr < end {
            self.page_index.install(page_number(addr), PageDescriptor::huge(region));
            addr += crate::constants::PAGE;
        }

        backing.regions.push(BackingRegion { reservation, list_pool });
        backing.next_region_size *= 2;
        self.stats.regions.increase(1);
        self.stats.reserved_bytes.increase(size as i64);
    }

    fn reclaim_large(&self, pool: &Arc<BlockPool>) {
        let page_num = page_number(pool.base());
        // The free-to-list-pool and the swap-to-`Huge` must happen under
        // one backing-store lock acquisition: otherwise a concurrent
        // procurement could carve this slab right back out (or install
        // its own descriptor) between the two steps, and this swap would
        // either clobber that fresh descriptor or hand out bytes still
        // tagged `LargeBlock`.
        let mut backing = self.backing.write().unwrap();
        let region = self.page_index.mutate(page_num, |d| match d {
            PageDescriptor::LargeBlock { region, .. } => *region,
            _ => unreachable!("reclaiming a large-block pool off a non-large-block page"),
        });
        backing.regions[region].list_pool.free(pool.base());
        self.page_index.swap(page_num, PageDescriptor::huge(region));
        drop(backing);
        self.stats.segments_large.decrease(1);
        self.stats.record_reclaim();
    }

    fn reclaim_small(&self, pool: &Arc<BlockPool>) {
        let addr = pool.base();
        let page_num = page_number(addr);
        let container = self.page_index.mutate(page_num, |d| match d {
            PageDescriptor::SmallContainer { slots, container, .. } => {
                let slot = container.slot_index(addr);
                assert!(
                    slots[slot].is_some(),
                    "slot {slot} already empty when reclaiming slab 0x{addr:x}"
                );
                slots[slot] = None;
                container.clone()
            }
            _ => unreachable!("reclaiming a small-slab off a non-container page"),
        });
        self.stats.segments_small.decrease(1);
        self.stats.record_reclaim();
        // Cascades: freeing the container's 4 KiB block may in turn drop
        // the whole 2 MiB container back to the backing store.
        self.pools
            .container
            .free(&container, addr, |p| self.reclaim_container(p));
    }

    fn reclaim_container(&self, pool: &Arc<BlockPool>) {
        let page_num = page_number(pool.base());
        // Same atomicity requirement as `reclaim_large`: free-to-list-pool
        // and swap-to-`Huge` are one step under the backing-store lock.
        let mut backing = self.backing.write().unwrap();
        let region = self.page_index.mutate(page_num, |d| match d {
            PageDescriptor::SmallContainer { region, .. } => *region,
            _ => unreachable!("reclaiming a container pool off a non-container page"),
        });
        backing.regions[region].list_pool.free(pool.base());
        self.page_index.swap(page_num, PageDescriptor::huge(region));
        drop(backing);
        self.stats.segments_container.decrease(1);
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Manager {
    /// Returns every reserved backing region to the OS. Per the crate's
    /// scope, memory is never trickled back before this point -- a region
    /// lives until the whole allocator goes away.
    fn drop(&mut self) {
        let mut backing = self.backing.write().unwrap();
        for region in backing.regions.drain(..) {
            os::release(region.reservation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocation_round_trips() {
        let mgr = Manager::new();
        let a = mgr.allocate(32);
        unsafe {
            std::ptr::write_bytes(a as *mut u8, 0xCC, 32);
        }
        mgr.free(a);
    }

    #[test]
    fn large_allocation_round_trips() {
        let mgr = Manager::new();
        let a = mgr.allocate(4000);
        unsafe {
            std::ptr::write_bytes(a as *mut u8, 0xDD, 4000);
        }
        mgr.free(a);
    }

    #[test]
    fn huge_allocation_round_trips() {
        let mgr = Manager::new();
        let a = mgr.allocate(LARGE_THRESHOLD + 1);
        unsafe {
            std::ptr::write_bytes(a as *mut u8, 0xEE, LARGE_THRESHOLD + 1);
        }
        mgr.free(a);
    }

    #[test]
    fn mixed_classes_stay_disjoint() {
        let mgr = Manager::new();
        let sizes = [8usize, 64, 500, 1024, 20000, 300_000, 40, 600];
        let mut addrs = Vec::new();
        for &s in &sizes {
            let a = mgr.allocate(s);
            unsafe { std::ptr::write_bytes(a as *mut u8, (s % 251) as u8, s) };
            addrs.push((a, s));
        }
        for &(a, s) in &addrs {
            unsafe {
                let byte = *(a as *const u8);
                assert_eq!(byte, (s % 251) as u8, "data corrupted before free");
            }
        }
        for (a, _) in addrs {
            mgr.free(a);
        }
    }

    #[test]
    fn reports_grow_with_demand() {
        let mgr = Manager::new();
        assert_eq!(mgr.report_total_bytes(), 0);
        let a = mgr.allocate(64);
        assert!(mgr.report_total_bytes() > 0);
        mgr.free(a);
    }
}
