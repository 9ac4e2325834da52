//! The single OS-boundary primitive the rest of the crate depends on:
//! reserve a page-aligned region of virtual memory and release it again.
//!
//! Everything upstream of this module treats the reservation as
//! infallible except at the hard `MAX_MEMORY` ceiling; see `reserve_aligned`.

use log::warn;

/// A page-aligned region obtained from the OS. Dropping it does *not*
/// release the memory -- release is explicit via [`release`], mirroring
/// the manual lifetime the backing-store hierarchy imposes on its slabs.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub base: usize,
    pub size: usize,
}

#[cfg(unix)]
pub fn reserve_aligned(bytes: usize, alignment: usize) -> Reservation {
    use libc::{c_void, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    debug_assert!(alignment.is_power_of_two());
    // Overallocate so we can carve out an aligned sub-range, mirroring the
    // overallocate-then-trim strategy mmalloc-style allocators use when the
    // OS gives no alignment hint.
    let over_size = bytes + alignment;
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            over_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        panic!(
            "reserve_aligned: mmap({over_size}) failed: {}",
            errno::errno()
        );
    }
    let raw = p as usize;
    let aligned = crate::constants::align_up(raw, alignment);
    let pre = aligned - raw;
    let post = over_size - pre - bytes;
    unsafe {
        if pre > 0 {
            libc::munmap(p, pre);
        }
        if post > 0 {
            libc::munmap((aligned + bytes) as *mut c_void, post);
        }
    }
    Reservation {
        base: aligned,
        size: bytes,
    }
}

#[cfg(unix)]
pub fn release(region: Reservation) {
    let rc = unsafe { libc::munmap(region.base as *mut libc::c_void, region.size) };
    if rc != 0 {
        warn!(
            "release: munmap(0x{:x}, {}) failed: {}",
            region.base,
            region.size,
            errno::errno()
        );
    }
}

#[cfg(windows)]
pub fn reserve_aligned(bytes: usize, alignment: usize) -> Reservation {
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    debug_assert!(alignment.is_power_of_two());
    // VirtualAlloc gives no alignment hint beyond the allocation
    // granularity, so overallocate, note an aligned address inside it,
    // free the whole thing, and retry pinned at that address. Racy against
    // other threads reserving memory, so retry a bounded number of times.
    let over_size = bytes + alignment;
    for _ in 0..8 {
        let probe = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                over_size,
                MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if probe.is_null() {
            panic!("reserve_aligned: VirtualAlloc failed: {}", unsafe {
                GetLastError()
            });
        }
        let aligned = crate::constants::align_up(probe as usize, alignment);
        unsafe {
            VirtualFree(probe, 0, MEM_RELEASE);
        }
        let p = unsafe {
            VirtualAlloc(
                aligned as *mut _,
                bytes,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if p as usize == aligned {
            return Reservation {
                base: aligned,
                size: bytes,
            };
        }
        if !p.is_null() {
            unsafe {
                VirtualFree(p, 0, MEM_RELEASE);
            }
        }
    }
    panic!("reserve_aligned: failed to land an aligned VirtualAlloc after 8 attempts");
}

#[cfg(windows)]
pub fn release(region: Reservation) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    let ok = unsafe { VirtualFree(region.base as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        warn!("release: VirtualFree(0x{:x}) failed", region.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_aligned_and_writable() {
        let r = reserve_aligned(4 * 1024 * 1024, 2 * 1024 * 1024);
        assert_eq!(r.base % (2 * 1024 * 1024), 0);
        unsafe {
            std::ptr::write_bytes(r.base as *mut u8, 0xAB, r.size);
            assert_eq!(*(r.base as *const u8), 0xAB);
            assert_eq!(*((r.base + r.size - 1) as *const u8), 0xAB);
        }
        release(r);
    }
}
