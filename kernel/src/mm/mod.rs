//! Memory management
//!
//! Layering, leaves first: the canonical region map ([`region`]) merges the
//! firmware map with kernel and device reservations; the buddy allocator
//! ([`frame_allocator`]) is seeded from it; paging ([`page_table`]) builds
//! the kernel directory and per-process trees; the heap ([`heap`]) sits on
//! frames + paging; [`vas`] owns process address spaces and
//! [`user_validation`] guards every user pointer the kernel touches.

use core::sync::atomic::{AtomicU64, Ordering};

pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod region;
pub mod user_validation;
pub mod vas;

pub use frame_allocator::{AllocFlags, FrameState, FRAME_ALLOCATOR, INVALID_PAGE_FRAME};
pub use page_table::PageFlags;
pub use region::{RegionFlags, RegionKind, RegionTypeTag, REGION_MAP};

/// Size of a physical frame / virtual page (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// First virtual address of the higher half. Physical-map operations on
/// addresses at or above this are kernel bugs.
pub const HIGHER_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Start of the kernel heap virtual window.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Maximum size the kernel heap window may grow to (64 MiB).
pub const KERNEL_HEAP_MAX: u64 = 64 * 1024 * 1024;

/// Higher-half direct-mapping offset, supplied by the boot loader. All of
/// physical memory is aliased at `phys + offset`. Zero means "not yet
/// known"; the host test harness points this at a buffer standing in for
/// physical memory.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the HHDM offset. Called once from the memory boot phase (or by a
/// test fixture).
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Translate a physical address to its HHDM alias. `None` until the offset
/// is known.
pub fn phys_to_virt(phys: u64) -> Option<u64> {
    let offset = HHDM_OFFSET.load(Ordering::Relaxed);
    if offset == 0 {
        None
    } else {
        Some(offset.wrapping_add(phys))
    }
}

#[inline]
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

#[inline]
pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Shared fixtures for host tests that stand a heap buffer in for physical
/// memory. The HHDM offset is process-global state, so tests that set it
/// serialize on [`test_support::lock_env`].
#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static ENV: Mutex<()> = Mutex::new(());

    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Leak a page-aligned, zeroed buffer standing in for physical memory.
    pub fn leak_phys_mem(size: usize) -> &'static mut [u8] {
        let layout = core::alloc::Layout::from_size_align(size, 4096).unwrap();
        // SAFETY: layout has non-zero size; the allocation is leaked for
        // the lifetime of the test process.
        unsafe {
            let ptr = std::alloc::alloc_zeroed(layout);
            assert!(!ptr.is_null());
            core::slice::from_raw_parts_mut(ptr, size)
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
    }
}
