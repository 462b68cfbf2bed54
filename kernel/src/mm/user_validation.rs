//! User pointer validation and guarded copies
//!
//! Every byte the kernel moves across the user boundary goes through here.
//! A range is only touched after every 4 KiB page it spans proves present
//! and user-accessible in the faulting process's directory; the copies
//! themselves go through the HHDM aliases of the translated frames, so
//! they work no matter which directory the CPU is running on.

use core::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use super::page_table;
use super::{phys_to_virt, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Exclusive upper bound of the user half.
pub const USER_SPACE_TOP: u64 = 0x0000_8000_0000_0000;

/// Per-call byte cap for user I/O buffers.
pub const USER_COPY_MAX: usize = 512;

/// Path length cap, NUL included.
pub const USER_PATH_MAX: usize = 128;

/// Whether the one-time trip-wire has run.
static SELF_CHECK_DONE: AtomicBool = AtomicBool::new(false);

/// Validate that every page spanned by `[addr, addr + len)` is present and
/// user-accessible in the given directory.
pub fn validate_user_range(pml4_phys: u64, addr: u64, len: usize) -> bool {
    if len == 0 {
        return false;
    }
    let Some(end) = addr.checked_add(len as u64) else {
        return false;
    };
    if end > USER_SPACE_TOP {
        return false;
    }
    let mut page = super::align_down(addr, PAGE_SIZE as u64);
    while page < end {
        if !page_table::is_user_accessible(pml4_phys, page) {
            return false;
        }
        page += PAGE_SIZE as u64;
    }
    true
}

/// One-time trip-wire against misconfigured page tables: a known
/// kernel-only page must fail the user walk. Panics if it does not.
pub fn self_check(pml4_phys: u64) {
    if SELF_CHECK_DONE.swap(true, Ordering::Relaxed) {
        return;
    }
    let kernel_page = super::KERNEL_HEAP_BASE;
    if page_table::is_user_accessible(pml4_phys, kernel_page) {
        panic!(
            "user-copy self check: kernel page {:#x} is user accessible",
            kernel_page
        );
    }
    debug!("user-copy self check passed");
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset_self_check() {
    SELF_CHECK_DONE.store(false, Ordering::Relaxed);
}

/// HHDM alias of one user byte range confined to a single page.
fn page_chunk_ptr(pml4_phys: u64, user_addr: u64, want: usize) -> KernelResult<(*mut u8, usize)> {
    let page_off = (user_addr % PAGE_SIZE as u64) as usize;
    let chunk = want.min(PAGE_SIZE - page_off);
    let phys = page_table::virt_to_phys(pml4_phys, user_addr).ok_or(
        KernelError::UnmappedMemory { addr: user_addr },
    )?;
    let virt = phys_to_virt(phys).ok_or(KernelError::NotInitialized { subsystem: "hhdm" })?;
    Ok((virt as *mut u8, chunk))
}

/// Copy `dst.len()` bytes in from user memory after validating the whole
/// range.
pub fn copy_from_user(pml4_phys: u64, user_src: u64, dst: &mut [u8]) -> KernelResult<()> {
    if !validate_user_range(pml4_phys, user_src, dst.len()) {
        return Err(KernelError::UserAccessDenied {
            addr: user_src,
            len: dst.len(),
        });
    }
    let mut copied = 0;
    while copied < dst.len() {
        let (src, chunk) = page_chunk_ptr(pml4_phys, user_src + copied as u64, dst.len() - copied)?;
        // SAFETY: the range validated user-accessible; `src` aliases the
        // backing frame through the HHDM for exactly `chunk` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr().add(copied), chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `src` out to user memory after validating the whole range.
pub fn copy_to_user(pml4_phys: u64, user_dst: u64, src: &[u8]) -> KernelResult<()> {
    if !validate_user_range(pml4_phys, user_dst, src.len()) {
        return Err(KernelError::UserAccessDenied {
            addr: user_dst,
            len: src.len(),
        });
    }
    let mut copied = 0;
    while copied < src.len() {
        let (dst, chunk) = page_chunk_ptr(pml4_phys, user_dst + copied as u64, src.len() - copied)?;
        // SAFETY: as in copy_from_user, but writing into the user frame.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(copied), dst, chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated path in from user memory. Pages are validated as
/// the string is walked, so a short path right at the end of a mapping is
/// accepted. Returns the length excluding the NUL.
pub fn copy_path_from_user(
    pml4_phys: u64,
    user_src: u64,
    buf: &mut [u8; USER_PATH_MAX],
) -> KernelResult<usize> {
    let mut len = 0;
    while len < USER_PATH_MAX {
        let addr = user_src + len as u64;
        if !validate_user_range(pml4_phys, addr, 1) {
            return Err(KernelError::UserAccessDenied { addr, len: 1 });
        }
        // The chunk never crosses a page, so validating its first byte
        // validated all of it.
        let (src, chunk) = page_chunk_ptr(pml4_phys, addr, USER_PATH_MAX - len)?;
        for i in 0..chunk {
            // SAFETY: byte i lies in the validated page.
            let b = unsafe { *src.add(i) };
            if b == 0 {
                return Ok(len + i);
            }
            buf[len + i] = b;
        }
        len += chunk;
    }
    Err(KernelError::InvalidArgument { name: "path" })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::{AllocFlags, FrameAllocator, PageFrame};
    use crate::mm::page_table::PageFlags;
    use crate::mm::region::RegionMap;
    use crate::mm::test_support;
    use crate::mm::vas::ProcessVmTable;
    use alloc::vec;
    use alloc::vec::Vec;

    const MEM: usize = 16 * 1024 * 1024;
    const FRAMES: usize = MEM / 4096;

    struct Fixture {
        alloc: FrameAllocator,
        table: ProcessVmTable,
        pml4: u64,
        _arena: Vec<PageFrame>,
    }

    fn fixture() -> Fixture {
        let mem = test_support::leak_phys_mem(MEM);
        let base = mem.as_ptr() as u64;
        crate::mm::set_hhdm_offset(base);
        let mut map = RegionMap::new();
        map.add_usable(0, MEM as u64, "test ram");
        let mut arena = vec![
            PageFrame {
                ref_count: 0,
                state: crate::mm::FrameState::Reserved,
                flags: 0,
                order: 0xFF,
                region_id: u16::MAX,
                next_free: u32::MAX,
            };
            FRAMES
        ];
        let mut alloc = FrameAllocator::new();
        // SAFETY: arena outlives the fixture.
        unsafe { alloc.init(arena.as_mut_ptr(), FRAMES, &map, base) };
        let kernel_pml4 = alloc.alloc_page_frame(AllocFlags::ZERO);
        let mut table = ProcessVmTable::new();
        let pid = table.create(kernel_pml4, &mut alloc).unwrap();
        table
            .map_user(pid, 0x40_0000, 2 * 4096, PageFlags::WRITABLE, &mut alloc)
            .unwrap();
        let pml4 = table.get_page_dir(pid).unwrap();
        Fixture {
            alloc,
            table,
            pml4,
            _arena: arena,
        }
    }

    /// Write into the user page through its translated frame.
    fn poke(pml4: u64, user_addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            let phys = crate::mm::page_table::virt_to_phys(pml4, user_addr + i as u64).unwrap();
            let va = crate::mm::phys_to_virt(phys).unwrap() as *mut u8;
            // SAFETY: the frame backs a mapped test page inside the buffer.
            unsafe { *va = *b };
        }
    }

    #[test]
    fn test_validate_rejects_kernel_and_unmapped() {
        let _env = test_support::lock_env();
        let fx = fixture();
        assert!(validate_user_range(fx.pml4, 0x40_0000, 512));
        assert!(!validate_user_range(fx.pml4, 0x40_0000, 0), "zero length");
        assert!(
            !validate_user_range(fx.pml4, 0xFFFF_8000_0000_0000, 8),
            "kernel-half address must fail"
        );
        assert!(
            !validate_user_range(fx.pml4, 0x50_0000, 8),
            "unmapped user address must fail"
        );
        let _ = &fx.table;
    }

    #[test]
    fn test_validation_is_page_by_page() {
        let _env = test_support::lock_env();
        let fx = fixture();
        // Two mapped pages: a range crossing their boundary passes.
        assert!(validate_user_range(fx.pml4, 0x40_0F80, 256));
        // Crossing out of the mapping fails, even though it starts mapped.
        assert!(!validate_user_range(fx.pml4, 0x40_1F80, 256));
    }

    #[test]
    fn test_copy_round_trip_across_boundary() {
        let _env = test_support::lock_env();
        let fx = fixture();
        let user = 0x40_0FF0; // straddles the two mapped pages
        let msg = b"sixteen byte msg";
        copy_to_user(fx.pml4, user, msg).expect("copy_to_user over mapped pages");
        let mut back = [0u8; 16];
        copy_from_user(fx.pml4, user, &mut back).expect("copy_from_user back");
        assert_eq!(&back, msg);
    }

    #[test]
    fn test_copy_to_unmapped_fails() {
        let _env = test_support::lock_env();
        let fx = fixture();
        let mut buf = [0u8; 8];
        assert!(copy_from_user(fx.pml4, 0x66_0000, &mut buf).is_err());
        assert!(copy_to_user(fx.pml4, 0x66_0000, &buf).is_err());
    }

    #[test]
    fn test_path_copy() {
        let _env = test_support::lock_env();
        let fx = fixture();
        poke(fx.pml4, 0x40_0000, b"/tmp/hello\0");
        let mut buf = [0u8; USER_PATH_MAX];
        let len = copy_path_from_user(fx.pml4, 0x40_0000, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"/tmp/hello");
    }

    #[test]
    fn test_unterminated_path_rejected() {
        let _env = test_support::lock_env();
        let fx = fixture();
        poke(fx.pml4, 0x40_0000, &[b'a'; USER_PATH_MAX]);
        let mut buf = [0u8; USER_PATH_MAX];
        assert!(copy_path_from_user(fx.pml4, 0x40_0000, &mut buf).is_err());
    }

    #[test]
    fn test_self_check_trips_on_sane_tables() {
        let _env = test_support::lock_env();
        let fx = fixture();
        reset_self_check();
        // The heap window is not mapped user-accessible here, so the
        // trip-wire must pass quietly.
        self_check(fx.pml4);
    }
}
