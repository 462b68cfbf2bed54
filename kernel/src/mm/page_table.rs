//! Page table management
//!
//! Four-level paging. The kernel directory is built once during the memory
//! phase, aliases the boot loader's higher-half mappings (HHDM + kernel
//! window) and is never destroyed. Per-process directories share the high
//! half by aliasing the kernel PML4 and own everything below it.
//!
//! Tables are only ever touched through their HHDM aliases: the process
//! owns its low-half tables, the HHDM is a view. Destruction therefore
//! walks the low half only and leaves the aliased kernel entries alone.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::frame_allocator::{AllocFlags, FrameAllocator};
use super::{phys_to_virt, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// PML4 index where the higher half begins.
pub const HIGH_HALF_START_INDEX: usize = 256;

bitflags! {
    /// x86_64 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Mask extracting the physical address from an entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Page table entry
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.bits() != 0
    }

    pub fn addr(&self) -> u64 {
        self.entry & ADDR_MASK
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.entry)
    }

    pub fn set(&mut self, phys: u64, flags: PageFlags) {
        self.entry = (phys & ADDR_MASK) | flags.bits();
    }

    pub fn add_flags(&mut self, flags: PageFlags) {
        self.entry |= flags.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// A page table: 512 entries, page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-level indices of a canonical virtual address.
#[derive(Debug, Clone, Copy)]
struct PageIndices {
    l4: usize,
    l3: usize,
    l2: usize,
    l1: usize,
}

impl PageIndices {
    fn of(virt: u64) -> Self {
        Self {
            l4: ((virt >> 39) & 0x1FF) as usize,
            l3: ((virt >> 30) & 0x1FF) as usize,
            l2: ((virt >> 21) & 0x1FF) as usize,
            l1: ((virt >> 12) & 0x1FF) as usize,
        }
    }
}

/// Physical address of the kernel directory. Zero until the memory phase
/// builds it.
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

pub fn kernel_pml4() -> u64 {
    KERNEL_PML4.load(Ordering::Relaxed)
}

/// View a table through its HHDM alias.
fn table_ptr(phys: u64) -> KernelResult<*mut PageTable> {
    let virt = phys_to_virt(phys).ok_or(KernelError::NotInitialized { subsystem: "hhdm" })?;
    Ok(virt as *mut PageTable)
}

/// Build the kernel directory: a fresh PML4 whose high half aliases the
/// boot directory's high-half entries. Returns its physical address.
pub fn kernel_dir_init(boot_pml4_phys: u64, alloc: &mut FrameAllocator) -> KernelResult<u64> {
    let pml4_phys = alloc.alloc_page_frame(AllocFlags::KERNEL.union(AllocFlags::ZERO));
    if pml4_phys == 0 {
        return Err(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        });
    }
    let new_table = table_ptr(pml4_phys)?;
    let boot_table = table_ptr(boot_pml4_phys)?;
    // SAFETY: both tables are live, HHDM-aliased frames; the new one was
    // just zero-allocated and is exclusively ours.
    unsafe {
        for i in HIGH_HALF_START_INDEX..PAGE_TABLE_ENTRIES {
            (*new_table).entries[i] = (*boot_table).entries[i];
        }
    }
    KERNEL_PML4.store(pml4_phys, Ordering::Relaxed);
    Ok(pml4_phys)
}

/// Walk one level down from `entry`, allocating the next table on demand.
///
/// Intermediate tables that will cover user-accessible pages must carry the
/// USER bit themselves, so `user` widens existing entries too.
fn descend_or_create(
    entry: &mut PageTableEntry,
    user: bool,
    alloc: &mut FrameAllocator,
) -> KernelResult<u64> {
    if entry.is_present() {
        if user && !entry.flags().contains(PageFlags::USER) {
            entry.add_flags(PageFlags::USER);
        }
        return Ok(entry.addr());
    }
    let table_phys = alloc.alloc_page_frame(AllocFlags::KERNEL.union(AllocFlags::ZERO));
    if table_phys == 0 {
        return Err(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        });
    }
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if user {
        flags |= PageFlags::USER;
    }
    entry.set(table_phys, flags);
    Ok(table_phys)
}

/// Map one 4 KiB page in the directory rooted at `pml4_phys`.
pub fn map_page_4k(
    pml4_phys: u64,
    virt: u64,
    phys: u64,
    flags: PageFlags,
    alloc: &mut FrameAllocator,
) -> KernelResult<()> {
    if virt % PAGE_SIZE as u64 != 0 || phys % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::InvalidAddress { addr: virt | phys });
    }
    let idx = PageIndices::of(virt);
    let user = flags.contains(PageFlags::USER);

    let l4 = table_ptr(pml4_phys)?;
    // SAFETY: every table below is reached through a present entry of its
    // parent (or freshly allocated); all accesses go through HHDM aliases
    // of frames owned by this directory.
    unsafe {
        let l3_phys = descend_or_create(&mut (*l4).entries[idx.l4], user, alloc)?;
        let l3 = table_ptr(l3_phys)?;
        let l2_phys = descend_or_create(&mut (*l3).entries[idx.l3], user, alloc)?;
        let l2 = table_ptr(l2_phys)?;
        let l1_phys = descend_or_create(&mut (*l2).entries[idx.l2], user, alloc)?;
        let l1 = table_ptr(l1_phys)?;
        let leaf = &mut (*l1).entries[idx.l1];
        if leaf.is_present() {
            return Err(KernelError::InvalidState {
                expected: "unmapped page",
                actual: "mapped page",
            });
        }
        leaf.set(phys, flags | PageFlags::PRESENT);
    }
    flush_tlb(virt);
    Ok(())
}

/// Unmap a 4 KiB page; returns the physical address it pointed at.
pub fn unmap_page_4k(pml4_phys: u64, virt: u64) -> Option<u64> {
    let idx = PageIndices::of(virt);
    let l4 = table_ptr(pml4_phys).ok()?;
    // SAFETY: walk of present entries through HHDM aliases.
    unsafe {
        let l4e = (*l4).entries[idx.l4];
        if !l4e.is_present() {
            return None;
        }
        let l3 = table_ptr(l4e.addr()).ok()?;
        let l3e = (*l3).entries[idx.l3];
        if !l3e.is_present() || l3e.flags().contains(PageFlags::HUGE) {
            return None;
        }
        let l2 = table_ptr(l3e.addr()).ok()?;
        let l2e = (*l2).entries[idx.l2];
        if !l2e.is_present() || l2e.flags().contains(PageFlags::HUGE) {
            return None;
        }
        let l1 = table_ptr(l2e.addr()).ok()?;
        let leaf = &mut (*l1).entries[idx.l1];
        if !leaf.is_present() {
            return None;
        }
        let phys = leaf.addr();
        leaf.clear();
        flush_tlb(virt);
        Some(phys)
    }
}

/// Translate a virtual address through the given directory. Understands
/// 1 GiB and 2 MiB leaves (the boot loader maps the HHDM with them).
pub fn virt_to_phys(pml4_phys: u64, virt: u64) -> Option<u64> {
    let idx = PageIndices::of(virt);
    let l4 = table_ptr(pml4_phys).ok()?;
    // SAFETY: read-only walk of present entries through HHDM aliases.
    unsafe {
        let l4e = (*l4).entries[idx.l4];
        if !l4e.is_present() {
            return None;
        }
        let l3 = table_ptr(l4e.addr()).ok()?;
        let l3e = (*l3).entries[idx.l3];
        if !l3e.is_present() {
            return None;
        }
        if l3e.flags().contains(PageFlags::HUGE) {
            return Some(l3e.addr() + (virt & 0x3FFF_FFFF));
        }
        let l2 = table_ptr(l3e.addr()).ok()?;
        let l2e = (*l2).entries[idx.l2];
        if !l2e.is_present() {
            return None;
        }
        if l2e.flags().contains(PageFlags::HUGE) {
            return Some(l2e.addr() + (virt & 0x1F_FFFF));
        }
        let l1 = table_ptr(l2e.addr()).ok()?;
        let leaf = (*l1).entries[idx.l1];
        if !leaf.is_present() {
            return None;
        }
        Some(leaf.addr() + (virt & 0xFFF))
    }
}

/// Whether `virt` is reachable from ring 3 through this directory: every
/// level must be present and user-accessible.
pub fn is_user_accessible(pml4_phys: u64, virt: u64) -> bool {
    let idx = PageIndices::of(virt);
    let Ok(l4) = table_ptr(pml4_phys) else {
        return false;
    };
    let user = PageFlags::PRESENT | PageFlags::USER;
    // SAFETY: read-only walk of present entries through HHDM aliases.
    unsafe {
        let l4e = (*l4).entries[idx.l4];
        if !l4e.flags().contains(user) {
            return false;
        }
        let Ok(l3) = table_ptr(l4e.addr()) else {
            return false;
        };
        let l3e = (*l3).entries[idx.l3];
        if !l3e.flags().contains(user) {
            return false;
        }
        if l3e.flags().contains(PageFlags::HUGE) {
            return true;
        }
        let Ok(l2) = table_ptr(l3e.addr()) else {
            return false;
        };
        let l2e = (*l2).entries[idx.l2];
        if !l2e.flags().contains(user) {
            return false;
        }
        if l2e.flags().contains(PageFlags::HUGE) {
            return true;
        }
        let Ok(l1) = table_ptr(l2e.addr()) else {
            return false;
        };
        (*l1).entries[idx.l1].flags().contains(user)
    }
}

/// Free the user-owned half of a process directory: every low-half PT, PD
/// and PDPT, then the PML4 itself. High-half entries alias the kernel
/// directory and are left untouched. Leaf data frames must already have
/// been unmapped and freed by the owner.
pub fn destroy_user_tables(pml4_phys: u64, alloc: &mut FrameAllocator) {
    let Ok(l4) = table_ptr(pml4_phys) else {
        return;
    };
    // SAFETY: the directory is dead (no CPU runs on it); all table frames
    // below the low half are exclusively owned by it.
    unsafe {
        for i4 in 0..HIGH_HALF_START_INDEX {
            let l4e = (*l4).entries[i4];
            if !l4e.is_present() {
                continue;
            }
            let Ok(l3) = table_ptr(l4e.addr()) else {
                continue;
            };
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let l3e = (*l3).entries[i3];
                if !l3e.is_present() || l3e.flags().contains(PageFlags::HUGE) {
                    continue;
                }
                let Ok(l2) = table_ptr(l3e.addr()) else {
                    continue;
                };
                for i2 in 0..PAGE_TABLE_ENTRIES {
                    let l2e = (*l2).entries[i2];
                    if !l2e.is_present() || l2e.flags().contains(PageFlags::HUGE) {
                        continue;
                    }
                    alloc.free_page_frame(l2e.addr());
                }
                alloc.free_page_frame(l3e.addr());
            }
            alloc.free_page_frame(l4e.addr());
            (*l4).entries[i4].clear();
        }
    }
    alloc.free_page_frame(pml4_phys);
}

/// Invalidate the TLB entry for `virt` on the running CPU.
fn flush_tlb(virt: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

/// Physical address of the directory the CPU is running on.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn current_pml4() -> u64 {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    frame.start_address().as_u64()
}

/// Switch the CPU onto the directory rooted at `pml4_phys`.
///
/// # Safety
///
/// The directory must map the currently executing code, the current stack
/// and the HHDM, or the CPU is lost.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn activate(pml4_phys: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;
    let frame = PhysFrame::containing_address(PhysAddr::new(pml4_phys));
    // SAFETY: caller guarantees the directory covers the running kernel.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::PageFrame;
    use crate::mm::region::RegionMap;
    use crate::mm::test_support;
    use alloc::vec;
    use alloc::vec::Vec;

    const MEM: usize = 8 * 1024 * 1024;
    const FRAMES: usize = MEM / 4096;

    struct Fixture {
        alloc: FrameAllocator,
        _arena: Vec<PageFrame>,
        mem_base: u64,
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
        Fixture {
            alloc,
            _arena: arena,
            mem_base: base,
        }
    }

    #[test]
    fn test_map_translate_unmap() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let pml4 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        let frame = fx.alloc.alloc_page_frame(AllocFlags::ZERO);

        map_page_4k(
            pml4,
            0x40_0000,
            frame,
            PageFlags::PRESENT | PageFlags::WRITABLE,
            &mut fx.alloc,
        )
        .expect("mapping a free page must succeed");

        assert_eq!(virt_to_phys(pml4, 0x40_0000), Some(frame));
        assert_eq!(virt_to_phys(pml4, 0x40_0123), Some(frame + 0x123));
        assert_eq!(virt_to_phys(pml4, 0x40_1000), None);

        assert_eq!(unmap_page_4k(pml4, 0x40_0000), Some(frame));
        assert_eq!(virt_to_phys(pml4, 0x40_0000), None);
        let _ = fx.mem_base;
    }

    #[test]
    fn test_double_map_rejected() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let pml4 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        let frame = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        map_page_4k(pml4, 0x1000, frame, PageFlags::PRESENT, &mut fx.alloc).unwrap();
        let err = map_page_4k(pml4, 0x1000, frame, PageFlags::PRESENT, &mut fx.alloc);
        assert!(err.is_err(), "re-mapping a mapped page must fail");
    }

    #[test]
    fn test_unaligned_rejected() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let pml4 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        let err = map_page_4k(pml4, 0x1001, 0x2000, PageFlags::PRESENT, &mut fx.alloc);
        assert!(err.is_err());
    }

    #[test]
    fn test_user_bit_propagates_to_intermediates() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let pml4 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        let frame = fx.alloc.alloc_page_frame(AllocFlags::ZERO);

        // First a supervisor mapping in the same L4 slot, then a user one:
        // the shared intermediate tables must be widened to USER.
        map_page_4k(
            pml4,
            0x20_0000,
            frame,
            PageFlags::PRESENT | PageFlags::WRITABLE,
            &mut fx.alloc,
        )
        .unwrap();
        assert!(!is_user_accessible(pml4, 0x20_0000));

        let uframe = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        map_page_4k(
            pml4,
            0x20_1000,
            uframe,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            &mut fx.alloc,
        )
        .unwrap();
        assert!(is_user_accessible(pml4, 0x20_1000));
        // The supervisor leaf stays supervisor even though intermediates
        // are now user-reachable.
        assert!(!is_user_accessible(pml4, 0x20_0000));
    }

    #[test]
    fn test_destroy_frees_only_low_half() {
        let _env = test_support::lock_env();
        let mut fx = fixture();

        // Fake "kernel" high half: a directory with one high-half entry.
        let kernel_pml4 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        let shared_l3 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        // SAFETY: both frames live inside the test buffer.
        unsafe {
            let t = (crate::mm::phys_to_virt(kernel_pml4).unwrap()) as *mut PageTable;
            (*t).entries[300].set(shared_l3, PageFlags::PRESENT | PageFlags::WRITABLE);
        }

        // Process directory aliasing that high half.
        let proc_pml4 = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        // SAFETY: as above.
        unsafe {
            let src = (crate::mm::phys_to_virt(kernel_pml4).unwrap()) as *mut PageTable;
            let dst = (crate::mm::phys_to_virt(proc_pml4).unwrap()) as *mut PageTable;
            for i in HIGH_HALF_START_INDEX..PAGE_TABLE_ENTRIES {
                (*dst).entries[i] = (*src).entries[i];
            }
        }

        let user_frame = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        map_page_4k(
            proc_pml4,
            0x40_0000,
            user_frame,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            &mut fx.alloc,
        )
        .unwrap();

        let free_before = fx.alloc.free_frame_count();
        unmap_page_4k(proc_pml4, 0x40_0000);
        fx.alloc.free_page_frame(user_frame);
        destroy_user_tables(proc_pml4, &mut fx.alloc);
        // Freed: user frame + 3 intermediate tables + the PML4 itself.
        assert_eq!(fx.alloc.free_frame_count(), free_before + 5);
        // The shared high-half L3 table must survive.
        assert_eq!(
            fx.alloc.frame_state(shared_l3),
            Some(crate::mm::FrameState::Allocated)
        );
    }
}
