//! Process address spaces
//!
//! Fixed table of per-process virtual address spaces. Each slot owns a
//! PML4 whose high half aliases the kernel directory; the low half is
//! private to the process. Anonymous user memory (stacks, the embedded
//! program image) is tracked as regions so destruction can return every
//! frame before the page tables themselves are torn down.

use log::debug;
use spin::Mutex;

use super::frame_allocator::{AllocFlags, FrameAllocator, FRAME_ALLOCATOR};
use super::page_table::{
    self, PageFlags, PageTable, HIGH_HALF_START_INDEX, PAGE_TABLE_ENTRIES,
};
use super::{phys_to_virt, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Maximum number of live process address spaces.
pub const MAX_PROCESSES: usize = 16;

/// Process id 0 never names a process.
pub const INVALID_PROCESS_ID: u32 = 0;

/// Regions tracked per process (stacks, program image, heap windows).
const MAX_VM_REGIONS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct VmRegion {
    pub base: u64,
    pub len: u64,
    pub flags: PageFlags,
    used: bool,
}

impl VmRegion {
    const EMPTY: VmRegion = VmRegion {
        base: 0,
        len: 0,
        flags: PageFlags::empty(),
        used: false,
    };
}

/// One process address space.
pub struct ProcessVm {
    pub process_id: u32,
    pub pml4_phys: u64,
    regions: [VmRegion; MAX_VM_REGIONS],
    used: bool,
}

impl ProcessVm {
    const EMPTY: ProcessVm = ProcessVm {
        process_id: INVALID_PROCESS_ID,
        pml4_phys: 0,
        regions: [VmRegion::EMPTY; MAX_VM_REGIONS],
        used: false,
    };
}

/// The process VM table. Destroyed slots are immediately reusable; ids are
/// never reused so a stale id cannot resolve to a recycled slot.
pub struct ProcessVmTable {
    slots: [ProcessVm; MAX_PROCESSES],
    next_id: u32,
}

impl ProcessVmTable {
    pub const fn new() -> Self {
        Self {
            slots: [ProcessVm::EMPTY; MAX_PROCESSES],
            next_id: 1,
        }
    }

    fn slot_of(&self, pid: u32) -> Option<usize> {
        if pid == INVALID_PROCESS_ID {
            return None;
        }
        self.slots
            .iter()
            .position(|s| s.used && s.process_id == pid)
    }

    /// Create a fresh address space whose high half aliases
    /// `kernel_pml4_phys`.
    pub fn create(
        &mut self,
        kernel_pml4_phys: u64,
        alloc: &mut FrameAllocator,
    ) -> KernelResult<u32> {
        let slot = self
            .slots
            .iter()
            .position(|s| !s.used)
            .ok_or(KernelError::ResourceExhausted {
                resource: "process slots",
            })?;

        let pml4_phys = alloc.alloc_page_frame(AllocFlags::KERNEL.union(AllocFlags::ZERO));
        if pml4_phys == 0 {
            return Err(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            });
        }
        let src = phys_to_virt(kernel_pml4_phys)
            .ok_or(KernelError::NotInitialized { subsystem: "hhdm" })? as *const PageTable;
        let dst = phys_to_virt(pml4_phys)
            .ok_or(KernelError::NotInitialized { subsystem: "hhdm" })? as *mut PageTable;
        // SAFETY: both tables are HHDM-aliased frames; dst was just
        // zero-allocated and is exclusively ours.
        unsafe {
            for i in HIGH_HALF_START_INDEX..PAGE_TABLE_ENTRIES {
                (*dst).entries[i] = (*src).entries[i];
            }
        }

        let pid = self.next_id;
        self.next_id += 1;
        self.slots[slot] = ProcessVm {
            process_id: pid,
            pml4_phys,
            regions: [VmRegion::EMPTY; MAX_VM_REGIONS],
            used: true,
        };
        debug!("vm: created process {} (pml4 {:#x})", pid, pml4_phys);
        Ok(pid)
    }

    /// Tear down an address space: every mapped region frame, then the
    /// low-half page tables and the PML4.
    pub fn destroy(&mut self, pid: u32, alloc: &mut FrameAllocator) -> KernelResult<()> {
        let slot = self
            .slot_of(pid)
            .ok_or(KernelError::ProcessNotFound { pid })?;
        let pml4_phys = self.slots[slot].pml4_phys;

        for region in self.slots[slot].regions.iter().filter(|r| r.used) {
            let pages = region.len / PAGE_SIZE as u64;
            for i in 0..pages {
                let virt = region.base + i * PAGE_SIZE as u64;
                if let Some(phys) = page_table::unmap_page_4k(pml4_phys, virt) {
                    alloc.free_page_frame(phys);
                }
            }
        }
        page_table::destroy_user_tables(pml4_phys, alloc);
        self.slots[slot] = ProcessVm::EMPTY;
        debug!("vm: destroyed process {}", pid);
        Ok(())
    }

    pub fn get_page_dir(&self, pid: u32) -> Option<u64> {
        self.slot_of(pid).map(|i| self.slots[i].pml4_phys)
    }

    /// Map `len` bytes of zeroed anonymous memory at `virt`, user
    /// accessible. Rolls the whole mapping back on partial failure.
    pub fn map_user(
        &mut self,
        pid: u32,
        virt: u64,
        len: u64,
        flags: PageFlags,
        alloc: &mut FrameAllocator,
    ) -> KernelResult<()> {
        let slot = self
            .slot_of(pid)
            .ok_or(KernelError::ProcessNotFound { pid })?;
        if virt % PAGE_SIZE as u64 != 0 || len == 0 {
            return Err(KernelError::InvalidAddress { addr: virt });
        }
        let region_idx = self.slots[slot]
            .regions
            .iter()
            .position(|r| !r.used)
            .ok_or(KernelError::ResourceExhausted {
                resource: "vm regions",
            })?;
        let pml4_phys = self.slots[slot].pml4_phys;
        debug_assert!(high_half_matches(pml4_phys));

        let pages = super::align_up(len, PAGE_SIZE as u64) / PAGE_SIZE as u64;
        let flags = flags | PageFlags::PRESENT | PageFlags::USER;
        let mut mapped = 0u64;
        let mut failed = false;
        while mapped < pages {
            let page_virt = virt + mapped * PAGE_SIZE as u64;
            let phys = alloc.alloc_page_frame(AllocFlags::ZERO);
            if phys == 0 {
                failed = true;
                break;
            }
            if page_table::map_page_4k(pml4_phys, page_virt, phys, flags, alloc).is_err() {
                alloc.free_page_frame(phys);
                failed = true;
                break;
            }
            mapped += 1;
        }
        if failed {
            for i in 0..mapped {
                let page_virt = virt + i * PAGE_SIZE as u64;
                if let Some(phys) = page_table::unmap_page_4k(pml4_phys, page_virt) {
                    alloc.free_page_frame(phys);
                }
            }
            return Err(KernelError::OutOfMemory {
                requested: len as usize,
            });
        }

        self.slots[slot].regions[region_idx] = VmRegion {
            base: virt,
            len: pages * PAGE_SIZE as u64,
            flags,
            used: true,
        };
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.used).count()
    }
}

impl Default for ProcessVmTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The high half of a process directory must equal the kernel directory's
/// at all times. Checked on every user mapping in debug builds.
fn high_half_matches(pml4_phys: u64) -> bool {
    let kernel = page_table::kernel_pml4();
    if kernel == 0 {
        // Kernel directory not built yet (tests drive the table directly).
        return true;
    }
    let (Some(proc_va), Some(kern_va)) = (phys_to_virt(pml4_phys), phys_to_virt(kernel)) else {
        return false;
    };
    let proc_table = proc_va as *const PageTable;
    let kern_table = kern_va as *const PageTable;
    // SAFETY: read-only comparison of two live HHDM-aliased tables.
    unsafe {
        for i in HIGH_HALF_START_INDEX..PAGE_TABLE_ENTRIES {
            if (*proc_table).entries[i].addr() != (*kern_table).entries[i].addr() {
                return false;
            }
        }
    }
    true
}

/// Global process VM table.
///
/// Lock order: `PROCESS_VMS` before `FRAME_ALLOCATOR`.
pub static PROCESS_VMS: Mutex<ProcessVmTable> = Mutex::new(ProcessVmTable::new());

/// Create a process address space aliasing the kernel directory.
pub fn process_vm_create() -> KernelResult<u32> {
    let kernel = page_table::kernel_pml4();
    if kernel == 0 {
        return Err(KernelError::NotInitialized {
            subsystem: "kernel page directory",
        });
    }
    let mut table = PROCESS_VMS.lock();
    let mut alloc = FRAME_ALLOCATOR.lock();
    table.create(kernel, &mut alloc)
}

pub fn process_vm_destroy(pid: u32) -> KernelResult<()> {
    let mut table = PROCESS_VMS.lock();
    let mut alloc = FRAME_ALLOCATOR.lock();
    table.destroy(pid, &mut alloc)
}

pub fn process_vm_get_page_dir(pid: u32) -> Option<u64> {
    PROCESS_VMS.lock().get_page_dir(pid)
}

pub fn process_vm_map_user(pid: u32, virt: u64, len: u64, flags: PageFlags) -> KernelResult<()> {
    let mut table = PROCESS_VMS.lock();
    let mut alloc = FRAME_ALLOCATOR.lock();
    table.map_user(pid, virt, len, flags, &mut alloc)
}

pub fn process_count() -> usize {
    PROCESS_VMS.lock().count()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::PageFrame;
    use crate::mm::region::RegionMap;
    use crate::mm::test_support;
    use alloc::vec;
    use alloc::vec::Vec;

    const MEM: usize = 16 * 1024 * 1024;
    const FRAMES: usize = MEM / 4096;

    struct Fixture {
        alloc: FrameAllocator,
        table: ProcessVmTable,
        kernel_pml4: u64,
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
        Fixture {
            alloc,
            table: ProcessVmTable::new(),
            kernel_pml4,
            _arena: arena,
        }
    }

    #[test]
    fn test_create_and_resolve() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let pid = fx.table.create(fx.kernel_pml4, &mut fx.alloc).unwrap();
        assert_ne!(pid, INVALID_PROCESS_ID);
        assert!(fx.table.get_page_dir(pid).is_some());
        assert_eq!(fx.table.get_page_dir(pid + 100), None);
        assert_eq!(fx.table.count(), 1);
    }

    #[test]
    fn test_slot_reuse_after_destroy() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let baseline = fx.alloc.free_frame_count();

        let mut pids = Vec::new();
        for _ in 0..5 {
            pids.push(fx.table.create(fx.kernel_pml4, &mut fx.alloc).unwrap());
        }
        for pid in &pids[..3] {
            fx.table.destroy(*pid, &mut fx.alloc).unwrap();
        }
        let mut new_pids = Vec::new();
        for _ in 0..3 {
            new_pids.push(fx.table.create(fx.kernel_pml4, &mut fx.alloc).unwrap());
        }

        // All five survivors resolve; the destroyed three do not.
        for pid in pids[3..].iter().chain(new_pids.iter()) {
            assert!(fx.table.get_page_dir(*pid).is_some());
        }
        for pid in &pids[..3] {
            assert!(fx.table.get_page_dir(*pid).is_none());
        }
        assert_eq!(fx.table.count(), 5);

        for pid in pids[3..].iter().chain(new_pids.iter()) {
            fx.table.destroy(*pid, &mut fx.alloc).unwrap();
        }
        assert_eq!(fx.table.count(), 0);
        assert_eq!(
            fx.alloc.free_frame_count(),
            baseline,
            "destroying every VM must return the allocator to baseline"
        );
    }

    #[test]
    fn test_map_user_grants_access() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let pid = fx.table.create(fx.kernel_pml4, &mut fx.alloc).unwrap();
        let pml4 = fx.table.get_page_dir(pid).unwrap();

        fx.table
            .map_user(pid, 0x40_0000, 8192, PageFlags::WRITABLE, &mut fx.alloc)
            .unwrap();
        assert!(page_table::is_user_accessible(pml4, 0x40_0000));
        assert!(page_table::is_user_accessible(pml4, 0x40_1000));
        assert!(!page_table::is_user_accessible(pml4, 0x40_2000));
    }

    #[test]
    fn test_destroy_returns_mapped_frames() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        let baseline = fx.alloc.free_frame_count();
        let pid = fx.table.create(fx.kernel_pml4, &mut fx.alloc).unwrap();
        fx.table
            .map_user(pid, 0x7FFF_0000, 64 * 1024, PageFlags::WRITABLE, &mut fx.alloc)
            .unwrap();
        fx.table.destroy(pid, &mut fx.alloc).unwrap();
        assert_eq!(fx.alloc.free_frame_count(), baseline);
    }

    #[test]
    fn test_table_exhaustion() {
        let _env = test_support::lock_env();
        let mut fx = fixture();
        for _ in 0..MAX_PROCESSES {
            fx.table.create(fx.kernel_pml4, &mut fx.alloc).unwrap();
        }
        let err = fx.table.create(fx.kernel_pml4, &mut fx.alloc);
        assert!(matches!(
            err,
            Err(KernelError::ResourceExhausted { .. })
        ));
    }
}
