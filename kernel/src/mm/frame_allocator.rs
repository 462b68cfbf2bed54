//! Physical page-frame allocator
//!
//! Power-of-two buddy allocator seeded from the canonical region map. One
//! [`PageFrame`] descriptor tracks every 4 KiB frame; free blocks are
//! chained through descriptor indices (`next_free`) with
//! [`INVALID_PAGE_FRAME`] terminating each per-order list, so no pointers
//! are shared across the lists.
//!
//! Every frame carries the id of the region that seeded it and blocks are
//! never coalesced across region ids, so a reservation boundary can never
//! be papered over by a merge.

use bitflags::bitflags;
use log::{debug, warn};
use spin::Mutex;

use super::region::RegionMap;
use super::PAGE_SIZE;

/// Sentinel terminating every free list.
pub const INVALID_PAGE_FRAME: u32 = u32::MAX;

/// Hard cap on the buddy order (order 10 = 4 MiB blocks).
pub const MAX_ORDER_LIMIT: usize = 10;

/// ISA-style DMA ceiling: DMA allocations must end below 16 MiB.
pub const DMA_LIMIT: u64 = 16 * 1024 * 1024;

/// `order` value on descriptors that do not head a block.
const ORDER_NONE: u8 = 0xFF;

/// `region_id` for frames outside every seeded region.
const REGION_NONE: u16 = u16::MAX;

bitflags! {
    /// Allocation request flags. Bits 8..12 optionally carry a minimum
    /// order override.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero every page of the block through its HHDM alias.
        const ZERO = 1 << 0;
        /// Block must lie entirely below [`DMA_LIMIT`].
        const DMA = 1 << 1;
        /// Mark the frames as kernel-owned rather than plain allocated.
        const KERNEL = 1 << 2;

        const _ = !0;
    }
}

const ORDER_OVERRIDE_SHIFT: u32 = 8;
const ORDER_OVERRIDE_MASK: u32 = 0xF << ORDER_OVERRIDE_SHIFT;

impl AllocFlags {
    /// Encode a minimum-order override into the request.
    pub fn with_min_order(self, order: u8) -> Self {
        let bits = (self.bits() & !ORDER_OVERRIDE_MASK)
            | (((order as u32) << ORDER_OVERRIDE_SHIFT) & ORDER_OVERRIDE_MASK);
        Self::from_bits_retain(bits)
    }

    fn min_order(self) -> Option<u8> {
        let raw = ((self.bits() & ORDER_OVERRIDE_MASK) >> ORDER_OVERRIDE_SHIFT) as u8;
        if raw == 0 {
            None
        } else {
            Some(raw)
        }
    }
}

/// Lifecycle state of a tracked frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Free = 0,
    Allocated = 1,
    Reserved = 2,
    Kernel = 3,
    Dma = 4,
}

/// Descriptor for one 4 KiB physical frame.
///
/// `order` is meaningful only on the frame heading a buddy block;
/// `next_free` only while that head sits on a free list.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageFrame {
    pub ref_count: u16,
    pub state: FrameState,
    pub flags: u8,
    pub order: u8,
    pub region_id: u16,
    pub next_free: u32,
}

impl PageFrame {
    const UNTRACKED: PageFrame = PageFrame {
        ref_count: 0,
        state: FrameState::Reserved,
        flags: 0,
        order: ORDER_NONE,
        region_id: REGION_NONE,
        next_free: INVALID_PAGE_FRAME,
    };
}

/// The buddy allocator proper. Descriptor storage is handed in at init
/// time (carved out of reserved physical memory on bare metal, an arena in
/// tests), so the struct itself stays `const`-constructible.
pub struct FrameAllocator {
    frames: *mut PageFrame,
    frame_count: usize,
    free_lists: [u32; MAX_ORDER_LIMIT + 1],
    max_order: u8,
    total_usable: u64,
    free_frames: u64,
    hhdm_offset: u64,
    initialized: bool,
    alloc_count: u64,
    free_count: u64,
}

// SAFETY: the descriptor pointer is only dereferenced under the global
// lock; the kernel runs a single hardware thread.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            frames: core::ptr::null_mut(),
            frame_count: 0,
            free_lists: [INVALID_PAGE_FRAME; MAX_ORDER_LIMIT + 1],
            max_order: 0,
            total_usable: 0,
            free_frames: 0,
            hhdm_offset: 0,
            initialized: false,
            alloc_count: 0,
            free_count: 0,
        }
    }

    /// Bytes of descriptor storage needed to track `frame_count` frames.
    pub const fn metadata_bytes(frame_count: usize) -> usize {
        frame_count * core::mem::size_of::<PageFrame>()
    }

    /// Seed the allocator from the canonical map.
    ///
    /// Walks every allocatable region, greedily forming the largest
    /// aligned power-of-two block that fits and tagging each constituent
    /// frame with the region id.
    ///
    /// # Safety
    ///
    /// `frames` must point to `frame_count` writable descriptors that the
    /// allocator owns exclusively from here on. `hhdm_offset` must alias
    /// all seeded physical memory (or be 0 to disable zeroing).
    pub unsafe fn init(
        &mut self,
        frames: *mut PageFrame,
        frame_count: usize,
        map: &RegionMap,
        hhdm_offset: u64,
    ) {
        self.frames = frames;
        self.frame_count = frame_count;
        self.hhdm_offset = hhdm_offset;
        self.free_lists = [INVALID_PAGE_FRAME; MAX_ORDER_LIMIT + 1];
        self.total_usable = 0;
        self.free_frames = 0;

        let mut order = 0;
        while order < MAX_ORDER_LIMIT && (1usize << (order + 1)) <= frame_count {
            order += 1;
        }
        self.max_order = order as u8;

        for i in 0..frame_count {
            // SAFETY: i < frame_count, within the arena the caller handed us.
            unsafe { self.frames.add(i).write(PageFrame::UNTRACKED) };
        }

        for (region_id, region) in map.allocatable() {
            let first = (region.base / PAGE_SIZE as u64) as usize;
            let count = (region.len / PAGE_SIZE as u64) as usize;
            if first >= frame_count {
                continue;
            }
            let count = count.min(frame_count - first);
            for i in first..first + count {
                let f = self.frame_mut(i as u32);
                f.state = FrameState::Free;
                f.region_id = region_id as u16;
                f.order = ORDER_NONE;
            }
            // Greedy aligned power-of-two carving
            let mut cur = first;
            let mut remaining = count;
            while remaining > 0 {
                let align = cur.trailing_zeros().min(31) as usize;
                let mut blk = self.max_order as usize;
                while blk > 0 && ((1usize << blk) > remaining || blk > align) {
                    blk -= 1;
                }
                self.push_free(cur as u32, blk as u8);
                cur += 1 << blk;
                remaining -= 1 << blk;
            }
            self.total_usable += count as u64;
            self.free_frames += count as u64;
        }

        self.initialized = true;
        debug!(
            "frame allocator: {} frames tracked, {} usable, max order {}",
            frame_count, self.total_usable, self.max_order
        );
    }

    fn frame_mut(&mut self, idx: u32) -> &mut PageFrame {
        debug_assert!((idx as usize) < self.frame_count);
        // SAFETY: idx bounds-checked above; exclusive access via &mut self.
        unsafe { &mut *self.frames.add(idx as usize) }
    }

    fn frame(&self, idx: u32) -> &PageFrame {
        debug_assert!((idx as usize) < self.frame_count);
        // SAFETY: idx bounds-checked above.
        unsafe { &*self.frames.add(idx as usize) }
    }

    fn push_free(&mut self, idx: u32, order: u8) {
        let head = self.free_lists[order as usize];
        let f = self.frame_mut(idx);
        f.state = FrameState::Free;
        f.order = order;
        f.ref_count = 0;
        f.next_free = head;
        self.free_lists[order as usize] = idx;
    }

    /// Unlink `idx` from the given order's list. Panics if absent: a free
    /// head missing from its list means the lists are corrupt.
    fn detach_free(&mut self, idx: u32, order: u8) {
        let mut cur = self.free_lists[order as usize];
        if cur == idx {
            self.free_lists[order as usize] = self.frame(idx).next_free;
            self.frame_mut(idx).next_free = INVALID_PAGE_FRAME;
            return;
        }
        while cur != INVALID_PAGE_FRAME {
            let next = self.frame(cur).next_free;
            if next == idx {
                let after = self.frame(idx).next_free;
                self.frame_mut(cur).next_free = after;
                self.frame_mut(idx).next_free = INVALID_PAGE_FRAME;
                return;
            }
            cur = next;
        }
        panic!("frame allocator: free list {} missing frame {}", order, idx);
    }

    /// First block on `order`'s list satisfying the DMA ceiling (if asked).
    fn find_fit(&self, order: u8, dma: bool) -> Option<u32> {
        let mut cur = self.free_lists[order as usize];
        while cur != INVALID_PAGE_FRAME {
            if !dma {
                return Some(cur);
            }
            let end = (cur as u64 + (1u64 << order)) * PAGE_SIZE as u64;
            if end <= DMA_LIMIT {
                return Some(cur);
            }
            cur = self.frame(cur).next_free;
        }
        None
    }

    /// Allocate `count` contiguous frames. Returns the physical base
    /// address, or 0 when no suitable block exists.
    pub fn alloc_page_frames(&mut self, count: usize, flags: AllocFlags) -> u64 {
        if !self.initialized || count == 0 {
            return 0;
        }
        let mut order = 0u8;
        while (1usize << order) < count && (order as usize) < self.max_order as usize {
            order += 1;
        }
        if let Some(min) = flags.min_order() {
            order = order.max(min.min(self.max_order));
        }
        let dma = flags.contains(AllocFlags::DMA);

        let mut found = None;
        for o in order..=self.max_order {
            if let Some(idx) = self.find_fit(o, dma) {
                found = Some((idx, o));
                break;
            }
        }
        let (idx, mut have) = match found {
            Some(hit) => hit,
            None => return 0,
        };

        self.detach_free(idx, have);
        // Split down, pushing the unused upper buddy each time.
        while have > order {
            have -= 1;
            let buddy = idx + (1u32 << have);
            self.push_free(buddy, have);
        }

        let state = if dma {
            FrameState::Dma
        } else if flags.contains(AllocFlags::KERNEL) {
            FrameState::Kernel
        } else {
            FrameState::Allocated
        };
        let block = 1u32 << order;
        for i in 0..block {
            let f = self.frame_mut(idx + i);
            f.state = state;
            f.order = ORDER_NONE;
            f.ref_count = 0;
            f.next_free = INVALID_PAGE_FRAME;
        }
        {
            let head = self.frame_mut(idx);
            head.order = order;
            head.ref_count = 1;
        }
        self.free_frames -= block as u64;
        self.alloc_count += 1;

        let phys = idx as u64 * PAGE_SIZE as u64;
        if flags.contains(AllocFlags::ZERO) {
            if self.hhdm_offset == 0 {
                warn!("frame allocator: cannot zero {:#x} without HHDM", phys);
                self.free_page_frame(phys);
                return 0;
            }
            for i in 0..block as u64 {
                let va = self.hhdm_offset + phys + i * PAGE_SIZE as u64;
                // SAFETY: the block was just allocated and the HHDM aliases
                // all of tracked physical memory.
                unsafe { core::ptr::write_bytes(va as *mut u8, 0, PAGE_SIZE) };
            }
        }
        phys
    }

    /// Single-frame convenience wrapper.
    pub fn alloc_page_frame(&mut self, flags: AllocFlags) -> u64 {
        self.alloc_page_frames(1, flags)
    }

    /// Free the block headed at `phys`.
    ///
    /// Unallocated, untracked and already-free frames are tolerated
    /// silently; the heap layer above is responsible for loud double-free
    /// detection.
    pub fn free_page_frame(&mut self, phys: u64) {
        if !self.initialized || phys % PAGE_SIZE as u64 != 0 {
            return;
        }
        let idx = (phys / PAGE_SIZE as u64) as usize;
        if idx >= self.frame_count {
            return;
        }
        let idx = idx as u32;
        {
            let f = self.frame(idx);
            match f.state {
                FrameState::Free | FrameState::Reserved => return,
                _ => {}
            }
            if f.ref_count == 0 || f.order == ORDER_NONE {
                return;
            }
        }
        {
            let f = self.frame_mut(idx);
            f.ref_count -= 1;
            if f.ref_count > 0 {
                return;
            }
        }

        let order = self.frame(idx).order;
        let region = self.frame(idx).region_id;
        let block = 1u32 << order;
        for i in 0..block {
            let f = self.frame_mut(idx + i);
            f.state = FrameState::Free;
            f.order = ORDER_NONE;
        }

        // Coalesce upward; stop at the first buddy that is not a free head
        // of the same order in the same region.
        let mut cur = idx;
        let mut o = order;
        while (o as usize) < self.max_order as usize {
            let buddy = cur ^ (1u32 << o);
            if buddy as usize + (1usize << o) > self.frame_count {
                break;
            }
            let b = self.frame(buddy);
            if b.state != FrameState::Free || b.order != o || b.region_id != region {
                break;
            }
            self.detach_free(buddy, o);
            self.frame_mut(buddy).order = ORDER_NONE;
            cur = cur.min(buddy);
            o += 1;
        }
        self.push_free(cur, o);
        self.free_frames += block as u64;
        self.free_count += 1;
    }

    /// Bump the reference count of an allocated block head (shared frame).
    pub fn retain_page_frame(&mut self, phys: u64) {
        let idx = (phys / PAGE_SIZE as u64) as usize;
        if !self.initialized || idx >= self.frame_count {
            return;
        }
        let f = self.frame_mut(idx as u32);
        if f.ref_count > 0 {
            f.ref_count += 1;
        }
    }

    pub fn frame_state(&self, phys: u64) -> Option<FrameState> {
        let idx = (phys / PAGE_SIZE as u64) as usize;
        if !self.initialized || idx >= self.frame_count {
            return None;
        }
        Some(self.frame(idx as u32).state)
    }

    pub fn free_frame_count(&self) -> u64 {
        self.free_frames
    }

    pub fn total_usable_frames(&self) -> u64 {
        self.total_usable
    }

    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    /// Length of one order's free list. Introspection for tests and the
    /// memory-phase sanity report.
    pub fn free_list_len(&self, order: u8) -> usize {
        let mut n = 0;
        let mut cur = self.free_lists[order as usize];
        while cur != INVALID_PAGE_FRAME {
            n += 1;
            cur = self.frame(cur).next_free;
        }
        n
    }

    /// Per-order free-list lengths, for shape comparisons.
    pub fn free_list_shape(&self) -> [usize; MAX_ORDER_LIMIT + 1] {
        let mut shape = [0; MAX_ORDER_LIMIT + 1];
        for (o, slot) in shape.iter_mut().enumerate() {
            *slot = self.free_list_len(o as u8);
        }
        shape
    }

    /// Free-list consistency: every chained node is a free head of the
    /// matching order, and the length-weighted sum equals `free_frames`.
    pub fn check_invariants(&self) -> bool {
        let mut counted = 0u64;
        for o in 0..=self.max_order {
            let mut cur = self.free_lists[o as usize];
            while cur != INVALID_PAGE_FRAME {
                let f = self.frame(cur);
                if f.state != FrameState::Free || f.order != o {
                    return false;
                }
                counted += 1u64 << o;
                cur = f.next_free;
            }
        }
        counted == self.free_frames
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global page-frame allocator instance.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::region::{RegionFlags, RegionMap, RegionTypeTag};
    use alloc::vec;
    use alloc::vec::Vec;

    const M: u64 = 1024 * 1024;

    struct Fixture {
        alloc: FrameAllocator,
        _arena: Vec<PageFrame>,
    }

    fn fixture(map: &RegionMap, frame_count: usize, hhdm: u64) -> Fixture {
        let mut arena = vec![PageFrame::UNTRACKED; frame_count];
        let mut alloc = FrameAllocator::new();
        // SAFETY: arena outlives the allocator inside the fixture.
        unsafe { alloc.init(arena.as_mut_ptr(), frame_count, map, hhdm) };
        Fixture {
            alloc,
            _arena: arena,
        }
    }

    fn simple_map(bytes: u64) -> RegionMap {
        let mut map = RegionMap::new();
        map.add_usable(0, bytes, "test ram");
        map
    }

    #[test]
    fn test_seeding_shape() {
        let map = simple_map(4 * M); // 1024 frames
        let fx = fixture(&map, 1024, 0);
        assert_eq!(fx.alloc.free_frame_count(), 1024);
        assert_eq!(fx.alloc.max_order(), 10);
        // 1024 aligned frames seed exactly one order-10 block
        assert_eq!(fx.alloc.free_list_len(10), 1);
        assert!(fx.alloc.check_invariants());
    }

    #[test]
    fn test_alloc_free_restores_shape() {
        let map = simple_map(4 * M);
        let mut fx = fixture(&map, 1024, 0);
        let before = fx.alloc.free_list_shape();

        let phys = fx.alloc.alloc_page_frames(1, AllocFlags::empty());
        assert_ne!(phys, 0);
        fx.alloc.free_page_frame(phys);

        assert_eq!(
            fx.alloc.free_list_shape(),
            before,
            "single alloc/free must restore the exact per-order shape"
        );
        assert!(fx.alloc.check_invariants());
    }

    #[test]
    fn test_order3_block_round_trip() {
        let map = simple_map(4 * M);
        let mut fx = fixture(&map, 1024, 0);
        let phys = fx.alloc.alloc_page_frames(8, AllocFlags::empty());
        assert_ne!(phys, 0);
        assert_eq!(phys % (8 * 4096), 0, "order-3 block must be order-aligned");
        assert_eq!(fx.alloc.free_frame_count(), 1024 - 8);

        fx.alloc.free_page_frame(phys);
        assert_eq!(fx.alloc.free_frame_count(), 1024);
        // Fully coalesced again: one order-10 block, nothing at order 3
        assert_eq!(fx.alloc.free_list_len(3), 0);
        assert_eq!(fx.alloc.free_list_len(10), 1);
    }

    #[test]
    fn test_zero_count_fails() {
        let map = simple_map(M);
        let mut fx = fixture(&map, 256, 0);
        assert_eq!(fx.alloc.alloc_page_frames(0, AllocFlags::empty()), 0);
    }

    #[test]
    fn test_oversized_request_clamps_at_max_order() {
        let map = simple_map(4 * M);
        let mut fx = fixture(&map, 1024, 0);
        // 2048 frames exceeds the order-10 cap; the request clamps.
        let phys = fx.alloc.alloc_page_frames(2048, AllocFlags::empty());
        assert_ne!(phys, 0);
        assert_eq!(fx.alloc.free_frame_count(), 0);
    }

    #[test]
    fn test_double_free_is_noop() {
        let map = simple_map(M);
        let mut fx = fixture(&map, 256, 0);
        let phys = fx.alloc.alloc_page_frames(4, AllocFlags::empty());
        fx.alloc.free_page_frame(phys);
        let after_first = fx.alloc.free_frame_count();
        fx.alloc.free_page_frame(phys);
        assert_eq!(fx.alloc.free_frame_count(), after_first);
        assert!(fx.alloc.check_invariants());
    }

    #[test]
    fn test_untracked_frame_free_is_noop() {
        let map = simple_map(M);
        let mut fx = fixture(&map, 256, 0);
        let before = fx.alloc.free_frame_count();
        fx.alloc.free_page_frame(64 * M);
        fx.alloc.free_page_frame(3); // unaligned
        assert_eq!(fx.alloc.free_frame_count(), before);
    }

    #[test]
    fn test_refcounted_free() {
        let map = simple_map(M);
        let mut fx = fixture(&map, 256, 0);
        let phys = fx.alloc.alloc_page_frame(AllocFlags::empty());
        fx.alloc.retain_page_frame(phys);
        fx.alloc.free_page_frame(phys);
        assert_eq!(
            fx.alloc.frame_state(phys),
            Some(FrameState::Allocated),
            "shared frame must survive the first free"
        );
        fx.alloc.free_page_frame(phys);
        assert_eq!(fx.alloc.frame_state(phys), Some(FrameState::Free));
    }

    #[test]
    fn test_no_cross_region_coalescing() {
        // Two usable regions split by a reservation boundary that the
        // overlay then re-opens: region ids differ, so the halves must
        // never merge even though the frames are buddies.
        let mut map = RegionMap::new();
        map.add_usable(0, M, "low");
        map.reserve(
            M,
            M,
            RegionTypeTag::KernelImage,
            RegionFlags::empty(),
            "split",
        );
        map.add_usable(2 * M, M, "high");

        let fx = fixture(&map, 768, 0);
        // 256 frames per usable region; each seeds its own order-8 block.
        assert_eq!(fx.alloc.free_list_len(8), 2);
        assert_eq!(fx.alloc.free_frame_count(), 512);
        assert!(fx.alloc.check_invariants());
    }

    #[test]
    fn test_dma_constraint() {
        let mut map = RegionMap::new();
        map.add_usable(0, 32 * M, "ram");
        let frame_count = (32 * M / 4096) as usize;
        let mut fx = fixture(&map, frame_count, 0);

        let phys = fx.alloc.alloc_page_frames(4, AllocFlags::DMA);
        assert_ne!(phys, 0);
        assert!(
            phys + 4 * 4096 <= DMA_LIMIT,
            "DMA block must end below the DMA limit, got {:#x}",
            phys
        );
        assert_eq!(fx.alloc.frame_state(phys), Some(FrameState::Dma));
    }

    #[test]
    fn test_kernel_state_tagging() {
        let map = simple_map(M);
        let mut fx = fixture(&map, 256, 0);
        let phys = fx.alloc.alloc_page_frame(AllocFlags::KERNEL);
        assert_eq!(fx.alloc.frame_state(phys), Some(FrameState::Kernel));
    }

    #[test]
    fn test_order_override_takes_larger() {
        let map = simple_map(4 * M);
        let mut fx = fixture(&map, 1024, 0);
        let flags = AllocFlags::empty().with_min_order(4);
        let phys = fx.alloc.alloc_page_frames(1, flags);
        assert_ne!(phys, 0);
        // An order-4 block (16 frames) must have been carved out.
        assert_eq!(fx.alloc.free_frame_count(), 1024 - 16);
        fx.alloc.free_page_frame(phys);
        assert_eq!(fx.alloc.free_frame_count(), 1024);
    }

    #[test]
    fn test_zeroing_through_hhdm() {
        // Stand a real buffer in for physical memory and point the HHDM
        // offset at it.
        let mem = vec![0xAAu8; M as usize];
        let hhdm = mem.as_ptr() as u64;
        let map = simple_map(M);
        let mut fx = fixture(&map, 256, hhdm);

        let phys = fx.alloc.alloc_page_frame(AllocFlags::ZERO);
        assert_ne!(phys, 0);
        let page = &mem[phys as usize..phys as usize + 4096];
        assert!(page.iter().all(|&b| b == 0), "ZERO flag must clear the page");
    }

    #[test]
    fn test_split_then_partial_coalesce() {
        let map = simple_map(4 * M);
        let mut fx = fixture(&map, 1024, 0);
        let a = fx.alloc.alloc_page_frame(AllocFlags::empty());
        let b = fx.alloc.alloc_page_frame(AllocFlags::empty());
        assert_ne!(a, b);
        fx.alloc.free_page_frame(a);
        // b still allocated: its buddy chain is pinned, full coalesce
        // impossible.
        assert_ne!(fx.alloc.free_list_len(10), 1);
        fx.alloc.free_page_frame(b);
        assert_eq!(fx.alloc.free_list_len(10), 1);
        assert!(fx.alloc.check_invariants());
    }
}
