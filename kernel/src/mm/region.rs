//! Canonical physical memory map
//!
//! A sorted list of disjoint physical ranges, built by overlaying firmware
//! regions with kernel and device reservations. After overlay the map is
//! the single authority on what is allocatable: the buddy allocator seeds
//! itself from the usable entries and never touches anything else.
//!
//! Overlay semantics: an incoming range splits whatever it overlaps and
//! overwrites the overlapped slice with its own attributes. Adjacent
//! entries that end up equivalent are re-merged, so the union of entries
//! always equals the firmware-reported map after overlay and any address
//! is covered by at most one entry.

use bitflags::bitflags;
use spin::Mutex;

use super::{align_down, align_up, HIGHER_HALF_BASE, PAGE_SIZE};

/// Backing-array capacity. Running out is a fatal configuration error:
/// silently dropping a region would corrupt the allocatable map.
pub const MAX_REGIONS: usize = 128;

bitflags! {
    /// Attribute flags carried by every map entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Never handed to the page-frame allocator.
        const EXCLUDE_ALLOCATORS = 1 << 0;
        /// HHDM lookups of addresses inside this region are permitted.
        const ALLOW_PHYS_TO_VIRT = 1 << 1;
        /// Device MMIO window.
        const MMIO = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// What a reserved range actually is. Purely informational except for
/// reserved-byte accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTypeTag {
    FirmwareUsable,
    KernelImage,
    BootStack,
    PageTables,
    AcpiReclaim,
    AcpiNvs,
    Framebuffer,
    LapicMmio,
    AllocatorMetadata,
    DeviceMmio,
    Unknown,
}

/// One canonical map entry.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: u64,
    pub len: u64,
    pub kind: RegionKind,
    pub flags: RegionFlags,
    pub tag: RegionTypeTag,
    pub label: &'static str,
}

impl Region {
    const EMPTY: Region = Region {
        base: 0,
        len: 0,
        kind: RegionKind::Reserved,
        flags: RegionFlags::empty(),
        tag: RegionTypeTag::Unknown,
        label: "",
    };

    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Entries merge when everything but the extent matches.
    fn same_attributes(&self, other: &Region) -> bool {
        self.kind == other.kind && self.flags == other.flags && self.tag == other.tag
    }
}

/// The canonical map itself. A fixed array kept sorted by `base`.
pub struct RegionMap {
    entries: [Region; MAX_REGIONS],
    len: usize,
}

impl RegionMap {
    pub const fn new() -> Self {
        Self {
            entries: [Region::EMPTY; MAX_REGIONS],
            len: 0,
        }
    }

    /// Enroll a firmware-usable range.
    pub fn add_usable(&mut self, base: u64, len: u64, label: &'static str) {
        self.overlay(Region {
            base,
            len,
            kind: RegionKind::Usable,
            flags: RegionFlags::ALLOW_PHYS_TO_VIRT,
            tag: RegionTypeTag::FirmwareUsable,
            label,
        });
    }

    /// Reserve a range with the given attributes, splitting and overwriting
    /// anything it overlaps.
    pub fn reserve(
        &mut self,
        base: u64,
        len: u64,
        tag: RegionTypeTag,
        flags: RegionFlags,
        label: &'static str,
    ) {
        self.overlay(Region {
            base,
            len,
            kind: RegionKind::Reserved,
            flags,
            tag,
            label,
        });
    }

    fn overlay(&mut self, new: Region) {
        if new.base >= HIGHER_HALF_BASE {
            panic!(
                "region map: virtual address {:#x} in physical overlay ('{}')",
                new.base, new.label
            );
        }
        let start = align_down(new.base, PAGE_SIZE as u64);
        let end = align_up(new.base + new.len, PAGE_SIZE as u64);
        if end <= start {
            return;
        }

        let mut out = [Region::EMPTY; MAX_REGIONS];
        let mut n = 0;
        let mut push = |out: &mut [Region; MAX_REGIONS], n: &mut usize, r: Region| {
            if r.len == 0 {
                return;
            }
            if *n >= MAX_REGIONS {
                panic!("region map overflow ({} entries)", MAX_REGIONS);
            }
            out[*n] = r;
            *n += 1;
        };

        // Copy existing entries, trimming away the slice covered by the
        // overlay. Sortedness is preserved by inserting the new entry at
        // the point its base first fits.
        let mut inserted = false;
        for i in 0..self.len {
            let e = self.entries[i];
            if !inserted && e.base >= start {
                push(
                    &mut out,
                    &mut n,
                    Region {
                        base: start,
                        len: end - start,
                        ..new
                    },
                );
                inserted = true;
            }
            if e.end() <= start || e.base >= end {
                push(&mut out, &mut n, e);
                continue;
            }
            // Left remainder of a split
            if e.base < start {
                let mut left = e;
                left.len = start - e.base;
                push(&mut out, &mut n, left);
                if !inserted {
                    push(
                        &mut out,
                        &mut n,
                        Region {
                            base: start,
                            len: end - start,
                            ..new
                        },
                    );
                    inserted = true;
                }
            }
            // Right remainder of a split
            if e.end() > end {
                let mut right = e;
                right.base = end;
                right.len = e.end() - end;
                push(&mut out, &mut n, right);
            }
        }
        if !inserted {
            push(
                &mut out,
                &mut n,
                Region {
                    base: start,
                    len: end - start,
                    ..new
                },
            );
        }

        // Merge pass: adjacent entries with identical attributes collapse.
        let mut merged = [Region::EMPTY; MAX_REGIONS];
        let mut m = 0;
        for i in 0..n {
            let e = out[i];
            if m > 0 {
                let prev = &mut merged[m - 1];
                if prev.end() == e.base && prev.same_attributes(&e) {
                    prev.len += e.len;
                    continue;
                }
            }
            merged[m] = e;
            m += 1;
        }

        self.entries = merged;
        self.len = m;
    }

    pub fn count(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.entries[..self.len].get(index)
    }

    pub fn entries(&self) -> &[Region] {
        &self.entries[..self.len]
    }

    /// Entry containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&Region> {
        self.entries[..self.len].iter().find(|r| r.contains(addr))
    }

    /// Whether any part of `[base, base+len)` is reserved.
    pub fn range_overlaps_reserved(&self, base: u64, len: u64) -> bool {
        let end = base.saturating_add(len);
        self.entries[..self.len].iter().any(|r| {
            r.kind == RegionKind::Reserved && r.base < end && r.end() > base
        })
    }

    /// Total reserved bytes among entries carrying all of `required`.
    pub fn reserved_bytes(&self, required: RegionFlags) -> u64 {
        self.entries[..self.len]
            .iter()
            .filter(|r| r.kind == RegionKind::Reserved && r.flags.contains(required))
            .map(|r| r.len)
            .sum()
    }

    /// Highest frame number covered by any usable entry.
    pub fn highest_usable_frame(&self) -> Option<u64> {
        self.entries[..self.len]
            .iter()
            .filter(|r| r.kind == RegionKind::Usable)
            .map(|r| (r.end() / PAGE_SIZE as u64) - 1)
            .max()
    }

    /// Usable entries the allocator may seed from.
    pub fn allocatable(&self) -> impl Iterator<Item = (usize, &Region)> {
        self.entries[..self.len]
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.kind == RegionKind::Usable && !r.flags.contains(RegionFlags::EXCLUDE_ALLOCATORS)
            })
    }

    /// Consistency check: sorted, disjoint, merged. Used by tests and the
    /// memory-phase sanity step.
    pub fn check_invariants(&self) -> bool {
        for i in 1..self.len {
            let a = &self.entries[i - 1];
            let b = &self.entries[i];
            if b.base < a.end() {
                return false;
            }
            if a.end() == b.base && a.same_attributes(b) {
                return false;
            }
        }
        true
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Global canonical map instance.
pub static REGION_MAP: Mutex<RegionMap> = Mutex::new(RegionMap::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const K: u64 = 1024;
    const M: u64 = 1024 * 1024;

    #[test]
    fn test_add_usable_merges_adjacent() {
        let mut map = RegionMap::new();
        map.add_usable(0, M, "low");
        map.add_usable(M, M, "high");
        assert_eq!(map.count(), 1, "equivalent adjacent regions must merge");
        assert_eq!(map.get(0).unwrap().len, 2 * M);
        assert!(map.check_invariants());
    }

    #[test]
    fn test_reserve_splits_usable() {
        let mut map = RegionMap::new();
        map.add_usable(0, 4 * M, "ram");
        map.reserve(M, M, RegionTypeTag::KernelImage, RegionFlags::empty(), "kernel");
        assert_eq!(map.count(), 3);
        let first = map.get(0).unwrap();
        let mid = map.get(1).unwrap();
        let last = map.get(2).unwrap();
        assert_eq!((first.base, first.len, first.kind), (0, M, RegionKind::Usable));
        assert_eq!((mid.base, mid.len, mid.kind), (M, M, RegionKind::Reserved));
        assert_eq!((last.base, last.len, last.kind), (2 * M, 2 * M, RegionKind::Usable));
        assert!(map.check_invariants());
    }

    #[test]
    fn test_overlay_overwrites_overlap() {
        let mut map = RegionMap::new();
        map.add_usable(0, 2 * M, "ram");
        map.reserve(0, 2 * M, RegionTypeTag::Unknown, RegionFlags::empty(), "all");
        // Re-enrolling the middle as usable must punch through the reservation
        map.add_usable(M, 512 * K, "window");
        assert_eq!(map.count(), 3);
        assert_eq!(map.get(1).unwrap().kind, RegionKind::Usable);
        assert_eq!(map.get(1).unwrap().base, M);
        assert!(map.check_invariants());
    }

    #[test]
    fn test_normalization_to_page_granularity() {
        let mut map = RegionMap::new();
        map.add_usable(0x1234, 0x100, "tiny");
        let r = map.get(0).unwrap();
        assert_eq!(r.base, 0x1000);
        assert_eq!(r.len, 0x1000);
    }

    #[test]
    fn test_point_and_range_queries() {
        let mut map = RegionMap::new();
        map.add_usable(0, 4 * M, "ram");
        map.reserve(M, M, RegionTypeTag::Framebuffer, RegionFlags::MMIO, "fb");
        assert_eq!(map.find(M + 4096).unwrap().tag, RegionTypeTag::Framebuffer);
        assert!(map.range_overlaps_reserved(M - 4096, 8192));
        assert!(!map.range_overlaps_reserved(0, M));
        assert_eq!(map.reserved_bytes(RegionFlags::MMIO), M);
        assert_eq!(map.reserved_bytes(RegionFlags::EXCLUDE_ALLOCATORS), 0);
        assert_eq!(map.highest_usable_frame(), Some(4 * M / 4096 - 1));
    }

    #[test]
    fn test_union_is_preserved() {
        let mut map = RegionMap::new();
        map.add_usable(0, 8 * M, "ram");
        map.reserve(M, 2 * M, RegionTypeTag::KernelImage, RegionFlags::empty(), "a");
        map.reserve(2 * M, 2 * M, RegionTypeTag::AcpiNvs, RegionFlags::empty(), "b");
        map.add_usable(3 * M, M, "back");
        let total: u64 = map.entries().iter().map(|r| r.len).sum();
        assert_eq!(total, 8 * M, "overlay must never lose coverage");
        assert!(map.check_invariants());
    }

    #[test]
    #[should_panic(expected = "virtual address")]
    fn test_virtual_address_refused() {
        let mut map = RegionMap::new();
        map.add_usable(HIGHER_HALF_BASE, M, "bogus");
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_overflow_is_fatal() {
        let mut map = RegionMap::new();
        // Alternating kinds prevent merging; each iteration adds one entry.
        for i in 0..(MAX_REGIONS as u64 + 1) {
            let base = i * 2 * M;
            if i % 2 == 0 {
                map.add_usable(base, M, "u");
            } else {
                map.reserve(base, M, RegionTypeTag::Unknown, RegionFlags::empty(), "r");
            }
        }
    }

    #[test]
    fn test_allocatable_excludes_flagged() {
        let mut map = RegionMap::new();
        map.add_usable(0, M, "ram");
        map.reserve(
            2 * M,
            M,
            RegionTypeTag::AllocatorMetadata,
            RegionFlags::EXCLUDE_ALLOCATORS,
            "meta",
        );
        let count = map.allocatable().count();
        assert_eq!(count, 1);
    }
}
