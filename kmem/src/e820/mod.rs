//! The firmware physical memory map, from raw records to the kernel's canonical table.
//!
//! The flow at boot is: [`reader`] collects raw records, [`sanitize`] resolves overlaps and
//! [`copy`] installs the result (or a map synthesized from the legacy size hints).

use arrayvec::ArrayVec;
use bare_metal::{PhysAddr, PhysAddrRange};
use thiserror::Error;

use core::fmt;

use crate::physical::{PageFrame, PageFrameRegion};

pub mod copy;
pub mod reader;
pub mod sanitize;

/// Capacity of the canonical memory map.
pub const E820MAX: usize = 32;

/// Capacity of the raw list as reported by firmware, before sanitizing.
pub const E820_RAW_MAX: usize = 128;

const_assert!(E820MAX <= E820_RAW_MAX);

/// Usable conventional memory the fallback map assumes, `[0, 0x9F000)`.
pub const LOWMEMSIZE: u64 = 0x9F000;

/// Start of the legacy video/ROM hole.
pub const ISA_HOLE_START: u64 = 0xA0000;

/// Start of extended memory, 1 MiB. Also the end of the legacy hole.
pub const HIGH_MEMORY: u64 = 0x10_0000;

/// Classification of a memory map entry.
///
/// When regions overlap the kind with the larger type code wins, so `Reserved` beats `Usable`
/// and the ACPI kinds beat both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    /// Any type code this kernel does not know. Never usable.
    Other(u32),
}

impl RegionKind {
    pub fn from_code(code: u32) -> RegionKind {
        match code {
            1 => RegionKind::Usable,
            2 => RegionKind::Reserved,
            3 => RegionKind::AcpiReclaimable,
            4 => RegionKind::AcpiNvs,
            other => RegionKind::Other(other),
        }
    }

    /// The firmware type code, which doubles as overlap precedence.
    pub fn code(self) -> u32 {
        match self {
            RegionKind::Usable => 1,
            RegionKind::Reserved => 2,
            RegionKind::AcpiReclaimable => 3,
            RegionKind::AcpiNvs => 4,
            RegionKind::Other(code) => code,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegionKind::Usable => write!(f, "usable"),
            RegionKind::Reserved => write!(f, "reserved"),
            RegionKind::AcpiReclaimable => write!(f, "ACPI data"),
            RegionKind::AcpiNvs => write!(f, "ACPI NVS"),
            RegionKind::Other(code) => write!(f, "type {}", code),
        }
    }
}

/// One entry of a memory map. `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(start: u64, length: u64, kind: RegionKind) -> MemoryRegion {
        MemoryRegion { start, length, kind }
    }

    /// The exclusive end, or `None` when the region wraps the 64 bit address space.
    pub fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.length)
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn is_usable(&self) -> bool {
        self.kind == RegionKind::Usable
    }

    pub fn range(&self) -> PhysAddrRange {
        PhysAddrRange::new(PhysAddr(self.start), self.length)
    }

    /// The whole page frames inside this region.
    pub fn frames(&self) -> PageFrameRegion {
        PageFrameRegion::new_included_in(&self.range())
    }
}

/// Raw records as read from firmware. May overlap, be unordered or contain empty entries.
pub type RawMap = ArrayVec<MemoryRegion, E820_RAW_MAX>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("too many entries in the memory map")]
pub struct TableFull;

/// The kernel's canonical memory map.
///
/// Once installed from a sanitized list, entries are sorted, pairwise disjoint and non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    entries: ArrayVec<MemoryRegion, E820MAX>,
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap { entries: ArrayVec::new() }
    }

    /// Append an entry. The map keeps the order of insertion.
    pub fn add_region(&mut self, start: u64, length: u64, kind: RegionKind) -> Result<(), TableFull> {
        self.entries
            .try_push(MemoryRegion::new(start, length, kind))
            .map_err(|_| {
                error!("[e820] Ooops! Too many entries in the memory map!");
                TableFull
            })
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whole page frames of all usable entries, in map order.
    pub fn usable_frames<'a>(&'a self) -> impl Iterator<Item = PageFrameRegion> + 'a {
        self.entries
            .iter()
            .filter(|region| region.is_usable())
            .map(MemoryRegion::frames)
            .filter(|frames| !frames.is_empty())
    }

    /// Whether the frame lies entirely inside a usable entry.
    pub fn is_ram(&self, frame: PageFrame) -> bool {
        self.usable_frames().any(|frames| frames.contains(frame))
    }

    /// Clip usable memory so that nothing at or above `limit` remains usable.
    ///
    /// Usable entries straddling the limit are shortened and those entirely above are dropped.
    /// Other kinds stay untouched, so reserved firmware areas remain visible.
    pub fn limit_regions(&mut self, limit: u64) {
        self.entries.retain(|region| !(region.is_usable() && region.start >= limit));
        for region in self.entries.iter_mut().filter(|region| region.is_usable()) {
            if region.end() > limit {
                region.length = limit - region.start;
            }
        }
        info!("[e820] user-defined physical RAM limit {:#x}", limit);
    }

    /// Log every entry under the given source label.
    pub fn print(&self, who: &str) {
        for region in self.entries.iter() {
            info!(" {}: {:016x} - {:016x} ({})", who, region.start, region.end(), region.kind);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_map_to_codes() {
        for code in 0..8 {
            assert_eq!(RegionKind::from_code(code).code(), code);
        }
        assert_eq!(RegionKind::from_code(1), RegionKind::Usable);
        assert_eq!(RegionKind::from_code(7), RegionKind::Other(7));
        assert!(RegionKind::AcpiNvs.code() > RegionKind::Reserved.code());
    }

    #[test]
    fn kind_names() {
        use std::string::ToString;
        assert_eq!(RegionKind::Usable.to_string(), "usable");
        assert_eq!(RegionKind::Reserved.to_string(), "reserved");
        assert_eq!(RegionKind::AcpiReclaimable.to_string(), "ACPI data");
        assert_eq!(RegionKind::AcpiNvs.to_string(), "ACPI NVS");
        assert_eq!(RegionKind::Other(12).to_string(), "type 12");
    }

    #[test]
    fn table_holds_32_entries() {
        let mut map = MemoryMap::new();
        for i in 0..E820MAX as u64 {
            assert_eq!(map.add_region(i * 0x2000, 0x1000, RegionKind::Usable), Ok(()));
        }
        assert_eq!(map.add_region(0x100_0000, 0x1000, RegionKind::Usable), Err(TableFull));
        assert_eq!(map.len(), E820MAX);
    }

    #[test]
    fn usable_frames_skip_partial_pages() {
        let mut map = MemoryMap::new();
        map.add_region(0x0, 0x9F000, RegionKind::Usable).unwrap();
        map.add_region(0x9F000, 0x1000, RegionKind::Reserved).unwrap();
        map.add_region(0x10_0800, 0x800, RegionKind::Usable).unwrap();
        map.add_region(0x20_0000, 0x10_0000, RegionKind::Usable).unwrap();

        let frames: std::vec::Vec<_> = map.usable_frames().collect();
        assert_eq!(frames, vec![
            PageFrameRegion::new(PageFrame(0), PageFrame(0x9F)),
            PageFrameRegion::new(PageFrame(0x200), PageFrame(0x300)),
        ]);
        assert!(map.is_ram(PageFrame(0x9E)));
        assert!(!map.is_ram(PageFrame(0x9F)));
        assert!(!map.is_ram(PageFrame(0x100)));
    }

    #[test]
    fn limit_clips_usable_only() {
        let mut map = MemoryMap::new();
        map.add_region(0x0, 0x9F000, RegionKind::Usable).unwrap();
        map.add_region(0x10_0000, 0x7F0_0000, RegionKind::Usable).unwrap();
        map.add_region(0x800_0000, 0x10_0000, RegionKind::Usable).unwrap();
        map.add_region(0xFEC0_0000, 0x1000, RegionKind::Reserved).unwrap();

        map.limit_regions(0x400_0000);
        assert_eq!(map.regions(), &[
            MemoryRegion::new(0x0, 0x9F000, RegionKind::Usable),
            MemoryRegion::new(0x10_0000, 0x3F0_0000, RegionKind::Usable),
            MemoryRegion::new(0xFEC0_0000, 0x1000, RegionKind::Reserved),
        ][..]);
    }
}
