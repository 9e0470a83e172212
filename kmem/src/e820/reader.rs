//! Collecting the raw firmware memory map.

use bare_metal::VirtAddr;
use multiboot::memmap;

use core::slice;

use super::{MemoryRegion, RawMap, RegionKind, E820_RAW_MAX};

/// A record of the table the real-mode setup code fills with `int 0x15, ax=0xE820`.
///
/// Records are packed back to back, 20 bytes each.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BiosMapEntry {
    addr: u64,
    size: u64,
    entry_type: u32,
}

assert_eq_size!(BiosMapEntry, [u8; 20]);

impl BiosMapEntry {
    pub const fn new(addr: u64, size: u64, entry_type: u32) -> BiosMapEntry {
        BiosMapEntry { addr, size, entry_type }
    }

    /// View `count` records at `addr` as a table.
    ///
    /// # Safety
    ///
    /// The records must be mapped, initialized and stay untouched for `'a`.
    pub unsafe fn table<'a>(addr: VirtAddr, count: usize) -> &'a [BiosMapEntry] {
        if count == 0 {
            return &[];
        }
        slice::from_raw_parts(addr.as_ptr::<BiosMapEntry>(), count)
    }

    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.addr, self.size, RegionKind::from_code(self.entry_type))
    }
}

/// Where the firmware memory map comes from.
#[derive(Clone, Copy)]
pub enum FirmwareMap<'a> {
    /// The variable-stride buffer a Multiboot loader passes along.
    BootLoader(memmap::MemoryMap<'a>),
    /// A table of fixed-size BIOS records and its entry count.
    Legacy(&'a [BiosMapEntry]),
    /// No firmware map at all; only the legacy size hints are known.
    Absent,
}

impl<'a> FirmwareMap<'a> {
    /// Read every record into a raw list, in firmware order.
    ///
    /// Records beyond the capacity of the raw list are dropped with a warning.
    pub fn read(&self) -> RawMap {
        let mut raw = RawMap::new();
        let mut dropped = 0;
        let mut push = |region: MemoryRegion| {
            if raw.try_push(region).is_err() {
                dropped += 1;
            }
        };
        match self {
            FirmwareMap::BootLoader(map) => {
                for entry in map.entries() {
                    push(MemoryRegion::new(entry.base_addr, entry.length, RegionKind::from_code(entry.entry_type.0)));
                }
            }
            FirmwareMap::Legacy(table) => {
                for entry in table.iter() {
                    push(entry.region());
                }
            }
            FirmwareMap::Absent => {}
        }
        if dropped > 0 {
            warn!("[e820] firmware reported more than {} entries, dropped {}", E820_RAW_MAX, dropped);
        }
        debug!("[e820] read {} raw entries", raw.len());
        raw
    }
}
