//! Installing the kernel memory map, from firmware records or the legacy size hints.

use thiserror::Error;

use super::sanitize::{sanitize_e820_map, SanitizeError};
use super::{MemoryMap, MemoryRegion, RawMap, RegionKind, TableFull, HIGH_MEMORY, ISA_HOLE_START, LOWMEMSIZE};

/// The two extended memory sizes firmware reports besides the map itself, in KiB above 1 MiB.
///
/// `ext_mem_k` is the classic `int 0x15, ah=0x88` value, capped at 64 MiB by its 16 bit width.
/// `alt_mem_k` is the `int 0x15, ax=0xE801` value which can report up to 4 GiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyHints {
    pub ext_mem_k: u32,
    pub alt_mem_k: u32,
}

impl LegacyHints {
    /// The larger hint in KiB together with the name of the call it came from.
    fn extended(&self) -> (u32, MapSource) {
        if self.alt_mem_k < self.ext_mem_k {
            (self.ext_mem_k, MapSource::Bios88)
        } else {
            (self.alt_mem_k, MapSource::BiosE801)
        }
    }
}

/// Where the installed map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSource {
    E820,
    Bios88,
    BiosE801,
}

impl MapSource {
    /// Label printed in front of every map line.
    pub fn name(self) -> &'static str {
        match self {
            MapSource::E820 => "BIOS-e820",
            MapSource::Bios88 => "BIOS-88",
            MapSource::BiosE801 => "BIOS-e801",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompositeError {
    /// Neither the firmware map nor the size hints describe any memory.
    #[error("no memory map and no memory size information available")]
    NoMemory,
}

/// Copy sanitized records into `map`, carving the legacy hole out of usable memory.
///
/// Some firmware reports `[640K, 1M)` as usable. A usable record starting below the hole
/// is cut at `0xA0000`. Whatever remains of it inside the hole is dropped and anything
/// beyond 1 MiB is kept. Copying stops at the first record that does not fit the table.
pub fn copy_e820_map(raw: &[MemoryRegion], map: &mut MemoryMap) -> Result<(), TableFull> {
    for region in raw {
        let mut start = region.start;
        let end = region.end();

        if region.kind == RegionKind::Usable && start < HIGH_MEMORY {
            if start < ISA_HOLE_START {
                map.add_region(start, ISA_HOLE_START.min(end) - start, RegionKind::Usable)?;
            }
            if end <= HIGH_MEMORY {
                continue;
            }
            start = HIGH_MEMORY;
        }
        map.add_region(start, end - start, region.kind)?;
    }
    Ok(())
}

/// The two-region map assumed when firmware gives no usable map.
pub fn fallback_map(hints: LegacyHints) -> (MemoryMap, MapSource) {
    let (extended_k, source) = hints.extended();
    let mut map = MemoryMap::new();
    // two entries always fit
    let _ = map.add_region(0, LOWMEMSIZE, RegionKind::Usable);
    if extended_k != 0 {
        let _ = map.add_region(HIGH_MEMORY, u64::from(extended_k) << 10, RegionKind::Usable);
    }
    (map, source)
}

/// Build the kernel's memory map from the raw firmware list.
///
/// The firmware list is used when it sanitizes into at least one entry. Otherwise the map is
/// synthesized from the size hints.
pub fn compose(mut raw: RawMap, hints: LegacyHints) -> Result<(MemoryMap, MapSource), CompositeError> {
    let (map, source) = match sanitize_e820_map(&mut raw) {
        Ok(_) if !raw.is_empty() => {
            let mut map = MemoryMap::new();
            if copy_e820_map(&raw, &mut map).is_err() {
                warn!("[e820] kept the first {} entries of the firmware map", map.len());
            }
            (map, MapSource::E820)
        }
        Ok(_) => {
            info!("[e820] firmware map is empty, using memory size hints");
            fallback_map(hints)
        }
        Err(SanitizeError::TooFewEntries(n)) => {
            info!("[e820] firmware map has {} entries, using memory size hints", n);
            fallback_map(hints)
        }
        Err(err) => {
            warn!("[e820] {}, using memory size hints", err);
            fallback_map(hints)
        }
    };

    if map.is_empty() {
        return Err(CompositeError::NoMemory);
    }
    Ok((map, source))
}
