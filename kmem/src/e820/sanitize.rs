//! Turning the raw firmware list into an ordered, overlap-free map.
//!
//! Firmware lists overlap, come unordered and contain empty records. Every region contributes two
//! change points, one at its start and one at its end. Sweeping the sorted points from low to high
//! addresses while tracking the set of regions covering the current address yields the effective
//! kind of every stretch of memory: the kind with the highest type code among the covering regions,
//! or a hole if none covers it. Adjacent stretches of the same kind collapse into one entry.

use arrayvec::ArrayVec;
use thiserror::Error;

use super::{MemoryRegion, RawMap, RegionKind, E820MAX, E820_RAW_MAX};

const CHANGE_POINTS_MAX: usize = 2 * E820_RAW_MAX;

/// Reasons for leaving the raw list untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SanitizeError {
    /// A map with a single entry cannot overlap itself.
    #[error("only {0} memory map entries, nothing to sanitize")]
    TooFewEntries(usize),
    /// An entry whose end does not fit 64 bits. The whole list is considered corrupt.
    #[error("memory map entry {index} wraps around the address space")]
    AddressOverflow { index: usize },
}

/// Outcome of a successful sanitize pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Number of entries in the rewritten list.
    pub entries: usize,
    /// The result needed more than [`E820MAX`] entries and was cut off.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
struct ChangePoint {
    addr: u64,
    /// Index of the owning region in the raw list.
    region: usize,
    /// Whether this is the point where the owning region begins.
    opens: bool,
    /// Position in emission order, keeps the sort stable.
    seq: usize,
}

/// Rewrite `map` in place so that its entries are sorted, disjoint and non-empty.
///
/// On error the list is left unchanged.
pub fn sanitize_e820_map(map: &mut RawMap) -> Result<SanitizeReport, SanitizeError> {
    if map.len() < 2 {
        return Err(SanitizeError::TooFewEntries(map.len()));
    }
    if let Some(index) = map.iter().position(|region| region.checked_end().is_none()) {
        return Err(SanitizeError::AddressOverflow { index });
    }

    let mut points: ArrayVec<ChangePoint, CHANGE_POINTS_MAX> = ArrayVec::new();
    for (index, region) in map.iter().enumerate().filter(|(_, region)| region.length != 0) {
        let seq = points.len();
        points.push(ChangePoint { addr: region.start, region: index, opens: true, seq });
        points.push(ChangePoint { addr: region.end(), region: index, opens: false, seq: seq + 1 });
    }
    // At equal addresses a region that begins there is counted before one that ends there, so that
    // abutting regions of one kind never leave a gap between them.
    points.sort_unstable_by_key(|point| (point.addr, !point.opens, point.seq));

    let (sanitized, truncated) = sweep(map, &points);

    let before = map.len();
    map.clear();
    map.extend(sanitized.iter().copied());
    debug!("[e820] sanitized {} raw entries into {}", before, map.len());
    if truncated {
        warn!("[e820] memory map needs more than {} entries, ignoring the rest", E820MAX);
    }
    Ok(SanitizeReport { entries: map.len(), truncated })
}

fn sweep(map: &RawMap, points: &[ChangePoint]) -> (ArrayVec<MemoryRegion, E820MAX>, bool) {
    let mut sanitized: ArrayVec<MemoryRegion, E820MAX> = ArrayVec::new();
    let mut covering: ArrayVec<usize, E820_RAW_MAX> = ArrayVec::new();
    // start address and type code of the entry being built, 0 means hole
    let mut open_start = 0u64;
    let mut open_code = 0u32;

    for point in points {
        if point.opens {
            covering.push(point.region);
        } else if let Some(pos) = covering.iter().position(|&region| region == point.region) {
            covering.swap_remove(pos);
        }

        let code = covering
            .iter()
            .map(|&region| map[region].kind.code())
            .max()
            .unwrap_or(0);
        if code == open_code {
            continue;
        }

        if open_code != 0 && point.addr != open_start {
            sanitized.push(MemoryRegion::new(
                open_start,
                point.addr - open_start,
                RegionKind::from_code(open_code),
            ));
        }
        if code != 0 && sanitized.is_full() {
            return (sanitized, true);
        }
        open_start = point.addr;
        open_code = code;
    }
    (sanitized, false)
}
