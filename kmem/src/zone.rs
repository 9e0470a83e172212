//! Zone and node descriptors handed to the production page allocator.

use arrayvec::ArrayVec;

use core::cmp;
use core::fmt;

use crate::pfn::{MemoryConfig, PageFrameRange};
use crate::physical::{PageFrame, PageFrameRegion};
use crate::PAGE_ALIGN_BITS;

/// Number of buddy orders, blocks of up to `2^(MAX_ORDER - 1)` pages.
pub const MAX_ORDER: usize = 10;

pub const MAX_NR_ZONES: usize = 3;

/// ISA DMA can only reach the first 16 MiB.
pub const MAX_DMA_PFN: usize = (16 << 20) >> PAGE_ALIGN_BITS;

const ZONE_BALANCE_RATIO: usize = 128;
const ZONE_BALANCE_MIN: usize = 20;
const ZONE_BALANCE_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZoneKind {
    Dma,
    Normal,
    HighMem,
}

impl ZoneKind {
    pub const ALL: [ZoneKind; MAX_NR_ZONES] = [ZoneKind::Dma, ZoneKind::Normal, ZoneKind::HighMem];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ZoneKind::Dma => "DMA",
            ZoneKind::Normal => "Normal",
            ZoneKind::HighMem => "HighMem",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeArea {
    pub nr_free: usize,
}

/// Free page thresholds that drive reclaim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn for_size(pages: usize) -> Watermarks {
        if pages == 0 {
            return Watermarks::default();
        }
        let min = cmp::min(cmp::max(pages / ZONE_BALANCE_RATIO, ZONE_BALANCE_MIN), ZONE_BALANCE_MAX);
        Watermarks { min, low: min * 2, high: min * 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneDescriptor {
    pub kind: ZoneKind,
    /// The node owning this zone.
    pub node_id: usize,
    pub frames: PageFrameRegion,
    /// Pages the production allocator owns in this zone, filled in at hand-off.
    pub free_pages: usize,
    pub watermarks: Watermarks,
    pub free_area: [FreeArea; MAX_ORDER],
}

impl ZoneDescriptor {
    fn new(node_id: usize, kind: ZoneKind, frames: PageFrameRegion) -> ZoneDescriptor {
        ZoneDescriptor {
            kind,
            node_id,
            frames,
            free_pages: 0,
            watermarks: Watermarks::for_size(frames.length()),
            free_area: [FreeArea::default(); MAX_ORDER],
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn frame_start(&self) -> PageFrame {
        self.frames.start
    }

    pub fn frame_count(&self) -> usize {
        self.frames.length()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A node of physical memory. This kernel has exactly one, covering `[0, max_pfn)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub node_id: usize,
    pub node_start_pfn: PageFrame,
    pub node_size: usize,
    zones: [ZoneDescriptor; MAX_NR_ZONES],
    /// Allocation fallback order per requested zone kind.
    zonelists: [ArrayVec<ZoneKind, MAX_NR_ZONES>; MAX_NR_ZONES],
}

impl NodeDescriptor {
    /// Slice the frames of a contiguous machine into DMA, Normal and HighMem zones.
    pub fn contiguous(node_id: usize, frames: &PageFrameRange, config: &MemoryConfig) -> NodeDescriptor {
        let low = frames.max_low_pfn.0;
        let dma_end = cmp::min(low, MAX_DMA_PFN);
        let high_end = if config.highmem { cmp::max(frames.highend_pfn.0, low) } else { low };

        let zones = [
            ZoneDescriptor::new(node_id, ZoneKind::Dma, PageFrameRegion::new(PageFrame(0), PageFrame(dma_end))),
            ZoneDescriptor::new(node_id, ZoneKind::Normal, PageFrameRegion::new(PageFrame(dma_end), PageFrame(low))),
            ZoneDescriptor::new(node_id, ZoneKind::HighMem, PageFrameRegion::new(PageFrame(low), PageFrame(high_end))),
        ];

        let mut zonelists: [ArrayVec<ZoneKind, MAX_NR_ZONES>; MAX_NR_ZONES] = Default::default();
        for kind in ZoneKind::ALL.iter() {
            let list = &mut zonelists[kind.index()];
            for fallback in ZoneKind::ALL[..=kind.index()].iter().rev() {
                if !zones[fallback.index()].is_empty() {
                    list.push(*fallback);
                }
            }
        }

        let node = NodeDescriptor {
            node_id,
            node_start_pfn: PageFrame(0),
            node_size: frames.max_pfn.0,
            zones,
            zonelists,
        };
        for zone in node.zones.iter() {
            debug!("[zone] {:<7} {:#x}-{:#x} ({} pages) watermarks {}/{}/{}",
                zone.name(), zone.frames.start.0, zone.frames.end.0, zone.frame_count(),
                zone.watermarks.min, zone.watermarks.low, zone.watermarks.high);
        }
        node
    }

    pub fn zone(&self, kind: ZoneKind) -> &ZoneDescriptor {
        &self.zones[kind.index()]
    }

    pub fn zones(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    /// Zones to try, in order, for an allocation from `kind`.
    pub fn zonelist(&self, kind: ZoneKind) -> &[ZoneKind] {
        &self.zonelists[kind.index()]
    }

    pub fn zone_of(&self, frame: PageFrame) -> Option<ZoneKind> {
        self.zones.iter().find(|zone| zone.frames.contains(frame)).map(|zone| zone.kind)
    }

    /// Account freshly released frames to the zones they fall into.
    pub fn account_free(&mut self, region: PageFrameRegion) {
        for zone in self.zones.iter_mut() {
            zone.free_pages += zone.frames.intersection(&region).length();
        }
    }

    pub fn free_pages(&self) -> usize {
        self.zones.iter().map(|zone| zone.free_pages).sum()
    }
}

/// The allocator taking over physical memory once boot allocation ends.
pub trait PageAllocator {
    /// Called once with the final frame layout, before any frames are released.
    fn hand_off(&mut self, frames: &PageFrameRange, node: &NodeDescriptor);

    /// Take ownership of a run of free frames.
    fn free_frames(&mut self, region: PageFrameRegion);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pfn::KernelLayout;

    fn range(max_low_pfn: usize, max_pfn: usize) -> PageFrameRange {
        let highstart = if max_pfn > max_low_pfn { max_low_pfn } else { max_pfn };
        PageFrameRange {
            start_pfn: PageFrame(0x400),
            max_low_pfn: PageFrame(max_low_pfn),
            max_pfn: PageFrame(max_pfn),
            highstart_pfn: PageFrame(highstart),
            highend_pfn: PageFrame(max_pfn),
        }
    }

    fn config(highmem: bool) -> MemoryConfig {
        MemoryConfig { highmem, pae: false, layout: KernelLayout::I386 }
    }

    #[test]
    fn watermarks_are_clamped() {
        assert_eq!(Watermarks::for_size(1000), Watermarks { min: 20, low: 40, high: 60 });
        assert_eq!(Watermarks::for_size(12800), Watermarks { min: 100, low: 200, high: 300 });
        assert_eq!(Watermarks::for_size(0x38000), Watermarks { min: 255, low: 510, high: 765 });
        assert_eq!(Watermarks::for_size(0), Watermarks::default());
    }

    #[test]
    fn tiny_machine_is_all_dma() {
        let node = NodeDescriptor::contiguous(0, &range(0xF00, 0xF00), &config(true));
        assert_eq!(node.zone(ZoneKind::Dma).frame_count(), 0xF00);
        assert!(node.zone(ZoneKind::Normal).is_empty());
        assert!(node.zone(ZoneKind::HighMem).is_empty());
        assert_eq!(node.zonelist(ZoneKind::HighMem), &[ZoneKind::Dma]);
        assert_eq!(node.zonelist(ZoneKind::Normal), &[ZoneKind::Dma]);
    }

    #[test]
    fn large_machine_has_three_zones() {
        let node = NodeDescriptor::contiguous(0, &range(0x38000, 0x80000), &config(true));
        assert_eq!(node.node_start_pfn, PageFrame(0));
        assert_eq!(node.node_size, 0x80000);
        assert_eq!(node.zone(ZoneKind::Dma).frames, PageFrameRegion::new(PageFrame(0), PageFrame(0x1000)));
        assert_eq!(node.zone(ZoneKind::Normal).frames, PageFrameRegion::new(PageFrame(0x1000), PageFrame(0x38000)));
        assert_eq!(node.zone(ZoneKind::HighMem).frame_start(), PageFrame(0x38000));
        assert_eq!(node.zone(ZoneKind::HighMem).frame_count(), 0x48000);
        assert_eq!(node.zonelist(ZoneKind::HighMem), &[ZoneKind::HighMem, ZoneKind::Normal, ZoneKind::Dma]);
        assert_eq!(node.zonelist(ZoneKind::Normal), &[ZoneKind::Normal, ZoneKind::Dma]);
        assert_eq!(node.zonelist(ZoneKind::Dma), &[ZoneKind::Dma]);
        assert_eq!(node.zone_of(PageFrame(0x50000)), Some(ZoneKind::HighMem));
        assert_eq!(node.zone_of(PageFrame(0x80000)), None);
    }

    #[test]
    fn zones_name_their_node() {
        let node = NodeDescriptor::contiguous(3, &range(0x38000, 0x80000), &config(true));
        assert_eq!(node.node_id, 3);
        assert!(node.zones().iter().all(|zone| zone.node_id == 3));
    }

    #[test]
    fn no_highmem_zone_without_support() {
        let node = NodeDescriptor::contiguous(0, &range(0x38000, 0x38000), &config(false));
        assert!(node.zone(ZoneKind::HighMem).is_empty());
        assert_eq!(node.zonelist(ZoneKind::HighMem), &[ZoneKind::Normal, ZoneKind::Dma]);
    }

    #[test]
    fn free_pages_are_accounted_per_zone() {
        let mut node = NodeDescriptor::contiguous(0, &range(0x38000, 0x40000), &config(true));
        node.account_free(PageFrameRegion::new(PageFrame(0xF00), PageFrame(0x1100)));
        node.account_free(PageFrameRegion::new(PageFrame(0x38000), PageFrame(0x38010)));
        assert_eq!(node.zone(ZoneKind::Dma).free_pages, 0x100);
        assert_eq!(node.zone(ZoneKind::Normal).free_pages, 0x100);
        assert_eq!(node.zone(ZoneKind::HighMem).free_pages, 0x10);
        assert_eq!(node.free_pages(), 0x210);
    }

    #[test]
    fn zone_names() {
        assert_eq!(ZoneKind::Dma.to_string(), "DMA");
        assert_eq!(ZoneKind::Normal.name(), "Normal");
        assert_eq!(ZoneKind::HighMem.name(), "HighMem");
    }
}
