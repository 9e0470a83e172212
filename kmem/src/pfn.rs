//! Deriving the page frame boundaries of low and high memory from the memory map.

use bare_metal::{PhysAddr, VirtAddr};

use core::cmp;

use crate::e820::MemoryMap;
use crate::mapping::DirectMapping;
use crate::physical::{PageFrame, PageFrameRegion};
use crate::PAGE_ALIGN_BITS;

/// Highest frame count reachable with 32 bit physical addresses.
pub const MAX_NONPAE_PFN: usize = 1 << 20;

/// A high memory budget must leave at least this many frames of low memory.
pub const LOWMEM_FLOOR_PAGES: usize = (64 << 20) >> PAGE_ALIGN_BITS;

/// Placement of the kernel's linear mapping in the 32 bit virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    /// Virtual address where physical address zero is mapped.
    pub page_offset: u64,
    /// Bytes at the top of the address space kept back for dynamic mappings.
    pub vmalloc_reserve: u64,
}

impl KernelLayout {
    /// The classic 3 GiB / 1 GiB split with 128 MiB of vmalloc space.
    pub const I386: KernelLayout = KernelLayout {
        page_offset: 0xC000_0000,
        vmalloc_reserve: 128 << 20,
    };

    /// Bytes of physical memory the kernel can map directly.
    pub fn maxmem(&self) -> u64 {
        (1u64 << 32)
            .saturating_sub(self.page_offset)
            .saturating_sub(self.vmalloc_reserve)
    }

    /// First frame that is not directly mapped.
    pub fn maxmem_pfn(&self) -> usize {
        PageFrame::including(PhysAddr(self.maxmem())).0
    }

    /// The linear mapping of low memory.
    pub fn direct_mapping(&self) -> DirectMapping {
        DirectMapping::new(VirtAddr(self.page_offset as usize), PhysAddr(0), self.maxmem())
    }
}

impl Default for KernelLayout {
    fn default() -> KernelLayout {
        KernelLayout::I386
    }
}

/// What the kernel was built to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Memory above the direct mapping ceiling can be used.
    pub highmem: bool,
    /// Memory above 4 GiB can be addressed.
    pub pae: bool,
    pub layout: KernelLayout,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig {
            highmem: cfg!(feature = "highmem"),
            pae: cfg!(feature = "pae"),
            layout: KernelLayout::default(),
        }
    }
}

/// Frame boundaries of physical memory, in page frame numbers.
///
/// `start_pfn <= max_low_pfn <= max_pfn` (unless the kernel image itself extends past low
/// memory), and `[highstart_pfn, highend_pfn)` is empty when there is no high memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrameRange {
    /// First frame after the kernel image, where boot allocations may begin.
    pub start_pfn: PageFrame,
    /// First frame that is not directly mapped.
    pub max_low_pfn: PageFrame,
    /// First frame after the highest usable memory.
    pub max_pfn: PageFrame,
    pub highstart_pfn: PageFrame,
    pub highend_pfn: PageFrame,
}

impl PageFrameRange {
    /// Analyze the memory map.
    ///
    /// `kernel_end` is the first physical address after the kernel image, `highmem_pages` the
    /// high memory budget requested on the command line.
    pub fn analyze(map: &MemoryMap, kernel_end: PhysAddr, highmem_pages: Option<usize>, config: &MemoryConfig) -> PageFrameRange {
        let mut max_pfn = find_max_pfn(map);
        let max_low_pfn = find_max_low_pfn(&mut max_pfn, highmem_pages, config);

        let (highstart_pfn, highend_pfn) = if max_pfn > max_low_pfn {
            (max_low_pfn, max_pfn)
        } else {
            (max_pfn, max_pfn)
        };

        let range = PageFrameRange {
            start_pfn: PageFrame::next_above(kernel_end),
            max_low_pfn: PageFrame(max_low_pfn),
            max_pfn: PageFrame(max_pfn),
            highstart_pfn: PageFrame(highstart_pfn),
            highend_pfn: PageFrame(highend_pfn),
        };
        if config.highmem {
            info!("[pfn] {}MB HIGHMEM available.", pages_to_mb(range.highmem().length()));
        }
        info!("[pfn] {}MB LOWMEM available.", pages_to_mb(max_low_pfn));
        range
    }

    /// The directly mapped frames `[0, max_low_pfn)`.
    pub fn lowmem(&self) -> PageFrameRegion {
        PageFrameRegion::new(PageFrame(0), self.max_low_pfn)
    }

    pub fn highmem(&self) -> PageFrameRegion {
        PageFrameRegion::new(self.highstart_pfn, self.highend_pfn)
    }
}

pub fn pages_to_mb(pages: usize) -> usize {
    pages >> (20 - PAGE_ALIGN_BITS)
}

/// First frame after the highest whole page of usable memory.
///
/// Usable entries that do not cross a page boundary are ignored.
pub fn find_max_pfn(map: &MemoryMap) -> usize {
    map.regions()
        .iter()
        .filter(|region| region.is_usable())
        .filter_map(|region| {
            let first = PageFrame::including(PhysAddr(region.start));
            let end = PageFrame::including(PhysAddr(region.end()));
            if first < end {
                Some(end.0)
            } else {
                None
            }
        })
        .max()
        .unwrap_or(0)
}

/// Split `[0, max_pfn)` into directly mapped low memory and high memory.
///
/// Returns `max_low_pfn` and may lower `max_pfn` when the kernel cannot use all of memory or the
/// operator asked for less high memory than present. Impossible requests are ignored with a warning.
pub fn find_max_low_pfn(max_pfn: &mut usize, highmem_pages: Option<usize>, config: &MemoryConfig) -> usize {
    let ceiling = config.layout.maxmem_pfn();
    let mut max_low_pfn = *max_pfn;

    if max_low_pfn > ceiling {
        let present = *max_pfn - ceiling;
        let budget = highmem_pages.unwrap_or(present);
        let wanted = ceiling.saturating_add(budget);
        if wanted < *max_pfn {
            *max_pfn = wanted;
        }
        if wanted > *max_pfn {
            warn!("[pfn] only {}MB highmem pages available, ignoring highmem size of {}MB!",
                pages_to_mb(present), pages_to_mb(budget));
        }
        max_low_pfn = ceiling;

        if !config.highmem {
            warn!("[pfn] Warning only {}MB will be used.", config.layout.maxmem() >> 20);
            if *max_pfn > MAX_NONPAE_PFN {
                warn!("[pfn] Use a PAE enabled kernel.");
            } else {
                warn!("[pfn] Use a HIGHMEM enabled kernel.");
            }
            *max_pfn = ceiling;
        } else if !config.pae && *max_pfn > MAX_NONPAE_PFN {
            *max_pfn = MAX_NONPAE_PFN;
            warn!("[pfn] Warning only 4GB will be used.");
            warn!("[pfn] Use a PAE enabled kernel.");
        }
    } else if let Some(budget) = highmem_pages.filter(|&budget| budget != 0) {
        if !config.highmem {
            error!("[pfn] ignoring highmem size on non-highmem kernel!");
        } else if budget >= *max_pfn {
            error!("[pfn] highmem size requested ({}MB) is bigger than pages available ({}MB)!",
                pages_to_mb(budget), pages_to_mb(*max_pfn));
        } else if max_low_pfn - budget < LOWMEM_FLOOR_PAGES {
            error!("[pfn] highmem size {}MB results in smaller than 64MB lowmem, ignoring it.",
                pages_to_mb(budget));
        } else {
            max_low_pfn -= budget;
        }
    }

    cmp::min(max_low_pfn, *max_pfn)
}
