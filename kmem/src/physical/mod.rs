use bare_metal::{PhysAddr, PhysAddrRange};

use core::convert::TryFrom;
use core::ops;

use crate::{PAGE_ALIGN_BITS, PAGE_SIZE};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Number of a physical page frame, counted from the start.
/// The first page frame at physical address 0x0 has number zero.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone)]
pub struct PageFrame(pub usize);

impl PageFrame {
    /// Return the next page frame starting at or above the given physical address.
    pub fn next_above(addr: PhysAddr) -> PageFrame {
        let partial = if addr.0 & PAGE_MASK != 0 { 1 } else { 0 };
        PageFrame::from_raw((addr.0 >> PAGE_ALIGN_BITS) + partial)
    }

    /// Return the page frame including the given physical address.
    pub fn including(addr: PhysAddr) -> PageFrame {
        PageFrame::from_raw(addr.0 >> PAGE_ALIGN_BITS)
    }

    /// Frame numbers that do not fit the native word saturate, so that they compare above
    /// every frame the kernel can manage.
    fn from_raw(number: u64) -> PageFrame {
        PageFrame(usize::try_from(number).unwrap_or(usize::MAX))
    }

    pub fn start_address(&self) -> PhysAddr {
        PhysAddr((self.0 as u64) << PAGE_ALIGN_BITS)
    }
}

impl ops::Add<usize> for PageFrame {
    type Output = PageFrame;

    fn add(self, rhs: usize) -> PageFrame {
        PageFrame(self.0 + rhs)
    }
}

impl ops::Sub<PageFrame> for PageFrame {
    type Output = usize;

    fn sub(self, rhs: PageFrame) -> usize {
        self.0 - rhs.0
    }
}

/// A region of physical page frames.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct PageFrameRegion {
    /// The first frame included in the region.
    pub start: PageFrame,
    /// The first frame after the region (not included).
    pub end: PageFrame,
}

impl PageFrameRegion {
    pub const fn new(start: PageFrame, end: PageFrame) -> PageFrameRegion {
        PageFrameRegion { start, end }
    }

    /// Construct the largest page frame region that is included in the given physical memory region.
    pub fn new_included_in(range: &PhysAddrRange) -> PageFrameRegion {
        PageFrameRegion {
            start: PageFrame::next_above(range.start),
            end: PageFrame::including(range.end()),
        }
    }

    /// Construct the smallest page frame region that is fully including the given physical memory region.
    pub fn new_including(range: &PhysAddrRange) -> PageFrameRegion {
        PageFrameRegion {
            start: PageFrame::including(range.start),
            end: PageFrame::next_above(range.end()),
        }
    }

    pub fn length(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            self.end.0 - self.start.0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, frame: PageFrame) -> bool {
        frame >= self.start && frame < self.end
    }

    /// The frames both regions have in common. May be empty.
    pub fn intersection(&self, other: &PageFrameRegion) -> PageFrameRegion {
        PageFrameRegion {
            start: core::cmp::max(self.start, other.start),
            end: core::cmp::min(self.end, other.end),
        }
    }

    pub fn start_address(&self) -> PhysAddr {
        self.start.start_address()
    }
}
