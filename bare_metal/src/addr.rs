//! Newtype wrappers that make it harder to accidentally confuse physical and virtual addresses.
//!
//! Physical addresses are always 64 bits wide, because firmware reports memory above 4 GiB even
//! to kernels that run without extended addressing. Virtual addresses are pointer sized.

use core::fmt;
use core::ops;

use super::align::Alignable;

/// A virtual address. It's validity depends on the current page mapping.
#[repr(C)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct VirtAddr(pub usize);

/// A physical address. Whether it is accessible depends on the current page mapping.
#[repr(C)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct PhysAddr(pub u64);

impl VirtAddr {
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// A half-open range `[start, start + length)` of physical memory.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PhysAddrRange {
    pub start: PhysAddr,
    pub length: u64,
}

impl PhysAddrRange {
    pub const fn new(start: PhysAddr, length: u64) -> PhysAddrRange {
        PhysAddrRange { start, length }
    }

    /// Constructs the range between two bounds. An inverted pair yields an empty range.
    pub fn from_bounds(start: PhysAddr, end: PhysAddr) -> PhysAddrRange {
        PhysAddrRange {
            start,
            length: end.0.saturating_sub(start.0),
        }
    }

    /// First address after the range, saturating at the top of the address space.
    pub fn end(&self) -> PhysAddr {
        PhysAddr(self.start.0.saturating_add(self.length))
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end()
    }
}

macro_rules! impl_addr_arith {
    ($addr:tt, $num:ty) => {
        impl Alignable for $addr {
            type Alignment = $num;

            fn align_up(self, alignment: $num) -> $addr {
                $addr(self.0.align_up(alignment))
            }

            fn align_down(self, alignment: $num) -> $addr {
                $addr(self.0.align_down(alignment))
            }

            fn is_aligned(self, alignment: $num) -> bool {
                self.0.is_aligned(alignment)
            }
        }

        impl ops::Add<$num> for $addr {
            type Output = $addr;

            fn add(self, other: $num) -> Self::Output {
                $addr(self.0 + other)
            }
        }

        impl ops::AddAssign<$num> for $addr {
            fn add_assign(&mut self, other: $num) {
                self.0 += other;
            }
        }

        impl ops::Sub<$num> for $addr {
            type Output = $addr;

            fn sub(self, other: $num) -> Self::Output {
                $addr(self.0 - other)
            }
        }

        impl ops::Sub<$addr> for $addr {
            type Output = $num;

            fn sub(self, other: $addr) -> Self::Output {
                self.0 - other.0
            }
        }
    };
}

impl_addr_arith!(VirtAddr, usize);
impl_addr_arith!(PhysAddr, u64);

impl fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:016x}_P", self.0)
    }
}

impl fmt::Pointer for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:08x}_V", self.0)
    }
}
