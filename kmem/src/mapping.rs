use bare_metal::{PhysAddr, VirtAddr};

use core::convert::TryFrom;

/// Translation between physical addresses and the kernel's linear view of low memory.
///
/// On i386 the kernel sees physical memory `[0, MAXMEM)` at `PAGE_OFFSET`, so every structure the
/// boot allocators hand out is reachable at a fixed offset from its physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMapping {
    virtual_base: VirtAddr,
    physical_base: PhysAddr,
    size_in_bytes: u64,
}

impl DirectMapping {
    pub const fn new(virtual_base: VirtAddr, physical_base: PhysAddr, size_in_bytes: u64) -> Self {
        DirectMapping {
            virtual_base,
            physical_base,
            size_in_bytes,
        }
    }

    /// The start of the virtual address range of this mapping, mapped to `self.physical_base()`.
    pub fn virtual_base(&self) -> VirtAddr {
        self.virtual_base
    }

    pub fn physical_base(&self) -> PhysAddr {
        self.physical_base
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn contains_phys(&self, phys_addr: PhysAddr) -> bool {
        phys_addr >= self.physical_base && phys_addr - self.physical_base < self.size_in_bytes
    }

    pub fn contains_virt(&self, virt_addr: VirtAddr) -> bool {
        virt_addr >= self.virtual_base && ((virt_addr - self.virtual_base) as u64) < self.size_in_bytes
    }

    /// Translates a physical to a virtual address using the direct mapping.
    ///
    /// # Panics
    ///
    /// Panics, if the given physical address is outside of the range provided by this direct mapping.
    pub fn phys_to_virt(&self, phys_addr: PhysAddr) -> VirtAddr {
        if !self.contains_phys(phys_addr) {
            panic!("[DirectMapping::phys_to_virt] physical address {:p} out of bounds", phys_addr);
        }
        // in range, so the offset is below `size_in_bytes` which fits the virtual window
        let offset = usize::try_from(phys_addr - self.physical_base).unwrap_or(usize::MAX);
        self.virtual_base + offset
    }

    /// Translates a virtual to a physical address using the direct mapping.
    ///
    /// # Panics
    ///
    /// Panics, if the given virtual address is outside of the range provided by this direct mapping.
    pub fn virt_to_phys(&self, virt_addr: VirtAddr) -> PhysAddr {
        if !self.contains_virt(virt_addr) {
            panic!("[DirectMapping::virt_to_phys] virtual address {:p} out of bounds", virt_addr);
        }
        self.physical_base + (virt_addr - self.virtual_base) as u64
    }
}
