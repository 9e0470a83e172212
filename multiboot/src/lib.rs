#![cfg_attr(not(test), no_std)]
//! Parser for the Multiboot information block provided by the boot loader.
//!
//! The boot loader leaves the block somewhere in low physical memory and passes its address
//! in `ebx`. Everything the block points to is addressed physically as well, so every accessor
//! that follows such a pointer takes a translation from physical to virtual addresses.
//!
//! The safety of this parser depends on the bootloader being multiboot compliant.
//! Fields are only interpreted when the corresponding bit in `flags` is set.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;

use bare_metal::{PhysAddr, PhysAddrRange, VirtAddr};

use core::slice;
use core::str;

pub mod memmap;

/// Value found in `eax` when the kernel was loaded by a multiboot compliant loader.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

bitflags! {
    /// Marks which fields of the information block are valid.
    pub struct InfoFlags: u32 {
        const MEMORY = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE = 1 << 2;
        const MODULES = 1 << 3;
        const AOUT_SYMBOLS = 1 << 4;
        const ELF_SECTIONS = 1 << 5;
        const MEMORY_MAP = 1 << 6;
        const DRIVES = 1 << 7;
        const CONFIG_TABLE = 1 << 8;
        const BOOT_LOADER_NAME = 1 << 9;
        const APM_TABLE = 1 << 10;
        const VBE = 1 << 11;
    }
}

/// Root of the Multiboot info data.
#[repr(C, packed)]
pub struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
    drives_length: u32,
    drives_addr: u32,
    config_table: u32,
    boot_loader_name: u32,
    apm_table: u32,
    vbe_control_info: u32,
    vbe_mode_info: u32,
    vbe_mode: u16,
    vbe_interface_seg: u16,
    vbe_interface_off: u16,
    vbe_interface_len: u16,
}

assert_eq_size!(MultibootInfo, [u8; 88]);
assert_eq_size!(ModuleEntry, [u8; 16]);

/// The legacy BIOS memory size probes, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHints {
    /// Conventional memory starting at address 0.
    pub lower_kib: u32,
    /// Extended memory starting at 1 MiB.
    pub upper_kib: u32,
}

impl MultibootInfo {
    /// Interpret the memory at `addr` as a multiboot information block.
    ///
    /// # Safety
    ///
    /// `addr` must point to a valid information block that lives for `'a`.
    pub unsafe fn from_addr<'a>(addr: VirtAddr) -> &'a MultibootInfo {
        &*addr.as_ptr::<MultibootInfo>()
    }

    pub fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(self.flags)
    }

    pub fn memory_hints(&self) -> Option<MemoryHints> {
        if self.flags().contains(InfoFlags::MEMORY) {
            Some(MemoryHints {
                lower_kib: self.mem_lower,
                upper_kib: self.mem_upper,
            })
        } else {
            None
        }
    }

    /// Physical location of the memory map buffer.
    pub fn memory_map_location(&self) -> Option<PhysAddrRange> {
        if self.flags().contains(InfoFlags::MEMORY_MAP) {
            Some(PhysAddrRange::new(PhysAddr(u64::from(self.mmap_addr)), u64::from(self.mmap_length)))
        } else {
            None
        }
    }

    /// The memory map buffer, translated with `to_virt`.
    ///
    /// # Safety
    ///
    /// `to_virt` must yield a mapping of the buffer that lives for `'a`.
    pub unsafe fn memory_map<'a, F>(&self, to_virt: F) -> Option<memmap::MemoryMap<'a>>
    where
        F: Fn(PhysAddr) -> VirtAddr,
    {
        let location = self.memory_map_location()?;
        Some(memmap::MemoryMap::from_raw(to_virt(location.start), location.length as usize))
    }

    /// The kernel command line.
    ///
    /// # Safety
    ///
    /// `to_virt` must yield a mapping of the null terminated string that lives for `'a`.
    pub unsafe fn cmdline<'a, F>(&self, to_virt: F) -> Option<&'a str>
    where
        F: Fn(PhysAddr) -> VirtAddr,
    {
        if !self.flags().contains(InfoFlags::CMDLINE) || self.cmdline == 0 {
            return None;
        }
        let start = to_virt(PhysAddr(u64::from(self.cmdline))).as_ptr::<u8>();
        let mut length = 0;
        while *start.add(length) != 0 {
            length += 1;
        }
        str::from_utf8(slice::from_raw_parts(start, length)).ok()
    }

    /// The boot modules loaded alongside the kernel.
    ///
    /// # Safety
    ///
    /// `to_virt` must yield a mapping of the module list that lives for `'a`.
    pub unsafe fn modules<'a, F>(&self, to_virt: F) -> &'a [ModuleEntry]
    where
        F: Fn(PhysAddr) -> VirtAddr,
    {
        if !self.flags().contains(InfoFlags::MODULES) || self.mods_count == 0 {
            return &[];
        }
        let first = to_virt(PhysAddr(u64::from(self.mods_addr))).as_ptr::<ModuleEntry>();
        slice::from_raw_parts(first, self.mods_count as usize)
    }
}

/// One entry of the module list.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    mod_start: u32,
    mod_end: u32,
    string: u32,
    reserved: u32,
}

impl ModuleEntry {
    pub const fn new(mod_start: u32, mod_end: u32) -> ModuleEntry {
        ModuleEntry {
            mod_start,
            mod_end,
            string: 0,
            reserved: 0,
        }
    }

    /// Physical memory occupied by the module.
    pub fn range(&self) -> PhysAddrRange {
        PhysAddrRange::from_bounds(PhysAddr(u64::from(self.mod_start)), PhysAddr(u64::from(self.mod_end)))
    }
}
