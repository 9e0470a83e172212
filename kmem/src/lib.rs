#![cfg_attr(not(test), no_std)]
//! Physical memory bookkeeping for early boot: the firmware memory map, the split into low and
//! high memory, the boot-time bitmap allocator and the zone layout handed to the page allocator.

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

extern crate bare_metal;

pub mod bootmem;
pub mod e820;
pub mod mapping;
pub mod pfn;
pub mod physical;
pub mod zone;

/// Number of trailing zeros in a page aligned address.
pub const PAGE_ALIGN_BITS: u32 = 12;

/// Size of a normal physical page, 4096 bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_ALIGN_BITS;
