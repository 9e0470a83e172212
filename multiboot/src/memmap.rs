//! Parser for the Multiboot memory map buffer.
//!
//! The buffer is a sequence of records of varying stride. Every record starts with a `u32`
//! holding the size of the rest of the record, so the next record begins `size + 4` bytes
//! later. The first 20 bytes after the size are the base address, the length and the type.
//! Boot loaders are free to append more data, which is skipped.

use bare_metal::VirtAddr;

use core::convert::TryInto;
use core::fmt;
use core::iter::FusedIterator;
use core::slice;

/// Size of the leading size field of each record.
const SIZE_FIELD: usize = 4;

/// Minimum value of a record's size field: `u64` base, `u64` length, `u32` type.
pub const ENTRY_MIN_SIZE: usize = 20;

/// The memory map buffer handed over by the boot loader.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'a> {
    buffer: &'a [u8],
}

impl<'a> MemoryMap<'a> {
    pub fn from_bytes(buffer: &'a [u8]) -> MemoryMap<'a> {
        MemoryMap { buffer }
    }

    /// Wrap the buffer at `addr`.
    ///
    /// # Safety
    ///
    /// `length` bytes starting at `addr` must be mapped and stay untouched for `'a`.
    pub unsafe fn from_raw(addr: VirtAddr, length: usize) -> MemoryMap<'a> {
        if length == 0 {
            return MemoryMap { buffer: &[] };
        }
        MemoryMap {
            buffer: slice::from_raw_parts(addr.as_ptr::<u8>(), length),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entries(&self) -> Entries<'a> {
        Entries { rest: self.buffer }
    }
}

/// An iterator over the records of a memory map buffer.
///
/// Iteration ends at the end of the buffer, or at the first record that is truncated or
/// too short to hold an entry.
#[derive(Debug, Clone)]
pub struct Entries<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Entries<'a> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.rest.len() < SIZE_FIELD {
            self.rest = &[];
            return None;
        }
        let size = read_u32(self.rest, 0) as usize;
        if size < ENTRY_MIN_SIZE || self.rest.len() - SIZE_FIELD < size {
            self.rest = &[];
            return None;
        }
        let record = &self.rest[SIZE_FIELD..SIZE_FIELD + size];
        self.rest = &self.rest[SIZE_FIELD + size..];
        Some(Entry {
            base_addr: read_u64(record, 0),
            length: read_u64(record, 8),
            entry_type: EntryType(read_u32(record, 16)),
        })
    }
}

impl<'a> FusedIterator for Entries<'a> {}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap_or([0; 4]))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap_or([0; 8]))
}

/// The type code of an entry in the memory map.
#[derive(PartialEq, Eq, Copy, Clone)]
#[repr(C)]
pub struct EntryType(pub u32);

impl EntryType {
    pub const AVAILABLE: EntryType = EntryType(1);
    pub const RESERVED: EntryType = EntryType(2);
    pub const ACPI_RECLAIMABLE: EntryType = EntryType(3);
    pub const ACPI_NVS: EntryType = EntryType(4);
}

impl fmt::Debug for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = match *self {
            EntryType::AVAILABLE => "Available",
            EntryType::RESERVED => "Reserved",
            EntryType::ACPI_RECLAIMABLE => "AcpiReclaimable",
            EntryType::ACPI_NVS => "AcpiNvs",
            _ => "Other",
        };
        write!(f, "EntryType({} ~ {})", self.0, description)
    }
}

/// A single decoded memory map record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub base_addr: u64,
    pub length: u64,
    pub entry_type: EntryType,
}

impl Entry {
    /// Return whether the memory range described by this entry is available to the OS.
    pub fn is_available(&self) -> bool {
        self.entry_type == EntryType::AVAILABLE
    }
}
