//! The boot-time page allocator.
//!
//! One bit per page frame of low memory, set when the frame is reserved. Everything starts out
//! reserved; the boot code frees the usable RAM from the memory map and then reserves what is
//! already in use. Allocations are first fit. Consecutive small allocations share pages.
//!
//! Misuse (double free, ranges outside the covered frames, running out of memory) panics: there
//! is nothing to recover to this early in boot.

use bare_metal::{Alignable, PhysAddr};

use core::{cmp, mem, slice};

use crate::mapping::DirectMapping;
use crate::physical::{PageFrame, PageFrameRegion};
use crate::zone::PageAllocator;
use crate::{PAGE_ALIGN_BITS, PAGE_SIZE};

const BITS_PER_WORD: usize = mem::size_of::<usize>() * 8;

pub struct BootMemory<'a> {
    /// One bit per frame in `[start, end)`, 1 = reserved.
    map: &'a mut [usize],
    /// Frames holding `map` itself.
    map_frames: PageFrameRegion,
    start: PageFrame,
    end: PageFrame,
    /// Index of the last page of the previous allocation.
    last_pos: usize,
    /// Bytes used in that page, 0 if it was used completely.
    last_offset: usize,
    /// Every frame index below this one is reserved.
    scan_hint: usize,
}

impl<'a> BootMemory<'a> {
    /// Bytes of bitmap needed for `pages` frames, padded to whole words.
    pub fn map_bytes(pages: usize) -> usize {
        ((pages + 7) / 8).align_up(mem::size_of::<usize>())
    }

    /// Whole pages of bitmap needed for `pages` frames.
    pub fn map_pages(pages: usize) -> usize {
        Self::map_bytes(pages).align_up(PAGE_SIZE) >> PAGE_ALIGN_BITS
    }

    fn map_words(pages: usize) -> usize {
        Self::map_bytes(pages) / mem::size_of::<usize>()
    }

    /// Start managing frames `[start, end)` with the bitmap in `storage`, every frame reserved.
    ///
    /// `map_start` is the frame where `storage` lives; it is only recorded so the bitmap pages can
    /// be released when boot allocation ends. The caller has to reserve them itself.
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or if `storage` is too small for the range.
    pub fn init(storage: &'a mut [usize], map_start: PageFrame, start: PageFrame, end: PageFrame) -> BootMemory<'a> {
        assert!(start <= end, "init_bootmem: inverted frame range {:?}..{:?}", start, end);
        let pages = end - start;
        let words = Self::map_words(pages);
        assert!(storage.len() >= words, "init_bootmem: bitmap needs {} words, got {}", words, storage.len());

        let map = &mut storage[..words];
        for word in map.iter_mut() {
            *word = !0;
        }
        debug!("[bootmem] frames {:#x}-{:#x}, bitmap of {} bytes at frame {:#x}",
            start.0, end.0, Self::map_bytes(pages), map_start.0);

        BootMemory {
            map,
            map_frames: PageFrameRegion::new(map_start, map_start + Self::map_pages(pages)),
            start,
            end,
            last_pos: 0,
            last_offset: 0,
            scan_hint: 0,
        }
    }

    /// Like [`BootMemory::init`], with the bitmap placed at `map_start` in the direct mapping.
    ///
    /// # Safety
    ///
    /// The bitmap frames must be directly mapped, unused by anything else and stay so for as
    /// long as boot allocation goes on.
    pub unsafe fn init_at(mapping: &DirectMapping, map_start: PageFrame, start: PageFrame, end: PageFrame) -> BootMemory<'static> {
        let words = Self::map_words(end.0.saturating_sub(start.0));
        let storage: &'static mut [usize] = if words == 0 {
            &mut []
        } else {
            let base = mapping.phys_to_virt(map_start.start_address());
            slice::from_raw_parts_mut(base.as_mut_ptr::<usize>(), words)
        };
        BootMemory::init(storage, map_start, start, end)
    }

    /// Size of the bitmap in bytes.
    pub fn map_size(&self) -> usize {
        self.map.len() * mem::size_of::<usize>()
    }

    pub fn map_frames(&self) -> PageFrameRegion {
        self.map_frames
    }

    /// The covered frames.
    pub fn frames(&self) -> PageFrameRegion {
        PageFrameRegion::new(self.start, self.end)
    }

    fn pages(&self) -> usize {
        self.end - self.start
    }

    /// Word and bit where the next fallback scan begins.
    pub fn search_cursor(&self) -> (usize, usize) {
        (self.scan_hint / BITS_PER_WORD, self.scan_hint % BITS_PER_WORD)
    }

    fn test_bit(&self, index: usize) -> bool {
        self.map[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    /// Set the bit and return its previous state.
    fn set_bit(&mut self, index: usize) -> bool {
        let word = &mut self.map[index / BITS_PER_WORD];
        let mask = 1 << (index % BITS_PER_WORD);
        let was = *word & mask != 0;
        *word |= mask;
        was
    }

    /// Clear the bit and return its previous state.
    fn clear_bit(&mut self, index: usize) -> bool {
        let word = &mut self.map[index / BITS_PER_WORD];
        let mask = 1 << (index % BITS_PER_WORD);
        let was = *word & mask != 0;
        *word &= !mask;
        was
    }

    pub fn is_reserved(&self, frame: PageFrame) -> bool {
        assert!(self.frames().contains(frame), "bootmem: frame {:#x} not covered", frame.0);
        self.test_bit(frame - self.start)
    }

    /// Number of frames currently free.
    pub fn free_pages(&self) -> usize {
        // padding bits past the last frame are never cleared
        self.map.iter().map(|word| word.count_zeros() as usize).sum()
    }

    fn check_range(&self, what: &str, first: PageFrame, last: PageFrame, addr: PhysAddr, size: u64) {
        assert!(
            first >= self.start && last <= self.end,
            "{}: {:p}+{:#x} outside of boot memory {:p}-{:p}",
            what, addr, size, self.start.start_address(), self.end.start_address()
        );
    }

    /// Mark every page touched by `[addr, addr + size)` reserved.
    ///
    /// Reserving a page twice is allowed, but logged.
    pub fn reserve(&mut self, addr: PhysAddr, size: u64) {
        assert!(size != 0, "reserve_bootmem: zero-sized reservation at {:p}", addr);
        let first = PageFrame::including(addr);
        let last = PageFrame::next_above(PhysAddr(addr.0.saturating_add(size)));
        self.check_range("reserve_bootmem", first, last, addr, size);

        for index in (first - self.start)..(last - self.start) {
            if self.set_bit(index) {
                warn!("[bootmem] hm, page {:p} reserved twice.", (self.start + index).start_address());
            }
        }
    }

    /// Mark every page entirely inside `[addr, addr + size)` free.
    ///
    /// Partially covered pages at either end stay reserved.
    pub fn free(&mut self, addr: PhysAddr, size: u64) {
        assert!(size != 0, "free_bootmem: zero-sized range at {:p}", addr);
        let first = PageFrame::next_above(addr);
        let last = PageFrame::including(PhysAddr(addr.0.saturating_add(size)));
        if first >= last {
            return;
        }
        self.check_range("free_bootmem", first, last, addr, size);

        let (from, to) = (first - self.start, last - self.start);
        for index in from..to {
            if !self.clear_bit(index) {
                panic!("free_bootmem: page {:p} freed twice", (self.start + index).start_address());
            }
        }
        self.scan_hint = cmp::min(self.scan_hint, from);
    }

    /// Allocate `size` bytes aligned to `align`, preferably at or above `goal`.
    ///
    /// `align` must be zero (no alignment) or a power of two. The memory is not cleared.
    ///
    /// # Panics
    ///
    /// Panics when no free run is large enough.
    pub fn alloc(&mut self, size: usize, align: usize, goal: PhysAddr) -> PhysAddr {
        match self.try_alloc(size, align, goal) {
            Some(addr) => addr,
            None => panic!("bootmem alloc of {} bytes failed!", size),
        }
    }

    pub fn try_alloc(&mut self, size: usize, align: usize, goal: PhysAddr) -> Option<PhysAddr> {
        assert!(size != 0, "alloc_bootmem: zero-sized allocation");
        assert!(align == 0 || align.is_power_of_two(), "alloc_bootmem: alignment {:#x} is not a power of two", align);

        let base = self.start.start_address().0;
        let pages = self.pages();

        // first index whose address satisfies an alignment above page size
        let offset = if align > PAGE_SIZE && base & (align as u64 - 1) != 0 {
            ((align as u64 - (base & (align as u64 - 1))) >> PAGE_ALIGN_BITS) as usize
        } else {
            0
        };
        let step = cmp::max(align >> PAGE_ALIGN_BITS, 1);
        let area_pages = (size + PAGE_SIZE - 1) >> PAGE_ALIGN_BITS;

        // both scans stay on the lattice `offset + k * step`, and nothing below the hint is free
        let fallback = if self.scan_hint > offset {
            offset + (self.scan_hint - offset).align_up(step)
        } else {
            offset
        };
        // never below the goal, so sub-page alignments start on the page after it
        let preferred = if goal.0 > base && PageFrame::including(goal) < self.end {
            let goal_align = cmp::max(align, PAGE_SIZE) as u64;
            cmp::max(((goal.0 - base).align_up(goal_align) >> PAGE_ALIGN_BITS) as usize + offset, fallback)
        } else {
            fallback
        };
        let start = self
            .find_free_run(preferred, pages, area_pages, step)
            .or_else(|| if preferred > fallback { self.find_free_run(fallback, pages, area_pages, step) } else { None })?;

        let (addr, first_new, new_pages) = self.place(start, size, align, area_pages, base, goal);
        for index in first_new..first_new + new_pages {
            if self.set_bit(index) {
                panic!("alloc_bootmem: page {:p} already reserved", (self.start + index).start_address());
            }
        }
        self.advance_scan_hint();

        let addr = PhysAddr(addr);
        trace!("[bootmem] alloc {:#x} bytes align {:#x} goal {:p} -> {:p}", size, align, goal, addr);
        Some(addr)
    }

    /// Decide where inside the free run at `start` the allocation goes.
    ///
    /// Returns the address and the pages that have to be marked reserved.
    fn place(&mut self, start: usize, size: usize, align: usize, area_pages: usize, base: u64, goal: PhysAddr) -> (u64, usize, usize) {
        let packed_offset = self.last_offset.align_up(align);
        let packed_addr = base + ((self.last_pos as u64) << PAGE_ALIGN_BITS) + packed_offset as u64;
        if align <= PAGE_SIZE
            && self.last_offset != 0
            && self.last_pos + 1 == start
            && packed_offset < PAGE_SIZE
            && packed_addr >= goal.0
        {
            // continue in the partially used page before the run
            let offset = packed_offset;
            let remaining = PAGE_SIZE - offset;
            let addr = packed_addr;
            if size < remaining {
                self.last_offset = offset + size;
                (addr, start, 0)
            } else {
                let rest = size - remaining;
                let pages = (rest + PAGE_SIZE - 1) >> PAGE_ALIGN_BITS;
                self.last_pos = start + pages - 1;
                self.last_offset = rest & (PAGE_SIZE - 1);
                (addr, start, pages)
            }
        } else {
            self.last_pos = start + area_pages - 1;
            self.last_offset = size & (PAGE_SIZE - 1);
            (base + ((start as u64) << PAGE_ALIGN_BITS), start, area_pages)
        }
    }

    /// First index `from + k * step` starting a run of `area_pages` free frames below `limit`.
    fn find_free_run(&self, from: usize, limit: usize, area_pages: usize, step: usize) -> Option<usize> {
        let mut index = from;
        while index + area_pages <= limit {
            match (index..index + area_pages).find(|&i| self.test_bit(i)) {
                None => return Some(index),
                Some(_) => index += step,
            }
        }
        None
    }

    fn advance_scan_hint(&mut self) {
        let pages = self.pages();
        while self.scan_hint < pages {
            let (word, bit) = self.search_cursor();
            if bit == 0 && self.map[word] == !0 {
                self.scan_hint += BITS_PER_WORD;
            } else if self.test_bit(self.scan_hint) {
                self.scan_hint += 1;
            } else {
                break;
            }
        }
        self.scan_hint = cmp::min(self.scan_hint, pages);
    }

    /// End boot allocation and pass all free frames, plus the bitmap's own frames, to `allocator`.
    ///
    /// Returns the number of frames released.
    pub fn retire<A: PageAllocator + ?Sized>(self, allocator: &mut A) -> usize {
        let mut released = 0;
        let mut run: Option<usize> = None;
        for index in 0..=self.pages() {
            let free = index < self.pages() && !self.test_bit(index);
            match (run, free) {
                (None, true) => run = Some(index),
                (Some(first), false) => {
                    allocator.free_frames(PageFrameRegion::new(self.start + first, self.start + index));
                    released += index - first;
                    run = None;
                }
                _ => {}
            }
        }
        if !self.map_frames.is_empty() {
            allocator.free_frames(self.map_frames);
            released += self.map_frames.length();
        }
        info!("[bootmem] released {} pages to the page allocator", released);
        released
    }
}
