//! Early memory setup: from the firmware memory map to a working boot allocator.

use bare_metal::{PhysAddr, PhysAddrRange, VirtAddr};
use kmem::bootmem::BootMemory;
use kmem::e820::copy::{compose, CompositeError, LegacyHints, MapSource};
use kmem::e820::reader::FirmwareMap;
use kmem::e820::{MemoryMap, HIGH_MEMORY};
use kmem::mapping::DirectMapping;
use kmem::pfn::{MemoryConfig, PageFrameRange};
use kmem::physical::PageFrameRegion;
use kmem::zone::{NodeDescriptor, PageAllocator};
use kmem::PAGE_SIZE;
use multiboot::MultibootInfo;

use core::{cmp, ptr};

use crate::cmdline::BootOptions;
use crate::diagnostics;

/// Alignment of small boot allocations, one cache line.
pub const SMP_CACHE_BYTES: usize = 32;

/// Default goal of boot allocations, keeping the ISA DMA area free for drivers that need it.
pub const MAX_DMA_ADDRESS: PhysAddr = PhysAddr(16 << 20);

/// Everything the memory setup needs to know from the boot loader.
#[derive(Clone, Copy)]
pub struct BootParams<'a> {
    pub firmware_map: FirmwareMap<'a>,
    pub hints: LegacyHints,
    /// First physical address after the kernel image.
    pub kernel_end: PhysAddr,
    pub ramdisk: Option<PhysAddrRange>,
    pub cmdline: &'a str,
}

impl<'a> BootParams<'a> {
    /// Gather the parameters from a Multiboot information block. The first module is taken to be
    /// the initial ramdisk.
    ///
    /// # Safety
    ///
    /// Everything the block points to must be reachable through `mapping` and stay untouched for `'a`.
    pub unsafe fn from_multiboot(info: &MultibootInfo, mapping: &DirectMapping, kernel_end: PhysAddr) -> BootParams<'a> {
        let to_virt = |addr: PhysAddr| mapping.phys_to_virt(addr);
        let firmware_map = match info.memory_map(to_virt) {
            Some(map) => FirmwareMap::BootLoader(map),
            None => FirmwareMap::Absent,
        };
        let hints = info
            .memory_hints()
            .map(|hints| LegacyHints { ext_mem_k: hints.upper_kib, alt_mem_k: 0 })
            .unwrap_or_default();
        BootParams {
            firmware_map,
            hints,
            kernel_end,
            ramdisk: info.modules(to_virt).first().map(|module| module.range()),
            cmdline: info.cmdline(to_virt).unwrap_or(""),
        }
    }
}

/// Where the boot bitmap lives.
pub enum BitmapStorage<'m> {
    /// In the frames right after the kernel image, or after a ramdisk loaded there, reached
    /// through the direct mapping.
    Mapped(DirectMapping),
    /// In a buffer provided by the caller.
    Buffer(&'m mut [usize]),
}

impl<'m> BitmapStorage<'m> {
    /// # Safety
    ///
    /// The low memory after the kernel image and after the ramdisk must be directly mapped by
    /// `mapping`, and the frames picked for the bitmap must be unused.
    pub unsafe fn mapped(mapping: DirectMapping) -> BitmapStorage<'m> {
        BitmapStorage::Mapped(mapping)
    }
}

/// Read the firmware map, clean it up and install it as the kernel memory map.
pub fn setup_memory_region(params: &BootParams, options: &BootOptions) -> Result<(MemoryMap, MapSource), CompositeError> {
    let raw = params.firmware_map.read();
    diagnostics::show_memory_map(&raw);

    let (mut map, source) = compose(raw, params.hints)?;
    if let Some(limit) = options.mem_limit {
        map.limit_regions(limit);
    }
    info!("[setup] BIOS-provided physical RAM map:");
    map.print(source.name());
    Ok((map, source))
}

/// The state of memory management between reading the memory map and starting the page allocator.
pub struct BootContext<'m> {
    map: MemoryMap,
    source: MapSource,
    config: MemoryConfig,
    frames: PageFrameRange,
    bootmem: BootMemory<'m>,
    ramdisk: Option<PhysAddrRange>,
}

impl<'m> BootContext<'m> {
    /// Split memory into low and high memory and bring up the boot allocator for low memory.
    ///
    /// All usable low memory starts out free except the first page, the kernel image, the bitmap
    /// and the ramdisk. The bitmap follows the kernel image, or the ramdisk if that was loaded
    /// right behind the image. A ramdisk reaching beyond low memory is dropped.
    ///
    /// # Panics
    ///
    /// Panics when there is no usable low memory after the kernel image.
    pub fn setup_memory(
        map: MemoryMap,
        source: MapSource,
        params: &BootParams,
        options: &BootOptions,
        config: MemoryConfig,
        storage: BitmapStorage<'m>,
    ) -> BootContext<'m> {
        let frames = PageFrameRange::analyze(&map, params.kernel_end, options.highmem_pages, &config);
        diagnostics::print_frame_summary(&frames);

        let low_end = frames.max_low_pfn.start_address();
        let ramdisk = params.ramdisk.filter(|ramdisk| !ramdisk.is_empty()).and_then(|ramdisk| {
            if ramdisk.end() <= low_end {
                Some(ramdisk)
            } else {
                error!("[setup] initrd extends beyond end of memory ({:p} > {:p})", ramdisk.end(), low_end);
                error!("[setup] disabling initrd");
                None
            }
        });

        // the bitmap goes right after the kernel image unless a ramdisk was loaded there
        let bitmap_pages = BootMemory::map_pages(frames.max_low_pfn.0);
        let mut map_start = frames.start_pfn;
        if let Some(ramdisk) = ramdisk {
            let disk = PageFrameRegion::new_including(&ramdisk);
            if !disk.intersection(&PageFrameRegion::new(map_start, map_start + bitmap_pages)).is_empty() {
                map_start = cmp::max(map_start, disk.end);
            }
        }
        assert!(
            map_start + bitmap_pages <= frames.max_low_pfn,
            "[setup] no room for the boot bitmap: it would start at frame {:#x}, low memory ends at {:#x}",
            map_start.0, frames.max_low_pfn.0
        );

        let low = frames.lowmem();
        let mut bootmem = match storage {
            // SAFETY: `BitmapStorage::mapped` requires the frames picked for the bitmap to be mapped and unused.
            BitmapStorage::Mapped(mapping) => unsafe { BootMemory::init_at(&mapping, map_start, low.start, low.end) },
            BitmapStorage::Buffer(buffer) => BootMemory::init(buffer, map_start, low.start, low.end),
        };

        register_low_pages(&mut bootmem, &map, &frames);

        // the kernel image, loaded at 1 MiB
        let image_end = frames.start_pfn.start_address();
        if image_end > PhysAddr(HIGH_MEMORY) {
            bootmem.reserve(PhysAddr(HIGH_MEMORY), image_end - PhysAddr(HIGH_MEMORY));
        }
        let bitmap = bootmem.map_frames();
        bootmem.reserve(bitmap.start_address(), (bitmap.length() * PAGE_SIZE) as u64);
        // BIOS data, kept for warm reboots
        bootmem.reserve(PhysAddr(0), PAGE_SIZE as u64);

        if let Some(ramdisk) = ramdisk {
            bootmem.reserve(ramdisk.start, ramdisk.length);
        }

        info!("[setup] {} pages free for boot allocation", bootmem.free_pages());
        BootContext { map, source, config, frames, bootmem, ramdisk }
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn source(&self) -> MapSource {
        self.source
    }

    pub fn frames(&self) -> &PageFrameRange {
        &self.frames
    }

    /// The ramdisk, if it was usable.
    pub fn ramdisk(&self) -> Option<PhysAddrRange> {
        self.ramdisk
    }

    pub fn bootmem(&mut self) -> &mut BootMemory<'m> {
        &mut self.bootmem
    }

    /// The node layout the page allocator will manage.
    pub fn node(&self) -> NodeDescriptor {
        NodeDescriptor::contiguous(0, &self.frames, &self.config)
    }

    /// Allocate cleared memory for a boot time structure, above the ISA DMA area if possible.
    ///
    /// # Safety
    ///
    /// `mapping` must map the low memory managed by the boot allocator.
    pub unsafe fn alloc_bootmem(&mut self, mapping: &DirectMapping, size: usize) -> VirtAddr {
        self.alloc_zeroed(mapping, size, SMP_CACHE_BYTES, MAX_DMA_ADDRESS)
    }

    /// Like [`BootContext::alloc_bootmem`], in whole pages.
    ///
    /// # Safety
    ///
    /// See [`BootContext::alloc_bootmem`].
    pub unsafe fn alloc_bootmem_pages(&mut self, mapping: &DirectMapping, size: usize) -> VirtAddr {
        self.alloc_zeroed(mapping, size, PAGE_SIZE, MAX_DMA_ADDRESS)
    }

    /// Like [`BootContext::alloc_bootmem`], as low as possible.
    ///
    /// # Safety
    ///
    /// See [`BootContext::alloc_bootmem`].
    pub unsafe fn alloc_bootmem_low(&mut self, mapping: &DirectMapping, size: usize) -> VirtAddr {
        self.alloc_zeroed(mapping, size, SMP_CACHE_BYTES, PhysAddr(0))
    }

    unsafe fn alloc_zeroed(&mut self, mapping: &DirectMapping, size: usize, align: usize, goal: PhysAddr) -> VirtAddr {
        let addr = mapping.phys_to_virt(self.bootmem.alloc(size, align, goal));
        ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, size);
        addr
    }

    /// End boot allocation and give all free memory to `allocator`.
    ///
    /// The allocator first learns the frame layout, then receives the free low memory, the
    /// bitmap pages and finally usable high memory. Returns the node with its zones' free
    /// page counts filled in.
    pub fn hand_off<A: PageAllocator>(self, allocator: &mut A) -> NodeDescriptor {
        let mut node = self.node();
        allocator.hand_off(&self.frames, &node);

        let mut sink = Accounting { allocator, node: &mut node, released: 0 };
        self.bootmem.retire(&mut sink);

        let highmem = self.frames.highmem();
        for region in self.map.usable_frames() {
            let high = region.intersection(&highmem);
            if !high.is_empty() {
                sink.free_frames(high);
            }
        }
        info!("[setup] handed {} pages to the page allocator", sink.released);
        diagnostics::print_zones(&node);
        node
    }
}

/// Free every whole page of usable low memory.
fn register_low_pages(bootmem: &mut BootMemory, map: &MemoryMap, frames: &PageFrameRange) {
    let low = frames.lowmem();
    for region in map.usable_frames() {
        let usable = region.intersection(&low);
        if !usable.is_empty() {
            bootmem.free(usable.start_address(), (usable.length() * PAGE_SIZE) as u64);
        }
    }
}

/// Forwards released frames and counts them per zone.
struct Accounting<'a, A> {
    allocator: &'a mut A,
    node: &'a mut NodeDescriptor,
    released: usize,
}

impl<'a, A: PageAllocator> PageAllocator for Accounting<'a, A> {
    fn hand_off(&mut self, frames: &PageFrameRange, node: &NodeDescriptor) {
        self.allocator.hand_off(frames, node);
    }

    fn free_frames(&mut self, region: PageFrameRegion) {
        self.node.account_free(region);
        self.released += region.length();
        self.allocator.free_frames(region);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kmem::e820::reader::BiosMapEntry;
    use kmem::physical::PageFrame;
    use kmem::zone::ZoneKind;
    use std::vec;
    use std::vec::Vec;

    const MB: u64 = 1 << 20;

    fn params<'a>(table: &'a [BiosMapEntry], kernel_end: u64, ramdisk: Option<PhysAddrRange>) -> BootParams<'a> {
        BootParams {
            firmware_map: FirmwareMap::Legacy(table),
            hints: LegacyHints { ext_mem_k: 15 * 1024, alt_mem_k: 0 },
            kernel_end: PhysAddr(kernel_end),
            ramdisk,
            cmdline: "",
        }
    }

    fn pc_128m() -> Vec<BiosMapEntry> {
        vec![
            BiosMapEntry::new(0, 0x9FC00, 1),
            BiosMapEntry::new(0x9FC00, 0x400, 2),
            BiosMapEntry::new(0xE8000, 0x18000, 2),
            BiosMapEntry::new(0x100000, 127 * MB, 1),
            BiosMapEntry::new(0xFFFC0000, 0x40000, 2),
        ]
    }

    fn config(highmem: bool) -> MemoryConfig {
        MemoryConfig { highmem, ..MemoryConfig::default() }
    }

    fn bitmap_for(frames: usize) -> Vec<usize> {
        vec![0; BootMemory::map_bytes(frames) / core::mem::size_of::<usize>()]
    }

    #[derive(Default)]
    struct Recorder {
        layout: Option<(PageFrameRange, usize)>,
        freed: Vec<PageFrameRegion>,
    }

    impl PageAllocator for Recorder {
        fn hand_off(&mut self, frames: &PageFrameRange, node: &NodeDescriptor) {
            assert!(self.freed.is_empty(), "layout must arrive before frames");
            self.layout = Some((*frames, node.node_size));
        }

        fn free_frames(&mut self, region: PageFrameRegion) {
            self.freed.push(region);
        }
    }

    #[test]
    fn memory_region_setup_cleans_firmware_map() {
        let table = pc_128m();
        let options = BootOptions::default();
        let (map, source) = setup_memory_region(&params(&table, 0x40_0000, None), &options).unwrap();
        assert_eq!(source, MapSource::E820);
        assert_eq!(map.len(), 5);
        assert_eq!(map.regions()[3].start, 0x100000);
    }

    #[test]
    fn memory_region_setup_honours_mem_limit() {
        let table = pc_128m();
        let options = BootOptions { mem_limit: Some(64 * MB), ..BootOptions::default() };
        let (map, _) = setup_memory_region(&params(&table, 0x40_0000, None), &options).unwrap();
        assert_eq!(map.regions()[3].end(), 64 * MB);
    }

    #[test]
    fn memory_region_setup_falls_back_to_hints() {
        let options = BootOptions::default();
        let p = BootParams { firmware_map: FirmwareMap::Absent, ..params(&[], 0x40_0000, None) };
        let (map, source) = setup_memory_region(&p, &options).unwrap();
        assert_eq!(source, MapSource::Bios88);
        assert_eq!(map.regions()[1].start, 0x100000);
        assert_eq!(map.regions()[1].length, 15 * MB);
    }

    #[test]
    fn memory_region_setup_fails_without_memory() {
        let options = BootOptions::default();
        let p = BootParams { firmware_map: FirmwareMap::Absent, hints: LegacyHints::default(), ..params(&[], 0, None) };
        // the fallback always describes conventional memory
        assert!(setup_memory_region(&p, &options).is_ok());

        let table = [BiosMapEntry::new(0xA0000, 0x10000, 1), BiosMapEntry::new(0xB0000, 0x10000, 1)];
        let p = params(&table, 0, None);
        assert_eq!(setup_memory_region(&p, &options).err(), Some(CompositeError::NoMemory));
    }

    fn boot<'m>(table: &[BiosMapEntry], ramdisk: Option<PhysAddrRange>, storage: &'m mut Vec<usize>) -> BootContext<'m> {
        boot_at(table, 0x40_0000, ramdisk, storage)
    }

    fn boot_at<'m>(table: &[BiosMapEntry], kernel_end: u64, ramdisk: Option<PhysAddrRange>, storage: &'m mut Vec<usize>) -> BootContext<'m> {
        let p = params(table, kernel_end, ramdisk);
        let options = BootOptions::default();
        let (map, source) = setup_memory_region(&p, &options).unwrap();
        BootContext::setup_memory(map, source, &p, &options, config(true), BitmapStorage::Buffer(storage))
    }

    #[test]
    fn setup_memory_reserves_kernel_bitmap_and_page_zero() {
        let table = pc_128m();
        let mut storage = bitmap_for(0x8000);
        let mut ctx = boot(&table, None, &mut storage);

        assert_eq!(ctx.frames().start_pfn, PageFrame(0x400));
        assert_eq!(ctx.frames().max_low_pfn, PageFrame(0x8000));
        let bm = ctx.bootmem();
        assert!(bm.is_reserved(PageFrame(0)));
        assert!(!bm.is_reserved(PageFrame(1)));
        assert!(!bm.is_reserved(PageFrame(0x9E)));
        // partial page below the EBDA and the legacy hole
        assert!(bm.is_reserved(PageFrame(0x9F)));
        assert!(bm.is_reserved(PageFrame(0xA0)));
        // kernel image and the single bitmap page behind it
        assert!(bm.is_reserved(PageFrame(0x100)));
        assert!(bm.is_reserved(PageFrame(0x400)));
        assert!(!bm.is_reserved(PageFrame(0x401)));
        assert_eq!(bm.free_pages(), (0x9F - 1) + (0x8000 - 0x401));
    }

    #[test]
    fn ramdisk_in_low_memory_is_reserved() {
        let table = pc_128m();
        let mut storage = bitmap_for(0x8000);
        let ramdisk = PhysAddrRange::new(PhysAddr(0x80_0000), 0x20_0800);
        let mut ctx = boot(&table, Some(ramdisk), &mut storage);
        assert_eq!(ctx.ramdisk(), Some(ramdisk));
        assert!(ctx.bootmem().is_reserved(PageFrame(0x800)));
        assert!(ctx.bootmem().is_reserved(PageFrame(0xA00)));
        assert!(!ctx.bootmem().is_reserved(PageFrame(0xA01)));
    }

    #[test]
    fn bitmap_is_reserved_below_1m() {
        let table = pc_128m();
        let mut storage = bitmap_for(0x8000);
        let mut ctx = boot_at(&table, 0x8_0000, None, &mut storage);
        let bm = ctx.bootmem();
        assert_eq!(bm.map_frames(), PageFrameRegion::new(PageFrame(0x80), PageFrame(0x81)));
        assert!(bm.is_reserved(PageFrame(0x80)));
        assert!(!bm.is_reserved(PageFrame(0x81)));
        for _ in 0..0x100 {
            let addr = bm.alloc(PAGE_SIZE, PAGE_SIZE, PhysAddr(0));
            assert_ne!(PageFrame::including(addr), PageFrame(0x80));
        }
    }

    #[test]
    fn bitmap_moves_past_ramdisk_behind_kernel() {
        let table = pc_128m();
        let mut storage = bitmap_for(0x8000);
        let ramdisk = PhysAddrRange::new(PhysAddr(0x40_0000), MB);
        let mut ctx = boot(&table, Some(ramdisk), &mut storage);
        assert_eq!(ctx.ramdisk(), Some(ramdisk));
        let bm = ctx.bootmem();
        assert_eq!(bm.map_frames(), PageFrameRegion::new(PageFrame(0x500), PageFrame(0x501)));
        assert!(bm.is_reserved(PageFrame(0x400)));
        assert!(bm.is_reserved(PageFrame(0x4FF)));
        assert!(bm.is_reserved(PageFrame(0x500)));
        assert!(!bm.is_reserved(PageFrame(0x501)));
    }

    #[test]
    fn ramdisk_beyond_low_memory_is_dropped() {
        let table = pc_128m();
        let mut storage = bitmap_for(0x8000);
        let ramdisk = PhysAddrRange::new(PhysAddr(127 * MB), 2 * MB);
        let mut ctx = boot(&table, Some(ramdisk), &mut storage);
        assert_eq!(ctx.ramdisk(), None);
        assert!(!ctx.bootmem().is_reserved(PageFrame::including(PhysAddr(127 * MB))));
    }

    #[test]
    #[should_panic(expected = "no room for the boot bitmap")]
    fn kernel_above_low_memory_is_fatal() {
        let table = [BiosMapEntry::new(0, 0x9F000, 1), BiosMapEntry::new(0x100000, 0x100000, 1)];
        let mut storage = bitmap_for(0x200);
        let p = params(&table, 0x40_0000, None);
        let options = BootOptions::default();
        let (map, source) = setup_memory_region(&p, &options).unwrap();
        BootContext::setup_memory(map, source, &p, &options, config(true), BitmapStorage::Buffer(&mut storage));
    }

    #[test]
    fn boot_allocations_are_zeroed_and_above_dma() {
        let table = pc_128m();
        let mut storage = bitmap_for(0x8000);
        let mut ctx = boot(&table, None, &mut storage);

        // back the first 32 MiB by a buffer so the allocator can clear memory
        let mut backing = vec![0xAAu8; (32 * MB) as usize];
        let mapping = DirectMapping::new(VirtAddr(backing.as_mut_ptr() as usize), PhysAddr(0), 32 * MB);
        let a = unsafe { ctx.alloc_bootmem(&mapping, 100) };
        let b = unsafe { ctx.alloc_bootmem_low(&mapping, 100) };
        let c = unsafe { ctx.alloc_bootmem_pages(&mapping, 0x2000) };

        assert_eq!(mapping.virt_to_phys(a), MAX_DMA_ADDRESS);
        assert!(mapping.virt_to_phys(b) < PhysAddr(0x9F000));
        assert_eq!(mapping.virt_to_phys(c).0 % PAGE_SIZE as u64, 0);
        assert!(mapping.virt_to_phys(c) > MAX_DMA_ADDRESS);

        let offset = mapping.virt_to_phys(a).0 as usize;
        assert!(backing[offset..offset + 100].iter().all(|&byte| byte == 0));
        assert_eq!(backing[offset + 100], 0xAA);
    }

    #[test]
    fn hand_off_releases_low_and_high_memory() {
        let table = [
            BiosMapEntry::new(0, 0x9F000, 1),
            BiosMapEntry::new(0x100000, 1023 * MB, 1),
            BiosMapEntry::new(0xFEC00000, 0x1000, 2),
        ];
        let mut storage = bitmap_for(0x38000);
        let ctx = boot(&table, None, &mut storage);
        assert_eq!(ctx.frames().max_low_pfn, PageFrame(0x38000));
        assert_eq!(ctx.frames().max_pfn, PageFrame(0x40000));

        let mut recorder = Recorder::default();
        let node = ctx.hand_off(&mut recorder);

        let (frames, node_size) = recorder.layout.unwrap();
        assert_eq!(frames.highstart_pfn, PageFrame(0x38000));
        assert_eq!(node_size, 0x40000);

        // free low memory, then the 7 bitmap pages, then high memory
        assert_eq!(recorder.freed[0], PageFrameRegion::new(PageFrame(1), PageFrame(0x9F)));
        assert_eq!(recorder.freed[1], PageFrameRegion::new(PageFrame(0x407), PageFrame(0x38000)));
        assert_eq!(recorder.freed[2], PageFrameRegion::new(PageFrame(0x400), PageFrame(0x407)));
        assert_eq!(recorder.freed[3], PageFrameRegion::new(PageFrame(0x38000), PageFrame(0x40000)));
        assert_eq!(recorder.freed.len(), 4);

        assert_eq!(node.zone(ZoneKind::Dma).free_pages, (0x9F - 1) + (0x1000 - 0x400));
        assert_eq!(node.zone(ZoneKind::Normal).free_pages, 0x38000 - 0x1000);
        assert_eq!(node.zone(ZoneKind::HighMem).free_pages, 0x8000);
    }

    #[test]
    fn hand_off_without_highmem_support_keeps_high_frames() {
        let table = [BiosMapEntry::new(0, 0x9F000, 1), BiosMapEntry::new(0x100000, 1023 * MB, 1)];
        let mut storage = bitmap_for(0x38000);
        let p = params(&table, 0x40_0000, None);
        let options = BootOptions::default();
        let (map, source) = setup_memory_region(&p, &options).unwrap();
        let ctx = BootContext::setup_memory(map, source, &p, &options, config(false), BitmapStorage::Buffer(&mut storage));
        assert_eq!(ctx.frames().max_pfn, PageFrame(0x38000));

        let mut recorder = Recorder::default();
        let node = ctx.hand_off(&mut recorder);
        assert!(recorder.freed.iter().all(|region| region.end <= PageFrame(0x38000)));
        assert_eq!(node.zone(ZoneKind::HighMem).free_pages, 0);
    }
}
