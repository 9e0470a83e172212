//! Module responsible for displaying diagnostic messages on startup.

use kmem::e820::{MemoryRegion, RegionKind};
use kmem::pfn::{pages_to_mb, PageFrameRange};
use kmem::zone::NodeDescriptor;

/// Print the firmware map as it was reported, before any cleanup.
pub fn show_memory_map(raw: &[MemoryRegion]) {
    debug!("[e820] firmware memory map:");
    debug!("{: ^10} {: ^18} {: ^18}", "Type", "Base", "Length");
    let mut available = 0u64;
    for region in raw {
        let type_ch = match region.kind {
            RegionKind::Usable => 'A',
            RegionKind::AcpiReclaimable => 'C',
            RegionKind::AcpiNvs => 'N',
            RegionKind::Reserved => 'R',
            RegionKind::Other(_) => '?',
        };
        debug!("{: ^10} {:016x} {:016x}", type_ch, region.start, region.length);
        if region.is_usable() {
            available = available.saturating_add(region.length);
        }
    }
    debug!(" Available: {} MiB", available >> 20);
}

pub fn print_frame_summary(frames: &PageFrameRange) {
    info!("[setup] kernel image ends before frame {:#x}", frames.start_pfn.0);
    info!("[setup] low memory frames {:#x}-{:#x}, high memory frames {:#x}-{:#x}",
        0, frames.max_low_pfn.0, frames.highstart_pfn.0, frames.highend_pfn.0);
}

pub fn print_zones(node: &NodeDescriptor) {
    info!("[zone] node {}: {} pages starting at frame {:#x}", node.node_id, node.node_size, node.node_start_pfn.0);
    for zone in node.zones() {
        info!("[zone]   {:<7} {:>6} pages ({}MB), {} free", zone.name(), zone.frame_count(),
            pages_to_mb(zone.frame_count()), zone.free_pages);
    }
}
