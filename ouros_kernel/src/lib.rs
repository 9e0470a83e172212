#![cfg_attr(all(not(test), target_os = "none"), no_std)]
//! Early boot of the kernel on i386: bring up logging, build the physical memory map and the
//! boot allocator from what the Multiboot loader hands over.

#[macro_use]
extern crate log;

pub mod cmdline;
pub mod setup;

mod diagnostics;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod logger;
#[cfg(target_os = "none")]
mod panic;

#[cfg(target_os = "none")]
mod entry {
    use bare_metal::{PhysAddr, VirtAddr};
    use kmem::pfn::MemoryConfig;
    use multiboot::{MultibootInfo, BOOTLOADER_MAGIC};

    use crate::cmdline::BootOptions;
    use crate::diagnostics;
    use crate::logger;
    use crate::setup::{self, BitmapStorage, BootContext, BootParams};

    extern "C" {
        /// End of the kernel image, provided by the linker script.
        static _end: u8;
    }

    /// This is the Rust entry point that is called by the assembly boot code once paging maps low
    /// memory at `PAGE_OFFSET`.
    #[no_mangle]
    pub extern "C" fn kernel_main(multiboot_magic: u32, multiboot_info: u32) -> ! {
        if logger::init(log::LevelFilter::Info).is_err() {
            panic!("logger installed twice");
        }
        if multiboot_magic != BOOTLOADER_MAGIC {
            panic!("not booted by a Multiboot loader (magic {:#x})", multiboot_magic);
        }

        let config = MemoryConfig::default();
        let mapping = config.layout.direct_mapping();
        let kernel_end = mapping.virt_to_phys(VirtAddr(unsafe { &_end as *const u8 as usize }));

        // SAFETY: the loader's data sits in low memory, which the boot code mapped at PAGE_OFFSET
        let params = unsafe {
            let info = MultibootInfo::from_addr(mapping.phys_to_virt(PhysAddr(u64::from(multiboot_info))));
            BootParams::from_multiboot(info, &mapping, kernel_end)
        };
        let options = BootOptions::parse(params.cmdline);
        logger::set_level(options.log_level);
        info!("[setup] command line: {}", params.cmdline);

        let (map, source) = match setup::setup_memory_region(&params, &options) {
            Ok(result) => result,
            Err(err) => panic!("{}", err),
        };
        // SAFETY: everything above the kernel image is unused at this point
        let storage = unsafe { BitmapStorage::mapped(mapping) };
        let context = BootContext::setup_memory(map, source, &params, &options, config, storage);
        diagnostics::print_zones(&context.node());

        info!("[setup] early memory setup done");
        unsafe { bare_metal::cpu::hang() }
    }
}
