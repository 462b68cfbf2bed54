//! SlopOS kernel binary
//!
//! Entry shim for the boot loader: copies the boot protocol structures
//! into a [`BootContext`] and hands control to the phased orchestrator.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod entry {
    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::info::MemoryRegionKind;
    use bootloader_api::{entry_point, BootInfo};
    use slopos_kernel::bootstrap::{self, BootContext, BootRegionKind, MAX_BOOT_REGIONS};
    use slopos_kernel::mm;
    use slopos_kernel::video::FbInfo;

    /// Map all physical memory into the higher half (the HHDM) and give
    /// the kernel a roomy boot stack.
    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config.kernel_stack_size = 80 * 1024;
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        let hhdm_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("boot loader must map physical memory");
        // The HHDM is needed below to resolve the framebuffer's physical
        // base through the loader's page tables.
        mm::set_hhdm_offset(hhdm_offset);

        let mut regions = [(0u64, 0u64, BootRegionKind::Unknown); MAX_BOOT_REGIONS];
        let mut region_count = 0;
        for region in boot_info.memory_regions.iter() {
            if region_count == MAX_BOOT_REGIONS {
                break;
            }
            if region.end <= region.start {
                continue;
            }
            let kind = match region.kind {
                MemoryRegionKind::Usable => BootRegionKind::Usable,
                MemoryRegionKind::Bootloader => BootRegionKind::Bootloader,
                _ => BootRegionKind::Unknown,
            };
            regions[region_count] = (region.start, region.end - region.start, kind);
            region_count += 1;
        }

        let framebuffer = boot_info.framebuffer.as_ref().into_option().and_then(|fb| {
            let info = fb.info();
            let virt = fb.buffer().as_ptr() as u64;
            let pml4 = mm::page_table::current_pml4();
            mm::page_table::virt_to_phys(pml4, virt).map(|phys_base| FbInfo {
                width: info.width as u64,
                height: info.height as u64,
                pitch: (info.stride * info.bytes_per_pixel) as u64,
                bpp: (info.bytes_per_pixel * 8) as u64,
                phys_base,
            })
        });

        let ctx = BootContext {
            hhdm_offset,
            kernel_phys_base: boot_info.kernel_addr,
            kernel_len: boot_info.kernel_len,
            regions,
            region_count,
            rsdp: boot_info.rsdp_addr.into_option(),
            framebuffer,
        };

        // The boot protocol carries no kernel command line; defaults rule.
        bootstrap::run(ctx, None)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only means something on bare metal; the host
    // build exists so `cargo check`/`cargo test` cover the whole crate.
}
