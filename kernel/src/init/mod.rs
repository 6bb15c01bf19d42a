// kernel/src/init/mod.rs
//
// Boot orchestration.  Order matters and is the only place it is
// encoded: IDT → framebuffer → direct map → bootmem → mem_map → buddy
// → slab → task layer → self-tests.

pub mod devices;
pub mod memory;

use bootloader_api::BootInfo;
use x86_64::VirtAddr;

use crate::{
    framebuffer::{init_global_framebuffer, Framebuffer},
    process, serial_println,
};

pub fn boot(boot_info: &'static mut BootInfo) -> ! {
    devices::init_idt();

    // ── Framebuffer (optional; serial is the primary console) ──────
    if let Some(fb) = boot_info.framebuffer.as_mut() {
        let info = fb.info();
        let buffer = fb.buffer_mut();
        init_global_framebuffer(Framebuffer::new(
            buffer,
            info.width,
            info.height,
            info.stride,
            info.bytes_per_pixel,
        ));
    }

    // ── Memory subsystem ───────────────────────────────────────────
    let phys_mem_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory"),
    );
    memory::init_core(phys_mem_offset, &boot_info.memory_regions);
    memory::test_allocators();

    devices::draw_boot_screen();

    // ── Task layer + fault-path self-test ──────────────────────────
    process::init();
    memory::exercise_demand_paging();

    serial_println!("boot complete — core memory subsystem online");
    loop {
        x86_64::instructions::hlt();
    }
}
