// kernel/src/init/memory.rs
//
// Bring-up: direct map → bootmem → mem_map/buddy → kernel template.
// The buddy is the sole owner of physical memory once `init_core`
// returns; bootmem refuses all further calls.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use x86_64::registers::control::Cr3;
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::address_space::{self, AddressSpace};
use crate::memory::bootmem::{self, BootRegion, MAX_BOOT_REGIONS};
use crate::memory::fault::{handle_page_fault, FaultContext, PfError};
use crate::memory::vma::{MapFlags, MemoryRegion, ProtFlags};
use crate::memory::{self, paging, PAGE_MASK};
use crate::{allocator, process, serial_println};

/// Initialize all memory subsystems in order:
/// phys offset → bootmem → mem_map + buddy → kernel PML4 template.
pub fn init_core(phys_mem_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    serial_println!(
        "physical memory offset: {:#x} (PML4 entry {})",
        phys_mem_offset.as_u64(),
        (phys_mem_offset.as_u64() >> 39) & 0x1FF
    );
    memory::init(phys_mem_offset);

    // Kernel-owned copy of the boot memory map; only full usable
    // regions feed the allocators.
    let mut regions = [BootRegion {
        start: 0,
        end: 0,
        usable: false,
    }; MAX_BOOT_REGIONS];
    let mut count = 0;
    for region in memory_regions.iter() {
        if count == MAX_BOOT_REGIONS {
            serial_println!("bootmem: memory map truncated to {} regions", count);
            break;
        }
        regions[count] = BootRegion {
            start: region.start,
            end: region.end,
            usable: region.kind == MemoryRegionKind::Usable,
        };
        count += 1;
    }

    unsafe {
        bootmem::init(&regions[..count]);
        bootmem::free_all();
    }

    // The live boot PML4 becomes the template every address space
    // clones for its kernel half.
    let (pml4_frame, _) = Cr3::read();
    address_space::init_kernel_template(pml4_frame.start_address());

    allocator::buddy::dump_stats();
}

/// Allocator smoke tests (kmalloc, Vec, String), run before anything
/// depends on the heap.
pub fn test_allocators() {
    {
        use core::alloc::Layout;

        let layout = Layout::from_size_align(8, 8).unwrap();
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() {
            panic!("kmalloc smoke test: allocation failed");
        }
        unsafe {
            *(ptr as *mut u64) = 0xDEAD_BEEF;
            assert_eq!(*(ptr as *const u64), 0xDEAD_BEEF);
            alloc::alloc::dealloc(ptr, layout);
        }
        serial_println!("  kmalloc: write/read ok");
    }

    {
        use alloc::vec::Vec;
        let mut v: Vec<u8> = Vec::new();
        v.push(1);
        v.push(2);
        v.push(3);
        serial_println!("  Vec: len={}", v.len());
    }

    {
        use alloc::string::String;
        let s = String::from("hello from the slab");
        serial_println!("  String: {}", s);
    }

    allocator::slab::dump_stats();
}

/// Drive the demand-paging and CoW machinery once at boot, through the
/// same entry point the page-fault vector uses.  Catches a broken fault
/// path before the first user task ever runs.
pub fn exercise_demand_paging() {
    // High user-half range, clear of any PML4 slot the kernel template
    // occupies, so the demo space owns its whole table subtree.
    const DEMO_BASE: u64 = 0x7100_0000_0000;

    let vas = AddressSpace::new_user().expect("demo address space");
    vas.map_region(MemoryRegion::new_anonymous(
        DEMO_BASE,
        DEMO_BASE + 0x4000,
        ProtFlags::READ | ProtFlags::WRITE,
        MapFlags::PRIVATE | MapFlags::ANONYMOUS,
        Some("[demo]"),
    ))
    .expect("demo region");

    let demo = process::spawn("mm-demo", vas.clone());
    let previous = process::adopt(demo.clone());

    let fault_at = |addr: u64, error: PfError, cr3: PhysAddr| {
        let ctx = FaultContext {
            addr,
            error,
            rip: 0,
            cr3,
        };
        handle_page_fault(&ctx).expect("demand-paging self-test fault failed");
    };

    // Touch two pages, write through the direct map, fork, CoW.
    fault_at(DEMO_BASE, PfError::USER | PfError::WRITE, vas.pml4_phys());
    fault_at(DEMO_BASE + 0x2000, PfError::USER, vas.pml4_phys());

    let pa = paging::translate(vas.pml4_phys(), VirtAddr::new(DEMO_BASE))
        .expect("page resident after fault");
    unsafe { memory::frame_bytes(PhysAddr::new(pa.as_u64() & PAGE_MASK))[0] = b'P' };

    let child_vas = vas.dup().expect("fork");
    let child = process::spawn("mm-demo-child", child_vas.clone());
    process::adopt(child.clone());
    fault_at(
        DEMO_BASE,
        PfError::USER | PfError::WRITE | PfError::PRESENT,
        child_vas.pml4_phys(),
    );

    let child_pa = paging::translate(child_vas.pml4_phys(), VirtAddr::new(DEMO_BASE))
        .expect("child page resident");
    assert_ne!(pa, child_pa, "CoW must give the child its own frame");

    if let Some(previous) = previous {
        process::adopt(previous);
    }
    serial_println!("  demand paging + CoW self-test ok");
}
