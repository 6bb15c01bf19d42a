// kernel/src/memory/mod.rs
//
// Memory subsystem root: the high-half direct map (HHDM) offset that
// every other module uses to touch physical frames, plus PFN helpers.
//
// Init order is strict and enforced by `init::memory::init_core`:
//   offset → bootmem → mem_map → buddy → slab → vmm/vas.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

pub mod address_space;
pub mod bootmem;
pub mod fault;
pub mod page;
pub mod page_cache;
pub mod paging;
pub mod vma;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_MASK: u64 = !0xFFF;

static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset handed over by the bootloader.
/// Called once from `init_core`, before any allocator comes up.
pub fn init(physical_memory_offset: VirtAddr) {
    PHYSICAL_MEMORY_OFFSET.store(physical_memory_offset.as_u64(), Ordering::Release);
}

pub fn physical_memory_offset() -> VirtAddr {
    VirtAddr::new(PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire))
}

/// Kernel-virtual window onto a physical address.
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    physical_memory_offset() + pa.as_u64()
}

/// Inverse of `phys_to_virt` for direct-map addresses only.
#[inline]
pub fn virt_to_phys(va: VirtAddr) -> PhysAddr {
    PhysAddr::new(va.as_u64() - physical_memory_offset().as_u64())
}

#[inline]
pub const fn pfn_of(pa: PhysAddr) -> u64 {
    pa.as_u64() >> PAGE_SHIFT
}

#[inline]
pub const fn pfn_to_phys(pfn: u64) -> PhysAddr {
    PhysAddr::new(pfn << PAGE_SHIFT)
}

#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & 0xFFF == 0
}

/// The full 4 KiB of a frame, viewed through the direct map.
///
/// # Safety
/// The frame must be RAM the kernel owns; the caller is responsible for
/// aliasing (two callers may observe the same frame).
#[inline]
pub unsafe fn frame_bytes<'a>(pa: PhysAddr) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(phys_to_virt(pa).as_mut_ptr::<u8>(), PAGE_SIZE)
}

/// Zero one frame through the direct map.
///
/// # Safety
/// Same contract as `frame_bytes`.
#[inline]
pub unsafe fn zero_frame(pa: PhysAddr) {
    core::ptr::write_bytes(phys_to_virt(pa).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
}

// ============================================================================
// Host-test harness: simulated physical RAM
// ============================================================================

/// Gives tests a private "machine": an aligned heap arena installed as the
/// direct map, bootmem-initialized and (optionally) handed to the buddy,
/// exactly the path the real boot takes.  A process-wide lock serializes
/// tests because the offset, mem_map and zones are process globals.
#[cfg(test)]
pub mod test_support {
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::Mutex;

    use x86_64::VirtAddr;

    use super::bootmem::{self, BootRegion};
    use super::PAGE_SIZE;

    // 4 MiB alignment so a maximal buddy block is naturally aligned in
    // virtual space too (the slab identity mask works on virtual addresses).
    const ARENA_ALIGN: usize = 4 << 20;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    pub struct TestRam {
        base: *mut u8,
        layout: Layout,
        pub frames: usize,
    }

    impl TestRam {
        fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, ARENA_ALIGN).unwrap();
            let base = unsafe { alloc_zeroed(layout) };
            assert!(!base.is_null(), "test arena allocation failed");
            Self {
                base,
                layout,
                frames,
            }
        }

        pub fn bytes(&self) -> u64 {
            (self.frames * PAGE_SIZE) as u64
        }
    }

    impl Drop for TestRam {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, self.layout) };
        }
    }

    fn reset_globals(ram: &TestRam) {
        super::init(VirtAddr::new(ram.base as u64));
        crate::process::reset_for_test();
        crate::memory::address_space::reset_template_for_test();
    }

    /// Give the arena a kernel PML4 template (an empty table) so user
    /// address spaces can be created.
    pub fn install_test_template() {
        use crate::allocator::buddy::{alloc_pages, AllocFlags, GFP_KERNEL};
        let frame = alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0).expect("template frame");
        crate::memory::address_space::init_kernel_template(frame.phys());
    }

    /// Full bring-up: bootmem → mem_map → buddy, then run `f`.
    pub fn with_ram<R>(frames: usize, f: impl FnOnce(&TestRam) -> R) -> R {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let ram = TestRam::new(frames);
        reset_globals(&ram);
        let regions = [BootRegion {
            start: 0,
            end: ram.bytes(),
            usable: true,
        }];
        unsafe {
            bootmem::init(&regions);
            bootmem::free_all();
        }
        f(&ram)
    }

    /// Bring-up that stops after mem_map construction: the global buddy
    /// zones stay empty so a test can drive a private `Zone` over a known
    /// PFN range (the S1-style deterministic scenarios).
    pub fn with_raw_ram<R>(frames: usize, f: impl FnOnce(&TestRam) -> R) -> R {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let ram = TestRam::new(frames);
        reset_globals(&ram);
        let regions = [BootRegion {
            start: 0,
            end: ram.bytes(),
            usable: true,
        }];
        unsafe {
            bootmem::init(&regions);
            bootmem::build_mem_map_for_test();
        }
        f(&ram)
    }
}
