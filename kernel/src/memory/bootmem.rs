// kernel/src/memory/bootmem.rs
//
// One-shot bitmap allocator over physical frames.  The ONLY source of
// frames between bootloader handoff and buddy bring-up.  Its last act
// (`free_all`) builds mem_map, pours every free frame into the buddy,
// releases its own bitmap, and dissolves — any call after that returns
// a hard error.
//
// One bit per frame, 1 = allocated.  First-fit scans; there is no free
// list and no coalescing.  Nothing here may allocate (there is nothing
// to allocate from).

use x86_64::PhysAddr;

use crate::allocator::buddy;
use crate::errno::Errno;
use crate::memory::page::{self, PageDesc, PageFlags};
use crate::memory::{align_up, phys_to_virt, pfn_to_phys, PAGE_SHIFT, PAGE_SIZE};
use crate::serial_println;
use crate::sync::IrqLock;

/// Kernel-owned copy of one bootloader memory-map entry.  Only full
/// frames inside a usable region are ever handed out.
#[derive(Debug, Clone, Copy)]
pub struct BootRegion {
    pub start: u64,
    pub end: u64,
    pub usable: bool,
}

pub const MAX_BOOT_REGIONS: usize = 64;

struct Bootmem {
    bitmap_phys: PhysAddr,
    bitmap_bytes: usize,
    max_pfn: u64,
}

impl Bootmem {
    fn bitmap(&mut self) -> &'static mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                phys_to_virt(self.bitmap_phys).as_mut_ptr::<u8>(),
                self.bitmap_bytes,
            )
        }
    }

    #[inline]
    fn test_bit(&mut self, pfn: u64) -> bool {
        self.bitmap()[(pfn / 8) as usize] & (1 << (pfn % 8)) != 0
    }

    #[inline]
    fn set_bit(&mut self, pfn: u64) {
        self.bitmap()[(pfn / 8) as usize] |= 1 << (pfn % 8);
    }

    #[inline]
    fn clear_bit(&mut self, pfn: u64) {
        self.bitmap()[(pfn / 8) as usize] &= !(1 << (pfn % 8));
    }

    /// First-fit scan for a run of `n` clear bits.
    fn find_run(&mut self, n: u64) -> Option<u64> {
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for pfn in 0..self.max_pfn {
            if self.test_bit(pfn) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = pfn;
                }
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
        }
        None
    }

    fn claim_run(&mut self, start: u64, n: u64) {
        for pfn in start..start + n {
            debug_assert!(!self.test_bit(pfn), "double allocation at pfn {}", pfn);
            self.set_bit(pfn);
        }
    }
}

static BOOTMEM: IrqLock<Option<Bootmem>> = IrqLock::new(None);

// ============================================================================
// Init
// ============================================================================

/// Build the bitmap from the bootloader memory map.  Everything starts
/// allocated; usable frames are cleared, then the bitmap's own frames
/// are re-claimed.
///
/// # Safety
/// `memory::init` must already have published the direct-map offset, and
/// the regions must describe RAM that nothing else is using.
pub unsafe fn init(regions: &[BootRegion]) {
    let max_pfn = regions
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.end >> PAGE_SHIFT)
        .max()
        .expect("bootmem: no usable memory regions");

    let bitmap_bytes = ((max_pfn + 7) / 8) as usize;
    let bitmap_frames = align_up(bitmap_bytes as u64, PAGE_SIZE as u64) >> PAGE_SHIFT;

    // Place the bitmap in the first usable region that can hold it.
    let bitmap_phys = regions
        .iter()
        .filter(|r| r.usable)
        .find_map(|r| {
            let start = align_up(r.start, PAGE_SIZE as u64);
            let needed = bitmap_frames << PAGE_SHIFT;
            (start + needed <= r.end).then(|| PhysAddr::new(start))
        })
        .expect("bootmem: no region large enough for the frame bitmap");

    let mut bm = Bootmem {
        bitmap_phys,
        bitmap_bytes,
        max_pfn,
    };

    bm.bitmap().fill(0xFF);

    for region in regions.iter().filter(|r| r.usable) {
        let first = align_up(region.start, PAGE_SIZE as u64) >> PAGE_SHIFT;
        let last = region.end >> PAGE_SHIFT;
        for pfn in first..last.min(max_pfn) {
            bm.clear_bit(pfn);
        }
    }

    let bitmap_pfn = bitmap_phys.as_u64() >> PAGE_SHIFT;
    for pfn in bitmap_pfn..bitmap_pfn + bitmap_frames {
        bm.set_bit(pfn);
    }

    serial_println!(
        "bootmem: {} frames tracked, bitmap {} bytes at {:#x}",
        max_pfn,
        bitmap_bytes,
        bitmap_phys.as_u64()
    );

    *BOOTMEM.lock() = Some(bm);
}

// ============================================================================
// Allocation
// ============================================================================

pub fn alloc_page() -> Result<PhysAddr, Errno> {
    alloc_contiguous(1)
}

/// First-fit allocation of `n` contiguous frames.  At boot, a failure
/// here is unrecoverable: there is no other allocator to fall back to,
/// so callers escalate ENOMEM to a panic.
pub fn alloc_contiguous(n: usize) -> Result<PhysAddr, Errno> {
    let mut guard = BOOTMEM.lock();
    let bm = guard.as_mut().ok_or(Errno::Efault)?;
    let start = bm.find_run(n as u64).ok_or(Errno::Enomem)?;
    bm.claim_run(start, n as u64);
    Ok(pfn_to_phys(start))
}

pub fn free_page(pa: PhysAddr) -> Result<(), Errno> {
    free_contiguous(pa, 1)
}

pub fn free_contiguous(pa: PhysAddr, n: usize) -> Result<(), Errno> {
    let mut guard = BOOTMEM.lock();
    let bm = guard.as_mut().ok_or(Errno::Efault)?;
    let first = pa.as_u64() >> PAGE_SHIFT;
    for pfn in first..first + n as u64 {
        debug_assert!(bm.test_bit(pfn), "bootmem: freeing a free frame {}", pfn);
        bm.clear_bit(pfn);
    }
    Ok(())
}

// ============================================================================
// Teardown: build mem_map, hand everything to the buddy
// ============================================================================

/// Allocate and publish the descriptor arena through the (still live)
/// bitmap.  Returns the consumed bootmem state plus the arena's own
/// frame range.
fn construct_mem_map() -> (Bootmem, u64, u64) {
    let mem_map_frames = {
        let guard = BOOTMEM.lock();
        let bm = guard.as_ref().expect("bootmem: teardown without init");
        let bytes = bm.max_pfn * core::mem::size_of::<PageDesc>() as u64;
        align_up(bytes, PAGE_SIZE as u64) >> PAGE_SHIFT
    };

    let mm_phys = alloc_contiguous(mem_map_frames as usize)
        .expect("bootmem: cannot place mem_map");

    let mut guard = BOOTMEM.lock();
    let bm = guard.take().unwrap();

    let ptr = phys_to_virt(mm_phys).as_mut_ptr::<PageDesc>();
    for i in 0..bm.max_pfn as usize {
        unsafe { ptr.add(i).write(PageDesc::new()) };
    }
    unsafe { page::install_mem_map(ptr, bm.max_pfn as usize) };

    let mm_pfn = mm_phys.as_u64() >> PAGE_SHIFT;
    (bm, mm_pfn, mem_map_frames)
}

/// Dissolve bootmem into the buddy allocator:
///   1. build mem_map through our own bitmap,
///   2. classify every frame — still-allocated bits become RESERVED with
///      one permanent reference, clear bits are poured into the buddy,
///   3. release the bitmap frames themselves,
///   4. null the state so later bootmem calls fail hard.
///
/// # Safety
/// Single boot-time caller; after this, the buddy owns physical memory.
pub unsafe fn free_all() {
    let (mut bm, mm_pfn, mm_frames) = construct_mem_map();

    buddy::init_zones(bm.max_pfn);

    let bitmap_pfn = bm.bitmap_phys.as_u64() >> PAGE_SHIFT;
    let bitmap_frames = align_up(bm.bitmap_bytes as u64, PAGE_SIZE as u64) >> PAGE_SHIFT;

    let mut reserved = 0u64;
    let mut released = 0u64;
    for pfn in 0..bm.max_pfn {
        // The bitmap's own frames are handled below.
        if (bitmap_pfn..bitmap_pfn + bitmap_frames).contains(&pfn) {
            continue;
        }
        let desc = page::page_for_pfn(pfn).unwrap();
        if bm.test_bit(pfn) {
            desc.set_flags(PageFlags::RESERVED);
            desc.set_ref_count(1);
            reserved += 1;
        } else {
            buddy::free_pages(desc, 0);
            released += 1;
        }
    }

    for pfn in bitmap_pfn..bitmap_pfn + bitmap_frames {
        let desc = page::page_for_pfn(pfn).unwrap();
        buddy::free_pages(desc, 0);
        released += 1;
    }

    serial_println!(
        "bootmem: dissolved — {} frames to buddy, {} reserved (mem_map {} frames at pfn {})",
        released,
        reserved,
        mm_frames,
        mm_pfn
    );
}

/// Test-only teardown that stops after mem_map construction, leaving the
/// global buddy zones empty so tests can drive a private zone.
#[cfg(test)]
pub(crate) unsafe fn build_mem_map_for_test() {
    let (bm, _, _) = construct_mem_map();
    buddy::init_zones(bm.max_pfn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::with_ram;
    use crate::memory::PAGE_SHIFT;
    use std::vec::Vec;

    // with_ram runs init + free_all, so bootmem is already dissolved when
    // the closure runs; these tests drive the pre-teardown API directly.

    #[test]
    fn alloc_free_cycle_before_teardown() {
        crate::memory::test_support::with_raw_ram(1024, |_| {
            // mem_map consumed bootmem; re-init a fresh bitmap over the
            // tail half of the arena, which free_all never touched.
            let regions = [BootRegion {
                start: 512 << PAGE_SHIFT,
                end: 1024 << PAGE_SHIFT,
                usable: true,
            }];
            unsafe { init(&regions) };

            let a = alloc_page().unwrap();
            let b = alloc_page().unwrap();
            assert_ne!(a, b);

            free_page(a).unwrap();
            let c = alloc_page().unwrap();
            // First-fit reuses the lowest cleared frame.
            assert_eq!(a, c);

            // Drain the state so the next test starts clean.
            *BOOTMEM.lock() = None;
        });
    }

    #[test]
    fn contiguous_run_is_contiguous_and_exhaustible() {
        crate::memory::test_support::with_raw_ram(1024, |_| {
            let regions = [BootRegion {
                start: 512 << PAGE_SHIFT,
                end: 640 << PAGE_SHIFT,
                usable: true,
            }];
            unsafe { init(&regions) };

            let run = alloc_contiguous(16).unwrap();
            assert_eq!(run.as_u64() % 4096, 0);

            let mut grabbed = Vec::new();
            loop {
                match alloc_page() {
                    Ok(pa) => grabbed.push(pa),
                    Err(e) => {
                        assert_eq!(e, Errno::Enomem);
                        break;
                    }
                }
            }
            // 128-frame window minus bitmap frame minus the 16-frame run.
            assert_eq!(grabbed.len(), 128 - 1 - 16);

            *BOOTMEM.lock() = None;
        });
    }

    #[test]
    fn calls_after_teardown_fail_hard() {
        with_ram(1024, |_| {
            assert_eq!(alloc_page(), Err(Errno::Efault));
            assert_eq!(free_page(PhysAddr::new(0x1000)), Err(Errno::Efault));
        });
    }

    #[test]
    fn teardown_classifies_frames() {
        with_ram(1024, |_| {
            // Every frame is either RESERVED with a pinned reference
            // (bitmap got released, mem_map stayed) or buddy-owned.
            let mut reserved = 0;
            for pfn in 0..1024u64 {
                let desc = page::page_for_pfn(pfn).unwrap();
                if desc.test_flags(PageFlags::RESERVED) {
                    assert_eq!(desc.ref_count(), 1);
                    reserved += 1;
                }
            }
            // mem_map itself is pinned, so at least its frames count.
            assert!(reserved > 0);
            assert!(buddy::free_frame_count() > 0);
            assert_eq!(
                reserved + buddy::free_frame_count(),
                1024,
                "all frames are either reserved or free"
            );
        });
    }
}
