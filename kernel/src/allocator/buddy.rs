// kernel/src/allocator/buddy.rs
//
// Per-zone power-of-two free-list allocator over mem_map.
//
// Zones partition the PFN space: DMA below 16 MiB, DMA32 below 4 GiB,
// NORMAL above.  Each zone keeps one intrusive doubly-linked free list
// per order in [0, MAX_ORDER]; links live in the page descriptors and
// are guarded by the zone's IRQ-safe spinlock.
//
// PFN arithmetic does all the structural work:
//   buddy(p, k)  = p ^ (1 << k)
//   parent(p, k) = p & !((1 << (k + 1)) - 1)

use x86_64::VirtAddr;

use bitflags::bitflags;

use crate::memory::page::{page_for_pfn, PageDesc, PageFlags, PageState, NIL_PFN};
use crate::memory::{self, pfn_to_phys, phys_to_virt, virt_to_phys, PAGE_SIZE};
use crate::serial_println_raw;
use crate::sync::IrqLock;

/// Largest block: 2^10 frames = 4 MiB.
pub const MAX_ORDER: usize = 10;
const NUM_ORDERS: usize = MAX_ORDER + 1;

const DMA_LIMIT_PFN: u64 = (16 << 20) >> 12;
const DMA32_LIMIT_PFN: u64 = (4u64 << 30) >> 12;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Allocate below 16 MiB.
        const DMA    = 1 << 0;
        /// Allocate below 4 GiB.
        const DMA32  = 1 << 1;
        /// No placement constraint.
        const NORMAL = 1 << 2;
        /// Zero-fill the block before returning it.
        const ZERO   = 1 << 3;
    }
}

/// Default kernel allocation: NORMAL with fallback to lower zones.
pub const GFP_KERNEL: AllocFlags = AllocFlags::NORMAL;

// ============================================================================
// Zone
// ============================================================================

pub(crate) struct Zone {
    name: &'static str,
    start_pfn: u64,
    end_pfn: u64,
    free_lists: [u32; NUM_ORDERS],
    free_counts: [u64; NUM_ORDERS],
}

impl Zone {
    pub(crate) const fn empty(name: &'static str) -> Self {
        Self {
            name,
            start_pfn: 0,
            end_pfn: 0,
            free_lists: [NIL_PFN; NUM_ORDERS],
            free_counts: [0; NUM_ORDERS],
        }
    }

    pub(crate) fn reset(&mut self, start_pfn: u64, end_pfn: u64) {
        self.start_pfn = start_pfn;
        self.end_pfn = end_pfn;
        self.free_lists = [NIL_PFN; NUM_ORDERS];
        self.free_counts = [0; NUM_ORDERS];
    }

    #[inline]
    fn contains_block(&self, pfn: u64, order: usize) -> bool {
        pfn >= self.start_pfn && pfn + (1u64 << order) <= self.end_pfn
    }

    /// Put a block at the head of its order's list.
    fn push(&mut self, pfn: u64, order: usize) {
        let desc = page_for_pfn(pfn).unwrap();
        desc.set_state(PageState::Free);
        desc.set_order(order);
        desc.set_flags(PageFlags::BUDDY);
        desc.set_prev(NIL_PFN);
        let old_head = self.free_lists[order];
        desc.set_next(old_head);
        if old_head != NIL_PFN {
            page_for_pfn(old_head as u64).unwrap().set_prev(pfn as u32);
        }
        self.free_lists[order] = pfn as u32;
        self.free_counts[order] += 1;
    }

    /// Remove a specific block from its order's list.
    fn unlink(&mut self, pfn: u64, order: usize) {
        let desc = page_for_pfn(pfn).unwrap();
        debug_assert_eq!(desc.state(), PageState::Free);
        debug_assert_eq!(desc.order(), order);
        let prev = desc.prev();
        let next = desc.next();
        if prev != NIL_PFN {
            page_for_pfn(prev as u64).unwrap().set_next(next);
        } else {
            debug_assert_eq!(self.free_lists[order], pfn as u32);
            self.free_lists[order] = next;
        }
        if next != NIL_PFN {
            page_for_pfn(next as u64).unwrap().set_prev(prev);
        }
        desc.set_next(NIL_PFN);
        desc.set_prev(NIL_PFN);
        self.free_counts[order] -= 1;
    }

    fn pop(&mut self, order: usize) -> Option<u64> {
        let head = self.free_lists[order];
        if head == NIL_PFN {
            return None;
        }
        let pfn = head as u64;
        self.unlink(pfn, order);
        Some(pfn)
    }

    /// Scan orders upward, split the first block found back down to the
    /// requested order.  The left child is returned; right children land
    /// on the lower free lists.
    pub(crate) fn alloc(&mut self, order: usize) -> Option<u64> {
        if order > MAX_ORDER {
            return None;
        }
        for k in order..=MAX_ORDER {
            let Some(pfn) = self.pop(k) else { continue };
            let desc = page_for_pfn(pfn).unwrap();
            if k > order {
                desc.set_state(PageState::Split);
            }
            let mut cur = k;
            while cur > order {
                cur -= 1;
                self.push(pfn + (1u64 << cur), cur);
            }
            desc.clear_flags(PageFlags::BUDDY);
            desc.set_state(PageState::Allocated);
            desc.set_order(order);
            desc.set_ref_count(1);
            return Some(pfn);
        }
        None
    }

    /// Free a block: append to its list, then coalesce with its buddy as
    /// long as the buddy is free at the same order.
    pub(crate) fn free_block(&mut self, pfn: u64, order: usize) {
        debug_assert!(order <= MAX_ORDER);
        debug_assert_eq!(
            pfn & ((1u64 << order) - 1),
            0,
            "pfn {:#x} not aligned to order {}",
            pfn,
            order
        );
        debug_assert!(self.contains_block(pfn, order));

        self.push(pfn, order);

        if order == MAX_ORDER {
            return;
        }
        let buddy = pfn ^ (1u64 << order);
        if !self.contains_block(buddy, order) {
            return;
        }
        let buddy_desc = page_for_pfn(buddy).unwrap();
        if buddy_desc.state() != PageState::Free || buddy_desc.order() != order {
            return;
        }

        self.unlink(buddy, order);
        self.unlink(pfn, order);
        for p in [pfn, buddy] {
            let d = page_for_pfn(p).unwrap();
            d.set_state(PageState::Invalid);
            d.clear_flags(PageFlags::BUDDY);
        }
        let parent = pfn & !((1u64 << (order + 1)) - 1);
        self.free_block(parent, order + 1);
    }

    pub(crate) fn free_frames(&self) -> u64 {
        self.free_counts
            .iter()
            .enumerate()
            .map(|(order, count)| count << order)
            .sum()
    }

    pub(crate) fn blocks_of_order(&self, order: usize) -> u64 {
        self.free_counts[order]
    }
}

// ============================================================================
// Global zones
// ============================================================================

static ZONES: [IrqLock<Zone>; 3] = [
    IrqLock::new(Zone::empty("DMA")),
    IrqLock::new(Zone::empty("DMA32")),
    IrqLock::new(Zone::empty("NORMAL")),
];

/// Partition `[0, max_pfn)` into the three zones.  Called once from
/// bootmem teardown (tests re-partition per simulated machine).
pub fn init_zones(max_pfn: u64) {
    let dma_end = max_pfn.min(DMA_LIMIT_PFN);
    let dma32_end = max_pfn.min(DMA32_LIMIT_PFN);
    ZONES[0].lock().reset(0, dma_end);
    ZONES[1].lock().reset(dma_end, dma32_end);
    ZONES[2].lock().reset(dma32_end, max_pfn);
}

fn zone_index_for_pfn(pfn: u64) -> usize {
    if pfn < DMA_LIMIT_PFN {
        0
    } else if pfn < DMA32_LIMIT_PFN {
        1
    } else {
        2
    }
}

fn starting_zone(flags: AllocFlags) -> usize {
    if flags.contains(AllocFlags::DMA) {
        0
    } else if flags.contains(AllocFlags::DMA32) {
        1
    } else {
        2
    }
}

/// Allocate a 2^order block.  The starting zone comes from `flags`; on
/// exhaustion the search falls back toward lower-addressed zones.
/// Returns the head frame's descriptor (ALLOCATED, ref_count 1), or None
/// for the caller to turn into ENOMEM.
pub fn alloc_pages(flags: AllocFlags, order: usize) -> Option<&'static PageDesc> {
    for zi in (0..=starting_zone(flags)).rev() {
        let pfn = ZONES[zi].lock().alloc(order);
        if let Some(pfn) = pfn {
            if flags.contains(AllocFlags::ZERO) {
                for p in pfn..pfn + (1u64 << order) {
                    unsafe { memory::zero_frame(pfn_to_phys(p)) };
                }
            }
            return page_for_pfn(pfn);
        }
    }
    serial_println_raw!("buddy: OOM for order {}", order);
    None
}

/// Return a block to its zone.  The head must have dropped to zero
/// references; double frees trip the state asserts in `Zone::push`.
pub fn free_pages(page: &PageDesc, order: usize) {
    debug_assert_eq!(
        page.ref_count(),
        0,
        "freeing pfn {} with live references",
        page.pfn()
    );
    let pfn = page.pfn();
    ZONES[zone_index_for_pfn(pfn)].lock().free_block(pfn, order);
}

// ============================================================================
// Kernel-virtual convenience wrappers
// ============================================================================

/// Allocate a block and return its direct-map address.
pub fn alloc_kernel_pages(order: usize) -> Option<VirtAddr> {
    alloc_pages(GFP_KERNEL, order).map(|page| phys_to_virt(page.phys()))
}

/// Allocate a zero-filled block and return its direct-map address.
pub fn alloc_kernel_pages_zeroed(order: usize) -> Option<VirtAddr> {
    alloc_pages(GFP_KERNEL | AllocFlags::ZERO, order).map(|page| phys_to_virt(page.phys()))
}

/// Free a block previously returned by one of the kernel-virtual
/// wrappers.
pub fn free_kernel_pages(va: VirtAddr, order: usize) {
    let page = crate::memory::page::page_for_phys(virt_to_phys(va))
        .expect("free_kernel_pages: address outside mem_map");
    debug_assert_eq!(page.ref_count(), 1);
    page.set_ref_count(0);
    free_pages(page, order);
}

pub fn free_frame_count() -> u64 {
    ZONES.iter().map(|z| z.lock().free_frames()).sum()
}

/// Debug: free-list census per zone, on the raw writer so it is safe
/// from any context.
pub fn dump_stats() {
    for zone in ZONES.iter() {
        let z = zone.lock();
        if z.start_pfn == z.end_pfn {
            continue;
        }
        serial_println_raw!(
            "zone {:6} pfn {:#x}..{:#x}: {} KiB free",
            z.name,
            z.start_pfn,
            z.end_pfn,
            z.free_frames() * (PAGE_SIZE as u64 / 1024)
        );
        for order in 0..NUM_ORDERS {
            if z.free_counts[order] > 0 {
                serial_println_raw!(
                    "  order {:2}: {} block(s) of {} KiB",
                    order,
                    z.free_counts[order],
                    (PAGE_SIZE as u64) << order >> 10
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::{with_ram, with_raw_ram};
    use std::vec::Vec;

    // A private zone over frames [2048, 3072) — 4 MiB, naturally aligned,
    // clear of the bitmap and mem_map frames at the bottom of the arena.
    const BASE: u64 = 2048;

    fn seeded_zone() -> Zone {
        let mut zone = Zone::empty("test");
        zone.reset(BASE, BASE + 1024);
        zone.free_block(BASE, MAX_ORDER);
        zone
    }

    #[test]
    fn split_cascades_and_merge_restores() {
        with_raw_ram(4096, |_| {
            let mut zone = seeded_zone();

            // Allocating one frame from a single order-10 block leaves one
            // right-buddy on every list below it.
            let pfn = zone.alloc(0).unwrap();
            assert_eq!(pfn, BASE);
            for order in 0..MAX_ORDER {
                assert_eq!(zone.blocks_of_order(order), 1, "order {}", order);
            }
            assert_eq!(zone.blocks_of_order(MAX_ORDER), 0);

            // Freeing it coalesces all the way back up.
            let desc = page_for_pfn(pfn).unwrap();
            desc.set_ref_count(0);
            zone.free_block(pfn, 0);
            for order in 0..MAX_ORDER {
                assert_eq!(zone.blocks_of_order(order), 0, "order {}", order);
            }
            assert_eq!(zone.blocks_of_order(MAX_ORDER), 1);
            assert_eq!(zone.free_frames(), 1024);
        });
    }

    #[test]
    fn buddies_coalesce_to_parent() {
        with_raw_ram(4096, |_| {
            let mut zone = seeded_zone();

            let a = zone.alloc(0).unwrap();
            let b = zone.alloc(0).unwrap();
            assert_eq!(a ^ 1, b, "first two order-0 allocations are buddies");

            page_for_pfn(a).unwrap().set_ref_count(0);
            page_for_pfn(b).unwrap().set_ref_count(0);
            zone.free_block(a, 0);
            zone.free_block(b, 0);

            // The pair merged and the cascade continued: a single maximal
            // block remains and no order-0 entries survive.
            assert_eq!(zone.blocks_of_order(0), 0);
            assert_eq!(zone.blocks_of_order(MAX_ORDER), 1);
        });
    }

    #[test]
    fn alloc_free_round_trip_restores_lists() {
        with_raw_ram(4096, |_| {
            let mut zone = seeded_zone();
            let snapshot = zone.free_counts;

            let orders = [0usize, 3, 1, 0, 5, 2, 2, 0, 4];
            let mut blocks: Vec<(u64, usize)> = Vec::new();
            for &order in &orders {
                let pfn = zone.alloc(order).unwrap();
                assert_eq!(pfn & ((1 << order) - 1), 0, "natural alignment");
                blocks.push((pfn, order));
            }
            // Free in a different order than allocation.
            blocks.reverse();
            blocks.swap(0, 3);
            for (pfn, order) in blocks {
                page_for_pfn(pfn).unwrap().set_ref_count(0);
                zone.free_block(pfn, order);
            }

            assert_eq!(zone.free_counts, snapshot);
        });
    }

    #[test]
    fn allocation_state_is_tracked() {
        with_raw_ram(4096, |_| {
            let mut zone = seeded_zone();
            let pfn = zone.alloc(2).unwrap();
            let desc = page_for_pfn(pfn).unwrap();
            assert_eq!(desc.state(), PageState::Allocated);
            assert_eq!(desc.order(), 2);
            assert_eq!(desc.ref_count(), 1);
            assert!(!desc.test_flags(PageFlags::BUDDY));
        });
    }

    #[test]
    fn exhaustion_returns_none() {
        with_raw_ram(4096, |_| {
            let mut zone = seeded_zone();
            assert!(zone.alloc(MAX_ORDER).is_some());
            assert!(zone.alloc(MAX_ORDER).is_none());
            assert!(zone.alloc(0).is_none());
        });
    }

    #[test]
    fn kernel_flags_fall_back_to_lower_zones() {
        // A 16 MiB machine has only DMA-zone frames, so a NORMAL request
        // must fall back twice to succeed.
        with_ram(4096, |_| {
            let page = alloc_pages(GFP_KERNEL, 0).expect("fallback allocation");
            assert!(page.pfn() < DMA_LIMIT_PFN);
            page.set_ref_count(0);
            free_pages(page, 0);
        });
    }

    #[test]
    fn zeroed_wrapper_returns_cleared_memory() {
        with_ram(4096, |_| {
            let before = free_frame_count();
            let va = alloc_kernel_pages_zeroed(1).expect("order-1 allocation");
            let bytes =
                unsafe { core::slice::from_raw_parts(va.as_ptr::<u8>(), 2 * PAGE_SIZE) };
            assert!(bytes.iter().all(|&b| b == 0));
            free_kernel_pages(va, 1);
            assert_eq!(free_frame_count(), before);
        });
    }
}
