// kernel/src/memory/paging.rs
//
// Four-level page-table walker and mapping primitives.  Pure mechanism:
// no locking here — callers serialize edits on the same address space
// with the owner's pgt_lock (fault handler, vas operations).
//
// Tables are touched through the direct map, so these functions work on
// any address space, active or not.  Intermediate tables come from the
// buddy (order 0, zeroed) and hold one reference each; `prune` gives
// them back as soon as they drain.
//
// Huge-page (PS) entries are never produced; debug walks assert they do
// not appear.

use alloc::vec::Vec;

use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use crate::allocator::buddy::{self, AllocFlags, GFP_KERNEL};
use crate::errno::Errno;
use crate::memory::page::page_for_phys;
use crate::memory::vma::{MemoryRegion, ProtFlags};
use crate::memory::{self, is_page_aligned, phys_to_virt, PAGE_SIZE};

/// Index shifts for PML4, PDPT, PD (the PT index uses shift 12).
const TABLE_SHIFTS: [u64; 3] = [39, 30, 21];

const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

#[inline]
pub fn is_user_address(va: VirtAddr) -> bool {
    va.as_u64() < USER_HALF_END
}

/// Canonical-address rule: bits 63:48 must replicate bit 47.
#[inline]
pub fn is_canonical(raw: u64) -> bool {
    let top = raw >> 47;
    top == 0 || top == 0x1FFFF
}

#[inline]
fn table_of(phys: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

#[inline]
fn entry_index(va: VirtAddr, shift: u64) -> usize {
    ((va.as_u64() >> shift) & 0x1FF) as usize
}

#[cfg(not(test))]
#[inline]
fn flush_tlb(va: VirtAddr) {
    x86_64::instructions::tlb::flush(va);
}

/// Host tests edit inactive tables only; there is nothing to invalidate.
#[cfg(test)]
fn flush_tlb(_va: VirtAddr) {}

// ============================================================================
// Walks
// ============================================================================

/// Walk to the leaf entry, materializing missing intermediate tables
/// from the buddy.  Created tables are PRESENT|WRITABLE, plus USER for
/// lower-half addresses (leaf flags still gate the actual access).
fn walk_create(pml4: PhysAddr, va: VirtAddr) -> Result<&'static mut PageTableEntry, Errno> {
    let user = is_user_address(va);
    let mut table = table_of(pml4);
    for shift in TABLE_SHIFTS {
        let entry = &mut table[entry_index(va, shift)];
        if entry.is_unused() {
            let frame = buddy::alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0)
                .ok_or(Errno::Enomem)?;
            let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            if user {
                flags |= PageTableFlags::USER_ACCESSIBLE;
            }
            entry.set_addr(frame.phys(), flags);
        } else {
            debug_assert!(
                !entry.flags().contains(PageTableFlags::HUGE_PAGE),
                "unexpected huge mapping in walk at {:#x}",
                va.as_u64()
            );
        }
        table = table_of(entry.addr());
    }
    Ok(&mut table[entry_index(va, 12)])
}

/// Walk to the leaf entry without creating anything.  None if any entry
/// along the way is missing.
pub fn walk(pml4: PhysAddr, va: VirtAddr) -> Option<&'static mut PageTableEntry> {
    let mut table = table_of(pml4);
    for shift in TABLE_SHIFTS {
        let entry = &mut table[entry_index(va, shift)];
        if entry.is_unused() {
            return None;
        }
        debug_assert!(
            !entry.flags().contains(PageTableFlags::HUGE_PAGE),
            "unexpected huge mapping in walk at {:#x}",
            va.as_u64()
        );
        table = table_of(entry.addr());
    }
    Some(&mut table[entry_index(va, 12)])
}

// ============================================================================
// Single-page primitives
// ============================================================================

/// Install `va → pa`.  The mapping consumes the caller's reference on
/// the frame; an already-present leaf is EEXIST.
pub fn map_page(
    pml4: PhysAddr,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), Errno> {
    if !is_page_aligned(va.as_u64()) || !is_page_aligned(pa.as_u64()) {
        return Err(Errno::Einval);
    }
    let leaf = walk_create(pml4, va)?;
    if !leaf.is_unused() {
        return Err(Errno::Eexist);
    }
    leaf.set_addr(pa, flags | PageTableFlags::PRESENT);
    flush_tlb(va);
    Ok(())
}

/// Remove the leaf for `va`, drop the frame reference the mapping held,
/// and prune ancestor tables that drained.  Unmapping a hole is a no-op.
pub fn unmap_page(pml4: PhysAddr, va: VirtAddr) -> Result<(), Errno> {
    if !is_page_aligned(va.as_u64()) {
        return Err(Errno::Einval);
    }
    let Some(leaf) = walk(pml4, va) else {
        return Ok(());
    };
    if leaf.is_unused() {
        return Ok(());
    }
    let pa = leaf.addr();
    leaf.set_unused();
    flush_tlb(va);
    prune(pml4, va);
    // RESERVED frames (device windows, pinned kernel structures) are not
    // refcounted by mappings.
    if let Some(page) = page_for_phys(pa) {
        if !page.test_flags(crate::memory::page::PageFlags::RESERVED) {
            page.put_page();
        }
    }
    Ok(())
}

/// Virtual → physical through the tables, byte-exact.
pub fn translate(pml4: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
    let leaf = walk(pml4, va)?;
    if !leaf.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(leaf.addr() + (va.as_u64() & 0xFFF))
}

/// Rewrite a present leaf's flags, preserving the frame.
pub fn protect_page(pml4: PhysAddr, va: VirtAddr, flags: PageTableFlags) -> Result<(), Errno> {
    if !is_page_aligned(va.as_u64()) {
        return Err(Errno::Einval);
    }
    let leaf = walk(pml4, va).ok_or(Errno::Efault)?;
    if leaf.is_unused() {
        return Err(Errno::Efault);
    }
    let pa = leaf.addr();
    leaf.set_addr(pa, flags | PageTableFlags::PRESENT);
    flush_tlb(va);
    Ok(())
}

// ============================================================================
// Prune
// ============================================================================

fn is_table_empty(table: &PageTable) -> bool {
    table.iter().all(|e| e.is_unused())
}

fn free_table(phys: PhysAddr) {
    page_for_phys(phys)
        .expect("page table frame outside mem_map")
        .put_page();
}

/// After clearing a leaf, give now-empty tables along `va` back to the
/// buddy, deepest first.  The PML4 itself is never freed here.
fn prune(pml4: PhysAddr, va: VirtAddr) {
    let pml4_table = table_of(pml4);
    let pml4e = &mut pml4_table[entry_index(va, 39)];
    if pml4e.is_unused() {
        return;
    }
    let pdpt_phys = pml4e.addr();
    let pdpt = table_of(pdpt_phys);
    let pdpte = &mut pdpt[entry_index(va, 30)];
    if pdpte.is_unused() {
        return;
    }
    let pd_phys = pdpte.addr();
    let pd = table_of(pd_phys);
    let pde = &mut pd[entry_index(va, 21)];
    if pde.is_unused() {
        return;
    }
    let pt_phys = pde.addr();

    if !is_table_empty(table_of(pt_phys)) {
        return;
    }
    pde.set_unused();
    free_table(pt_phys);

    if !is_table_empty(pd) {
        return;
    }
    pdpte.set_unused();
    free_table(pd_phys);

    if !is_table_empty(pdpt) {
        return;
    }
    pml4e.set_unused();
    free_table(pdpt_phys);
}

// ============================================================================
// Region operations
// ============================================================================

/// Cache policy for a leaf mapping, encoded in the (PAT, PCD, PWT)
/// bits.  On a 4 KiB leaf the PAT bit is bit 7 (the same position the
/// `x86_64` crate labels HUGE_PAGE for non-leaf entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// (0,0,0) — ordinary RAM.
    WriteBack,
    /// (0,0,1)
    WriteThrough,
    /// (0,1,1) — MMIO registers.
    Uncached,
    /// (1,0,1) — framebuffers.
    WriteCombining,
}

pub fn cache_flags(policy: CachePolicy) -> PageTableFlags {
    match policy {
        CachePolicy::WriteBack => PageTableFlags::empty(),
        CachePolicy::WriteThrough => PageTableFlags::WRITE_THROUGH,
        CachePolicy::Uncached => PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH,
        CachePolicy::WriteCombining => PageTableFlags::HUGE_PAGE | PageTableFlags::WRITE_THROUGH,
    }
}

/// Kernel-virtual view of the live PML4 (CR3 through the direct map).
#[cfg(not(test))]
pub fn current_pml4() -> &'static mut PageTable {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    table_of(frame.start_address())
}

/// Leaf flags for a user mapping with the given protection.  EFER.NXE is
/// enabled by the bootloader, so non-executable mappings carry NX.
pub fn region_flags(prot: ProtFlags, user: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if prot.contains(ProtFlags::WRITE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if user {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    if !prot.contains(ProtFlags::EXEC) {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    flags
}

fn region_pages(mr: &MemoryRegion) -> impl Iterator<Item = VirtAddr> {
    (mr.start..mr.end)
        .step_by(PAGE_SIZE)
        .map(VirtAddr::new)
}

/// Eagerly populate an anonymous region with zeroed frames.  On any
/// failure every page mapped so far is undone before returning.
pub fn map_anon_region(pml4: PhysAddr, mr: &MemoryRegion) -> Result<(), Errno> {
    let flags = region_flags(mr.prot, true);
    for va in region_pages(mr) {
        let result = buddy::alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0)
            .ok_or(Errno::Enomem)
            .and_then(|frame| {
                map_page(pml4, va, frame.phys(), flags).inspect_err(|_| {
                    frame.put_page();
                })
            });
        if let Err(e) = result {
            for undo in (mr.start..va.as_u64()).step_by(PAGE_SIZE) {
                let _ = unmap_page(pml4, VirtAddr::new(undo));
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Unmap every page of `[start, end)`.
pub fn unmap_region_pages(pml4: PhysAddr, start: u64, end: u64) {
    for va in (start..end).step_by(PAGE_SIZE) {
        let _ = unmap_page(pml4, VirtAddr::new(va));
    }
}

/// Share every present page of `mr` into `dst` copy-on-write: the source
/// leaf loses WRITE, the destination maps the same frame without WRITE,
/// and the frame gains a reference.  Already read-only pages are shared
/// without touching the source.  On failure the destination pages are
/// unmapped and WRITE is restored exactly where this call cleared it —
/// "writable at fork time" is tracked per page, so pages that were
/// already CoW-shared from an earlier fork stay read-only.
pub fn fork_region(dst: PhysAddr, src: PhysAddr, mr: &MemoryRegion) -> Result<(), Errno> {
    let mut forked: Vec<(VirtAddr, bool)> = Vec::new();

    for va in region_pages(mr) {
        let Some(leaf) = walk(src, va) else {
            continue;
        };
        if leaf.is_unused() {
            continue;
        }
        let pa = leaf.addr();
        let flags = leaf.flags();
        let was_writable = flags.contains(PageTableFlags::WRITABLE);
        if was_writable {
            leaf.set_flags(flags - PageTableFlags::WRITABLE);
            flush_tlb(va);
        }
        let page = page_for_phys(pa)
            .filter(|p| !p.test_flags(crate::memory::page::PageFlags::RESERVED));
        if let Some(page) = page {
            page.get_page();
        }
        let err = match map_page(dst, va, pa, flags - PageTableFlags::WRITABLE) {
            Ok(()) => {
                forked.push((va, was_writable));
                continue;
            }
            Err(e) => e,
        };
        // Undo this page, then everything forked before it.
        if let Some(page) = page {
            page.put_page();
        }
        if was_writable {
            if let Some(src_leaf) = walk(src, va) {
                src_leaf.set_flags(src_leaf.flags() | PageTableFlags::WRITABLE);
                flush_tlb(va);
            }
        }
        for (undo_va, undo_writable) in forked {
            let _ = unmap_page(dst, undo_va);
            if undo_writable {
                if let Some(src_leaf) = walk(src, undo_va) {
                    src_leaf.set_flags(src_leaf.flags() | PageTableFlags::WRITABLE);
                    flush_tlb(undo_va);
                }
            }
        }
        return Err(err);
    }
    Ok(())
}

/// Copy a frame's contents through the direct map (the CoW slow path).
pub fn copy_frame(dst: PhysAddr, src: PhysAddr) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            phys_to_virt(src).as_ptr::<u8>(),
            phys_to_virt(dst).as_mut_ptr::<u8>(),
            PAGE_SIZE,
        );
    }
}

// ============================================================================
// Table teardown (address-space destroy)
// ============================================================================

/// Free an entire subtree of tables, dropping a reference on any leaf
/// frame still mapped.  `level` counts down; 1 means `table` is a PT.
fn free_subtree(table_phys: PhysAddr, level: u8) {
    let table = table_of(table_phys);
    for entry in table.iter_mut() {
        if entry.is_unused() {
            continue;
        }
        if level > 1 {
            free_subtree(entry.addr(), level - 1);
        } else if let Some(page) = page_for_phys(entry.addr()) {
            if !page.test_flags(crate::memory::page::PageFlags::RESERVED) {
                page.put_page();
            }
        }
        entry.set_unused();
    }
    free_table(table_phys);
}

/// Free every subtree the address space owns privately — entries present
/// in its PML4 but absent from the kernel template — then the PML4 frame
/// itself.
pub fn free_owned_tables(pml4: PhysAddr, template: PhysAddr) {
    let table = table_of(pml4);
    let template_table = table_of(template);
    for i in 0..512 {
        if !table[i].is_unused() && template_table[i].is_unused() {
            free_subtree(table[i].addr(), 3);
            table[i].set_unused();
        }
    }
    free_table(pml4);
}
