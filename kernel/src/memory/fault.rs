// kernel/src/memory/fault.rs
//
// Page-fault classification and resolution — pure memory operations.
// The interrupt-side handler (init/devices.rs) reads CR2/CR3, packages
// a FaultContext, and escalates any Err from here into a fatal dump;
// nothing in this module panics on a user fault.
//
// Decision tree:
//   1. task layer not up or reserved-bit fault → EFAULT, non-canonical
//      address → EINVAL (all fatal upstream)
//   2. no covering VMA → ENOENT
//   3. VMA permission mismatch → EACCES
//   4. not-present fault → demand-populate (anonymous or file-backed)
//   5. write to a present page in the faulting address space → CoW
//   6. anything else → EFAULT

use bitflags::bitflags;
use x86_64::{PhysAddr, VirtAddr};

use crate::allocator::buddy::{self, AllocFlags, GFP_KERNEL};
use crate::errno::Errno;
use crate::memory::address_space::AddressSpace;
use crate::memory::page::{page_for_phys, PageFlags};
use crate::memory::paging::{self, region_flags};
use crate::memory::vma::{FileBacking, MemoryRegion, ProtFlags, RegionKind};
use crate::memory::{frame_bytes, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::process;

bitflags! {
    /// x86 page-fault error code (pushed by the CPU).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfError: u64 {
        /// 0 = not present, 1 = protection violation.
        const PRESENT           = 1 << 0;
        /// 0 = read, 1 = write.
        const WRITE             = 1 << 1;
        /// 0 = kernel mode, 1 = user mode.
        const USER              = 1 << 2;
        /// Reserved bit set in a table entry (corruption).
        const RESERVED_BIT      = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Everything the resolver needs from the trap site.
pub struct FaultContext {
    /// Faulting address (CR2), raw — may be non-canonical garbage.
    pub addr: u64,
    pub error: PfError,
    pub rip: u64,
    /// PML4 root that was live at fault time (CR3).
    pub cr3: PhysAddr,
}

/// Resolve a page fault, or say why it cannot be resolved.
pub fn handle_page_fault(ctx: &FaultContext) -> Result<(), Errno> {
    if !process::is_initialized() {
        return Err(Errno::Efault);
    }
    if !paging::is_canonical(ctx.addr) {
        return Err(Errno::Einval);
    }
    if ctx.error.contains(PfError::RESERVED_BIT) {
        return Err(Errno::Efault);
    }

    let task = process::current().ok_or(Errno::Efault)?;
    let vas = &task.vas;
    let vpage = ctx.addr & PAGE_MASK;

    let mr = vas.find_region(vpage).ok_or(Errno::Enoent)?;
    check_region_access(&mr, ctx.error)?;

    if !ctx.error.contains(PfError::PRESENT) {
        return populate_one(vas, &mr, vpage);
    }
    if ctx.error.contains(PfError::WRITE) && vas.pml4_phys() == ctx.cr3 {
        return cow_fault(vas, &mr, vpage);
    }
    Err(Errno::Efault)
}

/// Instruction fetch needs EXEC, write needs WRITE, plain reads need
/// READ.  The VMA is the source of truth, not the current PTE.
fn check_region_access(mr: &MemoryRegion, error: PfError) -> Result<(), Errno> {
    let needed = if error.contains(PfError::INSTRUCTION_FETCH) {
        ProtFlags::EXEC
    } else if error.contains(PfError::WRITE) {
        ProtFlags::WRITE
    } else {
        ProtFlags::READ
    };
    if !mr.prot.contains(needed) {
        return Err(Errno::Eacces);
    }
    Ok(())
}

// ============================================================================
// Demand population
// ============================================================================

fn populate_one(vas: &AddressSpace, mr: &MemoryRegion, vpage: u64) -> Result<(), Errno> {
    match &mr.kind {
        RegionKind::Anonymous { .. } => populate_anonymous(vas, mr, vpage),
        RegionKind::File(backing) => populate_file(vas, mr, backing, vpage),
        // Device mappings are established up front; faulting on one
        // means the mapping is gone.
        RegionKind::Device => Err(Errno::Efault),
    }
}

fn populate_anonymous(vas: &AddressSpace, mr: &MemoryRegion, vpage: u64) -> Result<(), Errno> {
    let frame =
        buddy::alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0).ok_or(Errno::Enomem)?;
    let flags = region_flags(mr.prot, true);

    let _tables = vas.lock_tables();
    match paging::map_page(vas.pml4_phys(), VirtAddr::new(vpage), frame.phys(), flags) {
        Ok(()) => Ok(()),
        // Lost a race against another fault on the same page; the
        // mapping is there, which is all the caller wanted.
        Err(Errno::Eexist) => {
            frame.put_page();
            Ok(())
        }
        Err(e) => {
            frame.put_page();
            Err(e)
        }
    }
}

/// File-backed populate: find-or-create the cache page, fill it from
/// the inode if needed (zeroing everything past the file window), then
/// map it.  Private mappings are installed read-only even when the VMA
/// is writable, so the first store takes the CoW path instead of
/// scribbling on the shared cache page.
fn populate_file(
    vas: &AddressSpace,
    mr: &MemoryRegion,
    backing: &FileBacking,
    vpage: u64,
) -> Result<(), Errno> {
    let file_off = backing.file_lo + (vpage - mr.start);
    let init_left = backing.file_hi.saturating_sub(file_off);
    let to_read = init_left.min(PAGE_SIZE as u64) as usize;
    let index = file_off >> PAGE_SHIFT;

    let inode = &backing.inode;
    let page = inode.mapping.lookup_or_create(index)?;

    if !page.test_flags(PageFlags::UPTODATE) {
        if to_read > 0 {
            let buf = unsafe { frame_bytes(page.phys()) };
            match inode.mapping.ops().readpage(inode, index, &mut buf[..to_read]) {
                Ok(filled) => buf[filled..].fill(0),
                Err(_) => {
                    // Leave no half-filled page behind; a retry starts
                    // from a clean miss.
                    page.unlock_page();
                    inode.mapping.remove(index);
                    page.put_page();
                    return Err(Errno::Eio);
                }
            }
        }
        // A hole page (entirely past file_hi) stays all zero, BSS-style.
        page.set_flags(PageFlags::UPTODATE);
    }

    let mut flags = region_flags(mr.prot, true);
    if mr.is_private() {
        flags.remove(x86_64::structures::paging::PageTableFlags::WRITABLE);
    }

    let _tables = vas.lock_tables();
    let result = paging::map_page(vas.pml4_phys(), VirtAddr::new(vpage), page.phys(), flags);
    page.unlock_page();
    match result {
        // The mapping now holds the reference lookup_or_create gave us.
        Ok(()) => Ok(()),
        Err(Errno::Eexist) => {
            page.put_page();
            Ok(())
        }
        Err(e) => {
            page.put_page();
            Err(e)
        }
    }
}

// ============================================================================
// Copy-on-write
// ============================================================================

fn cow_fault(vas: &AddressSpace, mr: &MemoryRegion, vpage: u64) -> Result<(), Errno> {
    let va = VirtAddr::new(vpage);
    let _tables = vas.lock_tables();
    let pml4 = vas.pml4_phys();

    let leaf = paging::walk(pml4, va).ok_or(Errno::Efault)?;
    if leaf.is_unused() {
        return Err(Errno::Efault);
    }
    use x86_64::structures::paging::PageTableFlags;
    if leaf.flags().contains(PageTableFlags::WRITABLE) {
        // Stale TLB entry; the mapping is already writable.
        return Ok(());
    }

    let pa = leaf.addr();
    let page = page_for_phys(pa).ok_or(Errno::Efault)?;

    if page.ref_count() > 1 {
        // Shared frame: copy, then swing the mapping to the private
        // copy.  The zone lock inside the buddy never sleeps, so the
        // allocation is safe under the table lock.
        let fresh = buddy::alloc_pages(GFP_KERNEL, 0).ok_or(Errno::Enomem)?;
        paging::copy_frame(fresh.phys(), pa);
        paging::unmap_page(pml4, va)?;
        paging::map_page(pml4, va, fresh.phys(), region_flags(mr.prot, true))?;
    } else {
        // Sole owner: just re-enable WRITE.
        let flags = leaf.flags() | PageTableFlags::WRITABLE;
        paging::protect_page(pml4, va, flags)?;
    }
    Ok(())
}
