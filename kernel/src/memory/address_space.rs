// kernel/src/memory/address_space.rs
//
// AddressSpace: one task's page-table root plus its ordered VMA set.
//
// The PML4 is created by cloning the kernel template captured at boot,
// so every address space sees the kernel half.  VMA membership is
// guarded by the readers/writer `regions` lock (fault handler and
// check_access read; map/unmap/dup/destroy write); page-table edits on
// the same space serialize on the short `pgt_lock`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;
use x86_64::PhysAddr;

use crate::allocator::buddy::{self, AllocFlags, GFP_KERNEL};
use crate::errno::Errno;
use crate::memory::paging;
use crate::memory::vma::{MemoryRegion, ProtFlags, RegionSet};
use crate::serial_println;
use crate::sync::{IrqLock, IrqLockGuard};

// ============================================================================
// Kernel template
// ============================================================================

static KERNEL_TEMPLATE: AtomicU64 = AtomicU64::new(0);

/// Record the boot PML4 as the template every address space clones.
pub fn init_kernel_template(pml4: PhysAddr) {
    KERNEL_TEMPLATE.store(pml4.as_u64(), Ordering::Release);
}

pub fn kernel_template() -> PhysAddr {
    let raw = KERNEL_TEMPLATE.load(Ordering::Acquire);
    assert!(raw != 0, "kernel PML4 template not initialized");
    PhysAddr::new(raw)
}

#[cfg(test)]
pub fn reset_template_for_test() {
    KERNEL_TEMPLATE.store(0, Ordering::Release);
}

// ============================================================================
// AddressSpace
// ============================================================================

pub struct AddressSpace {
    pml4_phys: PhysAddr,
    owned: bool,
    regions: RwLock<RegionSet>,
    pgt_lock: IrqLock<()>,
}

unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    // ====================================================================
    // CONSTRUCTORS
    // ====================================================================

    /// Kernel address space: wraps the template root, no VMAs.  Used by
    /// the boot task; never owns (and never frees) the tables.
    pub fn kernel() -> Arc<Self> {
        Arc::new(Self {
            pml4_phys: kernel_template(),
            owned: false,
            regions: RwLock::new(RegionSet::new()),
            pgt_lock: IrqLock::new(()),
        })
    }

    /// Fresh user address space: a new PML4 populated with the kernel
    /// template's entries, empty VMA list.
    pub fn new_user() -> Result<Arc<Self>, Errno> {
        let template = kernel_template();
        let frame = buddy::alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0)
            .ok_or(Errno::Enomem)?;
        let pml4_phys = frame.phys();

        unsafe {
            let dst = crate::memory::phys_to_virt(pml4_phys).as_mut_ptr::<u64>();
            let src = crate::memory::phys_to_virt(template).as_ptr::<u64>();
            core::ptr::copy_nonoverlapping(src, dst, 512);
        }

        Ok(Arc::new(Self {
            pml4_phys,
            owned: true,
            regions: RwLock::new(RegionSet::new()),
            pgt_lock: IrqLock::new(()),
        }))
    }

    // ====================================================================
    // ACCESSORS
    // ====================================================================

    #[inline]
    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4_phys
    }

    /// Serialize page-table edits on this address space.
    pub fn lock_tables(&self) -> IrqLockGuard<'_, ()> {
        self.pgt_lock.lock()
    }

    /// Switch the CPU to this address space (writes CR3, flushing
    /// non-global TLB entries).
    ///
    /// # Safety
    /// The tables must map the currently executing code and stack.
    #[cfg(not(test))]
    pub unsafe fn activate(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;

        let frame = PhysFrame::containing_address(self.pml4_phys);
        let (current, _) = Cr3::read();
        if current != frame {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    // ====================================================================
    // VMA MANAGEMENT
    // ====================================================================

    /// Register a region.  Validates alignment, flag exclusivity and the
    /// file window, and keeps the set disjoint.  Does NOT touch page
    /// tables — population is the fault handler's job.
    pub fn map_region(&self, mr: MemoryRegion) -> Result<(), Errno> {
        if mr.end > 0x0000_8000_0000_0000 {
            return Err(Errno::Einval);
        }
        self.regions.write().insert(mr)
    }

    /// Register a region and eagerly populate it with zeroed frames
    /// (boot-time mappings that must not fault).
    pub fn map_region_eager(&self, mr: MemoryRegion) -> Result<(), Errno> {
        self.map_region(mr.clone())?;
        let _tables = self.pgt_lock.lock();
        paging::map_anon_region(self.pml4_phys, &mr).inspect_err(|_| {
            drop(self.regions.write().remove(mr.start, mr.end));
        })
    }

    /// Map a physical window (MMIO registers, framebuffer) at
    /// `[start, end)` with the given cache policy.  Device regions are
    /// populated up front; faulting on one later is fatal.
    pub fn map_device_region(
        &self,
        start: u64,
        end: u64,
        phys: PhysAddr,
        prot: ProtFlags,
        policy: paging::CachePolicy,
    ) -> Result<(), Errno> {
        if !crate::memory::is_page_aligned(phys.as_u64()) {
            return Err(Errno::Einval);
        }
        let mr = MemoryRegion {
            start,
            end,
            prot,
            flags: crate::memory::vma::MapFlags::SHARED,
            kind: crate::memory::vma::RegionKind::Device,
        };
        self.map_region(mr)?;

        let flags = paging::region_flags(prot, true) | paging::cache_flags(policy);
        let _tables = self.pgt_lock.lock();
        for (i, va) in (start..end).step_by(crate::memory::PAGE_SIZE).enumerate() {
            let pa = phys + (i as u64) * crate::memory::PAGE_SIZE as u64;
            if let Err(e) = paging::map_page(self.pml4_phys, x86_64::VirtAddr::new(va), pa, flags)
            {
                paging::unmap_region_pages(self.pml4_phys, start, va);
                drop(self.regions.write().remove(start, end));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop the region spanning exactly `[start, end)` and unmap every
    /// resident page.
    pub fn unmap_region(&self, start: u64, end: u64) -> Result<(), Errno> {
        let mr = self
            .regions
            .write()
            .remove(start, end)
            .ok_or(Errno::Enoent)?;
        let _tables = self.pgt_lock.lock();
        paging::unmap_region_pages(self.pml4_phys, mr.start, mr.end);
        Ok(())
    }

    pub fn find_region(&self, addr: u64) -> Option<MemoryRegion> {
        self.regions.read().find(addr).cloned()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// 0 / EFAULT (no VMA) / EACCES, under the read side of the lock.
    pub fn check_access(
        &self,
        addr: u64,
        need_r: bool,
        need_w: bool,
        need_x: bool,
    ) -> Result<(), Errno> {
        let regions = self.regions.read();
        let mr = regions.find(addr).ok_or(Errno::Efault)?;
        let mut need = ProtFlags::empty();
        if need_r {
            need |= ProtFlags::READ;
        }
        if need_w {
            need |= ProtFlags::WRITE;
        }
        if need_x {
            need |= ProtFlags::EXEC;
        }
        if !mr.prot.contains(need) {
            return Err(Errno::Eacces);
        }
        Ok(())
    }

    /// Debug: print all regions (serial, no allocation).
    pub fn dump_regions(&self, label: &str) {
        let regions = self.regions.read();
        serial_println!("address space {} ({} regions):", label, regions.len());
        for mr in regions.iter() {
            serial_println!(
                "  {:#x}..{:#x} ({} pages) [{}] prot={:?}",
                mr.start,
                mr.end,
                mr.size_pages(),
                mr.kind_name(),
                mr.prot,
            );
        }
    }

    // ====================================================================
    // FORK
    // ====================================================================

    /// Duplicate this address space: clone every VMA and share all
    /// resident frames copy-on-write.  On failure the new space is
    /// dropped, which rolls its mappings back; source pages left
    /// write-protected heal on their next write fault.
    pub fn dup(&self) -> Result<Arc<Self>, Errno> {
        let dst = Self::new_user()?;
        let src_regions = self.regions.write();
        for mr in src_regions.iter() {
            dst.regions.write().insert(mr.clone())?;
            let _tables = self.pgt_lock.lock();
            paging::fork_region(dst.pml4_phys, self.pml4_phys, mr)?;
        }
        Ok(dst)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let regions: Vec<MemoryRegion> = self.regions.get_mut().take_all();
        for mr in regions {
            paging::unmap_region_pages(self.pml4_phys, mr.start, mr.end);
        }
        paging::free_owned_tables(self.pml4_phys, kernel_template());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::{install_test_template, with_ram};
    use crate::memory::vma::MapFlags;
    use crate::memory::{frame_bytes, PAGE_SIZE};
    use x86_64::VirtAddr;

    const RAM_FRAMES: usize = 8192;

    fn rw_anon(start: u64, end: u64) -> MemoryRegion {
        MemoryRegion::new_anonymous(
            start,
            end,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
        )
    }

    #[test]
    fn regions_stay_disjoint_per_space() {
        with_ram(RAM_FRAMES, |_| {
            install_test_template();
            let vas = AddressSpace::new_user().unwrap();
            vas.map_region(rw_anon(0x4000, 0x8000)).unwrap();
            assert_eq!(
                vas.map_region(rw_anon(0x6000, 0xA000)),
                Err(Errno::Einval)
            );
            vas.map_region(rw_anon(0x8000, 0xA000)).unwrap();
            assert_eq!(vas.region_count(), 2);
        });
    }

    #[test]
    fn check_access_distinguishes_efault_and_eacces() {
        with_ram(RAM_FRAMES, |_| {
            install_test_template();
            let vas = AddressSpace::new_user().unwrap();
            let mut ro = rw_anon(0x2000, 0x3000);
            ro.prot = ProtFlags::READ;
            vas.map_region(ro).unwrap();

            assert_eq!(vas.check_access(0x1000, true, false, false), Err(Errno::Efault));
            assert_eq!(vas.check_access(0x2000, true, false, false), Ok(()));
            assert_eq!(vas.check_access(0x2000, false, true, false), Err(Errno::Eacces));
            assert_eq!(vas.check_access(0x2000, false, false, true), Err(Errno::Eacces));
        });
    }

    #[test]
    fn new_user_sees_template_mappings() {
        with_ram(RAM_FRAMES, |_| {
            install_test_template();
            // Plant a kernel-half mapping in the template.
            let kernel_va = VirtAddr::new(0xFFFF_8000_0000_0000);
            let frame = buddy::alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0).unwrap();
            paging::map_page(
                kernel_template(),
                kernel_va,
                frame.phys(),
                paging::region_flags(ProtFlags::READ | ProtFlags::WRITE, false),
            )
            .unwrap();

            let vas = AddressSpace::new_user().unwrap();
            assert_eq!(
                paging::translate(vas.pml4_phys(), kernel_va),
                Some(frame.phys())
            );

            // Dropping the user space must not tear down shared kernel
            // tables.
            drop(vas);
            assert_eq!(
                paging::translate(kernel_template(), kernel_va),
                Some(frame.phys())
            );
        });
    }

    #[test]
    fn eager_region_is_resident_and_unmap_reclaims() {
        with_ram(RAM_FRAMES, |_| {
            install_test_template();
            let vas = AddressSpace::new_user().unwrap();
            let baseline = buddy::free_frame_count();

            vas.map_region_eager(rw_anon(0x40_0000, 0x40_4000)).unwrap();
            for va in (0x40_0000u64..0x40_4000).step_by(PAGE_SIZE) {
                assert!(paging::translate(vas.pml4_phys(), VirtAddr::new(va)).is_some());
            }

            vas.unmap_region(0x40_0000, 0x40_4000).unwrap();
            assert_eq!(vas.region_count(), 0);
            // Data frames and page tables are all back.
            assert_eq!(buddy::free_frame_count(), baseline);

            assert_eq!(vas.unmap_region(0x40_0000, 0x40_4000), Err(Errno::Enoent));
        });
    }

    #[test]
    fn device_region_maps_uncached_and_skips_refcounting() {
        use x86_64::structures::paging::PageTableFlags;

        with_ram(RAM_FRAMES, |_| {
            install_test_template();
            let vas = AddressSpace::new_user().unwrap();

            // Stand-in for an MMIO window: a RESERVED frame (mem_map
            // pins several at the bottom of the arena).
            let reserved = (0..RAM_FRAMES as u64)
                .filter_map(crate::memory::page::page_for_pfn)
                .find(|p| p.test_flags(crate::memory::page::PageFlags::RESERVED))
                .expect("a reserved frame");
            let phys = reserved.phys();
            let refs_before = reserved.ref_count();

            vas.map_device_region(
                0x50_0000,
                0x50_1000,
                phys,
                ProtFlags::READ | ProtFlags::WRITE,
                paging::CachePolicy::Uncached,
            )
            .unwrap();

            let leaf = paging::walk(vas.pml4_phys(), VirtAddr::new(0x50_0000)).unwrap();
            assert_eq!(leaf.addr(), phys);
            assert!(leaf
                .flags()
                .contains(PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH));

            // Device frames are not refcounted by mappings, in either
            // direction.
            assert_eq!(reserved.ref_count(), refs_before);
            vas.unmap_region(0x50_0000, 0x50_1000).unwrap();
            assert_eq!(reserved.ref_count(), refs_before);
        });
    }

    #[test]
    fn destroy_reclaims_everything() {
        with_ram(RAM_FRAMES, |_| {
            install_test_template();
            let baseline = buddy::free_frame_count();
            {
                let vas = AddressSpace::new_user().unwrap();
                vas.map_region_eager(rw_anon(0x4000, 0xC000)).unwrap();
                let pa = paging::translate(vas.pml4_phys(), VirtAddr::new(0x4000)).unwrap();
                unsafe { frame_bytes(pa)[0] = 0x5A };
            }
            // PML4, intermediate tables and data frames all returned.
            assert_eq!(buddy::free_frame_count(), baseline);
        });
    }
}
