// kernel/src/memory/page_cache.rs
//
// Per-inode page cache: `{page index → physical frame}`, consulted by
// file-backed faults.  The VFS proper is out of scope; the contract that
// crosses the boundary is `MappingOps` (readpage/writepage) plus the
// minimal `Inode` carrying a size and its mapping.
//
// Invariants:
//   - a page with MAPPED set is reachable from exactly one mapping via
//     (mapping, index);
//   - a page sits LOCKED while its contents are being read in;
//   - UPTODATE is set only after a successful fill.
//
// The mapping lock is never held across anything that can sleep: the
// miss path drops it around the buddy allocation and re-checks for a
// racing insert afterwards.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::allocator::buddy::{self, AllocFlags, GFP_KERNEL};
use crate::errno::Errno;
use crate::memory::page::{page_for_pfn, PageDesc, PageFlags};
use crate::sync::IrqLock;

/// Filesystem half of the page-cache contract.  `readpage` fills `buf`
/// (one frame, through the direct map) from the given file page and
/// returns the byte count it produced; short reads at EOF are expected.
/// May sleep, so it is never called under the mapping lock.
pub trait MappingOps: Send + Sync {
    fn readpage(&self, inode: &Inode, index: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    fn writepage(&self, _inode: &Inode, _index: u64, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Eio)
    }
}

pub struct Mapping {
    ops: &'static dyn MappingOps,
    pages: IrqLock<BTreeMap<u64, u64>>,
}

impl Mapping {
    pub fn new(ops: &'static dyn MappingOps) -> Self {
        Self {
            ops,
            pages: IrqLock::new(BTreeMap::new()),
        }
    }

    pub fn ops(&self) -> &'static dyn MappingOps {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn lookup(&self, index: u64) -> Option<&'static PageDesc> {
        let pages = self.pages.lock();
        pages.get(&index).map(|&pfn| {
            let page = page_for_pfn(pfn).unwrap();
            page.get_page();
            page
        })
    }

    /// Return the page at `index`, LOCKED, holding an extra reference
    /// for the caller.  A miss allocates a fresh frame and installs it
    /// LOCKED|MAPPED with UPTODATE clear; the caller is responsible for
    /// filling it, marking it UPTODATE and unlocking.
    pub fn lookup_or_create(&self, index: u64) -> Result<&'static PageDesc, Errno> {
        loop {
            if let Some(page) = self.lookup(index) {
                // Wait for whoever is filling it.  Single hart: the page
                // cannot leave the mapping while we hold our reference.
                page.lock_page();
                return Ok(page);
            }

            // Miss.  Allocate outside the lock (may sleep on memory
            // pressure), then re-check for a racing insert.
            let page = buddy::alloc_pages(GFP_KERNEL | AllocFlags::ZERO, 0)
                .ok_or(Errno::Enomem)?;

            let mut pages = self.pages.lock();
            if pages.contains_key(&index) {
                // Lost the race: toss the duplicate, take the winner.
                drop(pages);
                page.put_page();
                continue;
            }

            let locked = page.try_lock_page();
            debug_assert!(locked, "fresh frame already locked");
            page.set_flags(PageFlags::MAPPED);
            page.set_mapping(self as *const Mapping, index);
            // One reference for the cache, one for the caller.
            page.get_page();
            pages.insert(index, page.pfn());
            return Ok(page);
        }
    }

    /// Drop `index` from the cache, releasing the cache's reference.
    pub fn remove(&self, index: u64) -> bool {
        let mut pages = self.pages.lock();
        let Some(pfn) = pages.remove(&index) else {
            return false;
        };
        let page = page_for_pfn(pfn).unwrap();
        page.clear_flags(PageFlags::MAPPED | PageFlags::UPTODATE | PageFlags::DIRTY);
        page.clear_mapping();
        drop(pages);
        page.put_page();
        true
    }

    /// Tear down every cached page (inode death).
    pub fn clear(&self) {
        loop {
            let index = {
                let pages = self.pages.lock();
                match pages.keys().next() {
                    Some(&index) => index,
                    None => return,
                }
            };
            self.remove(index);
        }
    }
}

// ============================================================================
// Inode — the slice of the VFS contract the cache needs
// ============================================================================

pub struct Inode {
    pub ino: u64,
    pub size: u64,
    pub mapping: Mapping,
}

impl Inode {
    pub fn new(ino: u64, size: u64, ops: &'static dyn MappingOps) -> Arc<Self> {
        Arc::new(Self {
            ino,
            size,
            mapping: Mapping::new(ops),
        })
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        self.mapping.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::with_ram;

    struct NullOps;

    impl MappingOps for NullOps {
        fn readpage(&self, _inode: &Inode, _index: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
            Ok(0)
        }
    }

    static NULL_OPS: NullOps = NullOps;

    #[test]
    fn create_returns_locked_not_uptodate_page() {
        with_ram(8192, |_| {
            let inode = Inode::new(1, 4096, &NULL_OPS);
            let page = inode.mapping.lookup_or_create(0).unwrap();

            assert!(page.test_flags(PageFlags::LOCKED));
            assert!(page.test_flags(PageFlags::MAPPED));
            assert!(!page.test_flags(PageFlags::UPTODATE));
            // Cache reference + caller reference.
            assert_eq!(page.ref_count(), 2);
            assert_eq!(page.mapping(), &inode.mapping as *const Mapping);

            page.unlock_page();
            page.put_page();
            drop(inode);
        });
    }

    #[test]
    fn second_lookup_returns_the_same_page() {
        with_ram(8192, |_| {
            let inode = Inode::new(2, 3 * 4096, &NULL_OPS);

            let first = inode.mapping.lookup_or_create(1).unwrap();
            let first_pfn = first.pfn();
            first.unlock_page();
            first.put_page();

            let second = inode.mapping.lookup_or_create(1).unwrap();
            assert_eq!(second.pfn(), first_pfn);
            assert_eq!(inode.mapping.len(), 1);
            second.unlock_page();
            second.put_page();
            drop(inode);
        });
    }

    #[test]
    fn distinct_indices_get_distinct_frames() {
        with_ram(8192, |_| {
            let inode = Inode::new(3, 8 * 4096, &NULL_OPS);
            let a = inode.mapping.lookup_or_create(0).unwrap();
            let b = inode.mapping.lookup_or_create(7).unwrap();
            assert_ne!(a.pfn(), b.pfn());
            assert_eq!(inode.mapping.len(), 2);
            for page in [a, b] {
                page.unlock_page();
                page.put_page();
            }
            drop(inode);
        });
    }

    #[test]
    fn remove_releases_the_frame() {
        with_ram(8192, |_| {
            let baseline = buddy::free_frame_count();
            let inode = Inode::new(4, 4096, &NULL_OPS);

            let page = inode.mapping.lookup_or_create(0).unwrap();
            page.unlock_page();
            page.put_page();

            assert!(inode.mapping.remove(0));
            assert!(!inode.mapping.remove(0));
            assert_eq!(inode.mapping.len(), 0);
            drop(inode);
            assert_eq!(buddy::free_frame_count(), baseline);
        });
    }

    #[test]
    fn inode_drop_clears_the_cache() {
        with_ram(8192, |_| {
            let baseline = buddy::free_frame_count();
            {
                let inode = Inode::new(5, 16 * 4096, &NULL_OPS);
                for index in 0..4 {
                    let page = inode.mapping.lookup_or_create(index).unwrap();
                    page.unlock_page();
                    page.put_page();
                }
                assert_eq!(inode.mapping.len(), 4);
            }
            assert_eq!(buddy::free_frame_count(), baseline);
        });
    }
}
