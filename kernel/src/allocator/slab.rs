// kernel/src/allocator/slab.rs
//
// Fixed-size object caches carved from naturally-aligned buddy blocks.
//
// Each slab is one power-of-two-page block.  The header sits at offset 0
// and carries the parent cache, the list links and a LIFO free stack of
// slot indices; object slots follow.  Because slabs are naturally
// aligned, `ptr & !(slab_bytes - 1)` recovers the owning slab in O(1).
//
// A cache keeps four slab lists: empty, partial, full, quarantine.
// Debug builds bracket every object with redzones and fill free objects
// with poison; a mismatch moves the whole slab to quarantine (terminal
// until an explicit purge) and the allocator continues on another slab.
//
// The kmalloc layer at the bottom exposes size-class caches through
// `GlobalAlloc`, with large allocations routed straight to the buddy —
// that is what makes `alloc::{boxed, vec, string}` work kernel-wide.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};

use lazy_static::lazy_static;

use crate::allocator::buddy::{self, GFP_KERNEL};
use crate::errno::Errno;
use crate::memory::page::page_for_phys;
use crate::memory::{phys_to_virt, virt_to_phys, PAGE_SIZE};
use crate::serial_println_raw;
use crate::sync::IrqLock;

pub const MAX_EMPTY_SLABS: usize = 8;

const L1_CACHE_SIZE: usize = 64;
const MIN_OBJECTS_PER_SLAB: usize = 8;
/// Largest slab: 2^3 pages = 32 KiB.
const MAX_SLAB_ORDER: usize = 3;

#[cfg(debug_assertions)]
const REDZONE: usize = 8;
#[cfg(not(debug_assertions))]
const REDZONE: usize = 0;

const POISON_FREE: u8 = 0xDD;
const REDZONE_BYTE: u8 = 0xBB;

pub type ObjectCtor = fn(*mut u8);
pub type ObjectDtor = fn(*mut u8);

// ============================================================================
// Slab header and intrusive lists
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabLocation {
    Empty,
    Partial,
    Full,
    Quarantine,
}

#[repr(C)]
struct SlabHeader {
    cache: *const SlabCache,
    next: *mut SlabHeader,
    prev: *mut SlabHeader,
    location: SlabLocation,
    free_top: u16,
    // LIFO free stack of u16 slot indices follows the header.
}

struct SlabList {
    head: *mut SlabHeader,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    unsafe fn push(&mut self, slab: *mut SlabHeader) {
        (*slab).prev = null_mut();
        (*slab).next = self.head;
        if !self.head.is_null() {
            (*self.head).prev = slab;
        }
        self.head = slab;
        self.len += 1;
    }

    unsafe fn remove(&mut self, slab: *mut SlabHeader) {
        let prev = (*slab).prev;
        let next = (*slab).next;
        if prev.is_null() {
            debug_assert_eq!(self.head, slab);
            self.head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*slab).next = null_mut();
        (*slab).prev = null_mut();
        self.len -= 1;
    }

    unsafe fn pop(&mut self) -> Option<*mut SlabHeader> {
        if self.head.is_null() {
            return None;
        }
        let slab = self.head;
        self.remove(slab);
        Some(slab)
    }
}

struct CacheLists {
    empty: SlabList,
    partial: SlabList,
    full: SlabList,
    quarantine: SlabList,
}

impl CacheLists {
    const fn new() -> Self {
        Self {
            empty: SlabList::new(),
            partial: SlabList::new(),
            full: SlabList::new(),
            quarantine: SlabList::new(),
        }
    }

    fn list_mut(&mut self, location: SlabLocation) -> &mut SlabList {
        match location {
            SlabLocation::Empty => &mut self.empty,
            SlabLocation::Partial => &mut self.partial,
            SlabLocation::Full => &mut self.full,
            SlabLocation::Quarantine => &mut self.quarantine,
        }
    }

    unsafe fn move_slab(&mut self, slab: *mut SlabHeader, to: SlabLocation) {
        let from = (*slab).location;
        if from == to {
            return;
        }
        self.list_mut(from).remove(slab);
        self.list_mut(to).push(slab);
        (*slab).location = to;
    }
}

// ============================================================================
// SlabCache
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    pub num_empty: usize,
    pub num_partial: usize,
    pub num_full: usize,
    pub num_quarantine: usize,
}

pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    object_align: usize,
    /// Object offset inside its slot (left guard area in debug builds).
    slot_pad: usize,
    stride: usize,
    objects_per_slab: usize,
    slab_order: usize,
    slab_bytes: usize,
    objects_offset: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    lists: IrqLock<CacheLists>,
}

unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

impl SlabCache {
    /// Compute the cache geometry.  `align == 0` defaults to the L1 line
    /// size so unaligned callers still get cache-friendly objects.
    pub fn new(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Result<Self, Errno> {
        if size == 0 {
            return Err(Errno::Einval);
        }
        let align = if align == 0 {
            L1_CACHE_SIZE
        } else {
            align.next_power_of_two()
        };
        if align > PAGE_SIZE {
            return Err(Errno::Einval);
        }

        // Slot layout: [guard pad][object][redzone][pad to align].
        // The pad keeps the object aligned while still giving the free
        // path REDZONE guard bytes immediately before the object.
        let slot_pad = if REDZONE > 0 {
            crate::memory::align_up(REDZONE as u64, align as u64) as usize
        } else {
            0
        };
        let stride =
            slot_pad + crate::memory::align_up((size + REDZONE) as u64, align as u64) as usize;

        let mut slab_order = 0;
        let mut objects_per_slab = 0;
        let mut objects_offset = 0;
        for order in 0..=MAX_SLAB_ORDER {
            let (n, off) = Self::objects_in(order, stride, align);
            slab_order = order;
            objects_per_slab = n;
            objects_offset = off;
            if n >= MIN_OBJECTS_PER_SLAB {
                break;
            }
        }
        if objects_per_slab == 0 {
            return Err(Errno::Einval);
        }

        Ok(Self {
            name,
            object_size: size,
            object_align: align,
            slot_pad,
            stride,
            objects_per_slab,
            slab_order,
            slab_bytes: PAGE_SIZE << slab_order,
            objects_offset,
            ctor,
            dtor,
            lists: IrqLock::new(CacheLists::new()),
        })
    }

    /// How many objects fit in a slab of the given order, accounting for
    /// the header and the free stack growing with the object count.
    fn objects_in(order: usize, stride: usize, align: usize) -> (usize, usize) {
        let slab_bytes = PAGE_SIZE << order;
        let header = core::mem::size_of::<SlabHeader>();
        let mut n = (slab_bytes - header) / stride;
        loop {
            if n == 0 {
                return (0, 0);
            }
            let offset = crate::memory::align_up((header + 2 * n) as u64, align as u64) as usize;
            if offset + n * stride <= slab_bytes {
                return (n, offset);
            }
            n -= 1;
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn object_align(&self) -> usize {
        self.object_align
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    // ====================================================================
    // Geometry helpers
    // ====================================================================

    #[inline]
    fn slab_of(&self, obj: *mut u8) -> *mut SlabHeader {
        (obj as usize & !(self.slab_bytes - 1)) as *mut SlabHeader
    }

    #[inline]
    unsafe fn free_stack(&self, slab: *mut SlabHeader) -> *mut u16 {
        (slab as *mut u8).add(core::mem::size_of::<SlabHeader>()) as *mut u16
    }

    #[inline]
    unsafe fn object_at(&self, slab: *mut SlabHeader, idx: usize) -> *mut u8 {
        (slab as *mut u8).add(self.objects_offset + idx * self.stride + self.slot_pad)
    }

    // ====================================================================
    // Alloc
    // ====================================================================

    /// Pop an object, preferring partial slabs, then empty ones, growing
    /// from the buddy as a last resort.  Returns None on ENOMEM.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut lists = self.lists.lock();
        loop {
            let slab = if !lists.partial.is_empty() {
                lists.partial.head
            } else if !lists.empty.is_empty() {
                lists.empty.head
            } else if self.grow(&mut lists) {
                lists.empty.head
            } else {
                return None;
            };

            unsafe {
                let header = &mut *slab;
                debug_assert!(header.free_top > 0);
                header.free_top -= 1;
                let idx = *self.free_stack(slab).add(header.free_top as usize) as usize;
                let obj = self.object_at(slab, idx);

                #[cfg(debug_assertions)]
                if !self.unused_poison_intact(obj) {
                    serial_println_raw!(
                        "slab {}: free-object poison damaged at {:p}, quarantining slab {:p}",
                        self.name,
                        obj,
                        slab
                    );
                    lists.move_slab(slab, SlabLocation::Quarantine);
                    continue;
                }

                if header.free_top == 0 {
                    lists.move_slab(slab, SlabLocation::Full);
                } else if header.location == SlabLocation::Empty {
                    lists.move_slab(slab, SlabLocation::Partial);
                }

                if let Some(ctor) = self.ctor {
                    ctor(obj);
                }
                return NonNull::new(obj);
            }
        }
    }

    // ====================================================================
    // Free
    // ====================================================================

    /// Return an object to its slab.  An object whose slab belongs to a
    /// different cache is a caller bug: it is reported and the memory is
    /// left untouched.
    pub fn free(&self, ptr: NonNull<u8>) {
        let obj = ptr.as_ptr();
        let slab = self.slab_of(obj);

        unsafe {
            if (*slab).cache != self as *const SlabCache {
                serial_println_raw!(
                    "slab {}: object {:p} belongs to another cache, free ignored",
                    self.name,
                    obj
                );
                return;
            }

            let slot_off = obj as usize - (slab as usize + self.objects_offset + self.slot_pad);
            debug_assert_eq!(slot_off % self.stride, 0, "pointer does not hit a slot");
            let idx = slot_off / self.stride;
            debug_assert!(idx < self.objects_per_slab);

            let mut lists = self.lists.lock();

            if let Some(dtor) = self.dtor {
                dtor(obj);
            }

            #[cfg(debug_assertions)]
            if !self.redzones_intact(obj) {
                serial_println_raw!(
                    "slab {}: redzone damaged around {:p}, quarantining slab {:p}",
                    self.name,
                    obj,
                    slab
                );
                lists.move_slab(slab, SlabLocation::Quarantine);
                return;
            }

            #[cfg(debug_assertions)]
            core::ptr::write_bytes(obj, POISON_FREE, self.object_size);

            let header = &mut *slab;
            *self.free_stack(slab).add(header.free_top as usize) = idx as u16;
            header.free_top += 1;

            if header.location == SlabLocation::Quarantine {
                // Quarantined slabs accept frees but never feed allocations.
                return;
            }

            if header.free_top as usize == self.objects_per_slab {
                lists.move_slab(slab, SlabLocation::Empty);
                if lists.empty.len > MAX_EMPTY_SLABS {
                    let excess = lists.empty.pop().unwrap();
                    self.release_slab(excess);
                }
            } else if header.location == SlabLocation::Full {
                lists.move_slab(slab, SlabLocation::Partial);
            }
        }
    }

    // ====================================================================
    // Grow / shrink
    // ====================================================================

    /// Add one slab from the buddy.  Runs under the cache lock; the buddy
    /// takes its own zone lock, never this one.
    fn grow(&self, lists: &mut CacheLists) -> bool {
        let Some(page) = buddy::alloc_pages(GFP_KERNEL, self.slab_order) else {
            serial_println_raw!("slab {}: grow failed (buddy OOM)", self.name);
            return false;
        };
        let base = phys_to_virt(page.phys()).as_mut_ptr::<u8>();
        debug_assert_eq!(
            base as usize & (self.slab_bytes - 1),
            0,
            "slab block not naturally aligned in the direct map"
        );

        unsafe {
            let slab = base as *mut SlabHeader;
            slab.write(SlabHeader {
                cache: self as *const SlabCache,
                next: null_mut(),
                prev: null_mut(),
                location: SlabLocation::Empty,
                free_top: self.objects_per_slab as u16,
            });

            let stack = self.free_stack(slab);
            for i in 0..self.objects_per_slab {
                // Descending indices: the first pop hands out slot 0.
                stack.add(i).write((self.objects_per_slab - 1 - i) as u16);
            }

            #[cfg(debug_assertions)]
            for idx in 0..self.objects_per_slab {
                let obj = self.object_at(slab, idx);
                core::ptr::write_bytes(obj.sub(REDZONE), REDZONE_BYTE, REDZONE);
                core::ptr::write_bytes(obj, POISON_FREE, self.object_size);
                core::ptr::write_bytes(obj.add(self.object_size), REDZONE_BYTE, REDZONE);
            }

            lists.empty.push(slab);
        }
        true
    }

    /// Give one slab back to the buddy.  The slab must already be off
    /// every list.
    fn release_slab(&self, slab: *mut SlabHeader) {
        let page = page_for_phys(virt_to_phys(x86_64::VirtAddr::new(slab as u64)))
            .expect("slab outside mem_map");
        page.set_ref_count(0);
        buddy::free_pages(page, self.slab_order);
    }

    /// Tear the cache down.  All objects must have been freed; live
    /// partial/full slabs are a caller bug.
    pub fn destroy(&self) {
        let mut lists = self.lists.lock();
        debug_assert!(
            lists.partial.is_empty() && lists.full.is_empty(),
            "slab {}: destroy with live objects",
            self.name
        );
        unsafe {
            while let Some(slab) = lists.empty.pop() {
                self.release_slab(slab);
            }
            while let Some(slab) = lists.quarantine.pop() {
                self.release_slab(slab);
            }
        }
    }

    // ====================================================================
    // Debug guards
    // ====================================================================

    #[cfg(debug_assertions)]
    unsafe fn unused_poison_intact(&self, obj: *mut u8) -> bool {
        obj.read() == POISON_FREE && obj.add(self.object_size - 1).read() == POISON_FREE
    }

    #[cfg(debug_assertions)]
    unsafe fn redzones_intact(&self, obj: *mut u8) -> bool {
        for i in 1..=REDZONE {
            if obj.sub(i).read() != REDZONE_BYTE {
                return false;
            }
        }
        for i in 0..REDZONE {
            if obj.add(self.object_size + i).read() != REDZONE_BYTE {
                return false;
            }
        }
        true
    }

    pub fn stats(&self) -> SlabStats {
        let lists = self.lists.lock();
        SlabStats {
            num_empty: lists.empty.len,
            num_partial: lists.partial.len,
            num_full: lists.full.len,
            num_quarantine: lists.quarantine.len,
        }
    }
}

// ============================================================================
// kmalloc — size-class caches behind GlobalAlloc
// ============================================================================

const KMALLOC_SIZES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];
const MAX_KMALLOC_SIZE: usize = 2048;

lazy_static! {
    static ref KMALLOC_CACHES: [SlabCache; 9] = [
        SlabCache::new("kmalloc-8", 8, 8, None, None).unwrap(),
        SlabCache::new("kmalloc-16", 16, 16, None, None).unwrap(),
        SlabCache::new("kmalloc-32", 32, 32, None, None).unwrap(),
        SlabCache::new("kmalloc-64", 64, 64, None, None).unwrap(),
        SlabCache::new("kmalloc-128", 128, 128, None, None).unwrap(),
        SlabCache::new("kmalloc-256", 256, 256, None, None).unwrap(),
        SlabCache::new("kmalloc-512", 512, 512, None, None).unwrap(),
        SlabCache::new("kmalloc-1024", 1024, 1024, None, None).unwrap(),
        SlabCache::new("kmalloc-2048", 2048, 2048, None, None).unwrap(),
    ];
}

fn kmalloc_index(size: usize) -> Option<usize> {
    KMALLOC_SIZES.iter().position(|&s| s >= size)
}

/// Buddy order for a large (over-2048-byte) allocation.
fn order_for_bytes(bytes: usize) -> usize {
    let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    pages.next_power_of_two().trailing_zeros() as usize
}

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align());
        if size > MAX_KMALLOC_SIZE {
            return buddy::alloc_kernel_pages(order_for_bytes(size))
                .map(|va| va.as_mut_ptr::<u8>())
                .unwrap_or(null_mut());
        }
        match kmalloc_index(size) {
            Some(idx) => KMALLOC_CACHES[idx]
                .alloc()
                .map(|p| p.as_ptr())
                .unwrap_or(null_mut()),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        let size = layout.size().max(layout.align());
        if size > MAX_KMALLOC_SIZE {
            buddy::free_kernel_pages(
                x86_64::VirtAddr::new(ptr.as_ptr() as u64),
                order_for_bytes(size),
            );
            return;
        }
        if let Some(idx) = kmalloc_index(size) {
            KMALLOC_CACHES[idx].free(ptr);
        }
    }
}

#[cfg(not(test))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

/// Debug: per-class slab census on the raw writer.
pub fn dump_stats() {
    serial_println_raw!("slab caches:");
    for cache in KMALLOC_CACHES.iter() {
        let stats = cache.stats();
        if stats == SlabStats::default() {
            continue;
        }
        serial_println_raw!(
            "  {:12} ({} B, {}/slab): {} empty, {} partial, {} full, {} quarantined",
            cache.name(),
            cache.object_size(),
            cache.objects_per_slab(),
            stats.num_empty,
            stats.num_partial,
            stats.num_full,
            stats.num_quarantine
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::with_ram;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    const RAM_FRAMES: usize = 8192; // 32 MiB

    #[test]
    fn default_align_is_l1_and_sweep_stays_aligned() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("align-sweep", 24, 0, None, None).unwrap();
            assert_eq!(cache.object_align(), 64);

            let count = cache.objects_per_slab();
            let mut objects = Vec::new();
            for _ in 0..count {
                let obj = cache.alloc().expect("slab alloc");
                assert_eq!(obj.as_ptr() as usize % 64, 0);
                objects.push(obj);
            }

            for obj in objects.drain(..) {
                cache.free(obj);
            }
            let stats = cache.stats();
            assert_eq!(stats.num_empty, 1);
            assert_eq!(stats.num_partial, 0);
            assert_eq!(stats.num_full, 0);

            cache.destroy();
        });
    }

    #[test]
    fn slab_identity_recovers_parent_cache() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("identity", 48, 16, None, None).unwrap();
            let obj = cache.alloc().unwrap();
            let slab = cache.slab_of(obj.as_ptr());
            assert_eq!(unsafe { (*slab).cache }, &cache as *const SlabCache);
            assert_eq!(obj.as_ptr() as usize % cache.object_align(), 0);
            cache.free(obj);
            cache.destroy();
        });
    }

    #[test]
    fn free_then_alloc_is_lifo() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("lifo", 32, 8, None, None).unwrap();
            let a = cache.alloc().unwrap();
            let b = cache.alloc().unwrap();
            cache.free(b);
            let c = cache.alloc().unwrap();
            assert_eq!(b, c, "an idle cache hands back the last freed object");
            cache.free(a);
            cache.free(c);
            cache.destroy();
        });
    }

    #[test]
    fn full_and_partial_transitions() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("transitions", 64, 64, None, None).unwrap();
            let n = cache.objects_per_slab();

            let mut objects: Vec<_> = (0..n).map(|_| cache.alloc().unwrap()).collect();
            assert_eq!(cache.stats().num_full, 1);
            assert_eq!(cache.stats().num_partial, 0);

            cache.free(objects.pop().unwrap());
            assert_eq!(cache.stats().num_full, 0);
            assert_eq!(cache.stats().num_partial, 1);

            for obj in objects.drain(..) {
                cache.free(obj);
            }
            assert_eq!(cache.stats().num_empty, 1);
            cache.destroy();
        });
    }

    #[test]
    fn excess_empty_slabs_return_to_buddy() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("shrink", 128, 128, None, None).unwrap();
            let n = cache.objects_per_slab();
            let slabs = MAX_EMPTY_SLABS + 3;

            let baseline = buddy::free_frame_count();
            let mut objects = Vec::new();
            for _ in 0..slabs * n {
                objects.push(cache.alloc().unwrap());
            }
            for obj in objects.drain(..) {
                cache.free(obj);
            }

            assert_eq!(cache.stats().num_empty, MAX_EMPTY_SLABS);
            cache.destroy();
            assert_eq!(buddy::free_frame_count(), baseline);
        });
    }

    #[test]
    fn wrong_cache_free_is_reported_and_ignored() {
        with_ram(RAM_FRAMES, |_| {
            let a = SlabCache::new("owner", 64, 64, None, None).unwrap();
            let b = SlabCache::new("imposter", 64, 64, None, None).unwrap();

            let obj = a.alloc().unwrap();
            let full_before = a.stats();
            b.free(obj);
            // Nothing moved in either cache.
            assert_eq!(a.stats(), full_before);
            assert_eq!(b.stats(), SlabStats::default());

            a.free(obj);
            a.destroy();
            b.destroy();
        });
    }

    static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
    static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn counting_ctor(_obj: *mut u8) {
        CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn counting_dtor(_obj: *mut u8) {
        DTOR_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn ctor_and_dtor_bracket_object_lifetime() {
        with_ram(RAM_FRAMES, |_| {
            CTOR_RUNS.store(0, Ordering::Relaxed);
            DTOR_RUNS.store(0, Ordering::Relaxed);
            let cache =
                SlabCache::new("ctor-dtor", 40, 8, Some(counting_ctor), Some(counting_dtor))
                    .unwrap();
            let x = cache.alloc().unwrap();
            let y = cache.alloc().unwrap();
            assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), 2);
            cache.free(x);
            assert_eq!(DTOR_RUNS.load(Ordering::Relaxed), 1);
            cache.free(y);
            assert_eq!(DTOR_RUNS.load(Ordering::Relaxed), 2);
            cache.destroy();
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    fn redzone_smash_quarantines_the_slab() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("smash", 32, 8, None, None).unwrap();
            let victim = cache.alloc().unwrap();
            unsafe {
                // Overflow one byte past the object into the redzone.
                victim.as_ptr().add(cache.object_size()).write(0x00);
            }
            cache.free(victim);
            assert_eq!(cache.stats().num_quarantine, 1);

            // The cache keeps working from fresh slabs.
            let survivor = cache.alloc().unwrap();
            cache.free(survivor);
            cache.destroy();
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    fn poison_damage_on_free_object_quarantines_on_alloc() {
        with_ram(RAM_FRAMES, |_| {
            let cache = SlabCache::new("poison", 32, 8, None, None).unwrap();
            let obj = cache.alloc().unwrap();
            cache.free(obj);
            unsafe {
                // Use-after-free: scribble on the freed object.
                obj.as_ptr().write(0x42);
            }
            // The damaged slab is quarantined and another serves the request.
            let fresh = cache.alloc().unwrap();
            assert_eq!(cache.stats().num_quarantine, 1);
            cache.free(fresh);
            cache.destroy();
        });
    }

    #[test]
    fn order_for_large_allocations() {
        assert_eq!(order_for_bytes(4096), 0);
        assert_eq!(order_for_bytes(4097), 1);
        assert_eq!(order_for_bytes(8192), 1);
        assert_eq!(order_for_bytes(3 * 4096), 2);
    }
}
