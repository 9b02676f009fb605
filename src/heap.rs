//! Kernel heaps
//!
//! The TEE core allocates from two independent pool sets: `malloc` for general use, and `kmalloc`
//! for the guest bookkeeping, which must not be reachable from any guest context.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

#[cfg(feature = "stats")]
use bget::MallocStats;
use bget::{PoolError, PoolSet, SearchPolicy, Tagging, SIZE_QUANT};
use sync::ExceptionMask;

const TAGGING: Tagging = if cfg!(feature = "mdbg") {
    Tagging::Debug
} else {
    Tagging::Off
};

pub struct KernelHeaps<E: ExceptionMask> {
    malloc: PoolSet<E>,
    kmalloc: PoolSet<E>,
}

impl<E: ExceptionMask> KernelHeaps<E> {
    pub const fn new() -> Self {
        Self {
            malloc: PoolSet::with_options("malloc", SearchPolicy::DEFAULT, TAGGING),
            kmalloc: PoolSet::with_options("kmalloc", SearchPolicy::DEFAULT, TAGGING),
        }
    }

    pub fn malloc(&self) -> &PoolSet<E> {
        &self.malloc
    }

    pub fn kmalloc(&self) -> &PoolSet<E> {
        &self.kmalloc
    }

    pub fn malloc_add_pool(&self, pool: &'static mut [u8]) -> Result<(), PoolError> {
        log::trace!("malloc: new pool of 0x{:x} bytes", pool.len());
        self.malloc.add_pool(pool)
    }

    pub fn kmalloc_add_pool(&self, pool: &'static mut [u8]) -> Result<(), PoolError> {
        log::trace!("kmalloc: new pool of 0x{:x} bytes", pool.len());
        self.kmalloc.add_pool(pool)
    }

    #[cfg(feature = "stats")]
    pub fn malloc_stats(&self) -> MallocStats {
        self.malloc.get_stats()
    }

    #[cfg(feature = "stats")]
    pub fn kmalloc_stats(&self) -> MallocStats {
        self.kmalloc.get_stats()
    }

    #[cfg(feature = "stats")]
    pub fn reset_stats(&self) {
        self.malloc.reset_stats();
        self.kmalloc.reset_stats();
    }

    /// Checks both heaps, and the debug tags of every allocation when they are enabled.
    pub fn mdbg_check(&self, dump: bool) {
        self.malloc.mdbg_check(dump);
        self.kmalloc.mdbg_check(dump);
    }
}

// ————————————————————————————— Global Allocator ——————————————————————————— //

/// Serves the `alloc` crate from a pool set.
pub struct HeapAllocator<E: ExceptionMask + 'static> {
    heap: &'static PoolSet<E>,
}

impl<E: ExceptionMask> HeapAllocator<E> {
    pub const fn new(heap: &'static PoolSet<E>) -> Self {
        Self { heap }
    }
}

fn as_ptr(ptr: Option<NonNull<u8>>) -> *mut u8 {
    ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
}

unsafe impl<E: ExceptionMask> GlobalAlloc for HeapAllocator<E> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        as_ptr(self.heap.memalign(layout.align(), layout.size()))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SIZE_QUANT {
            return as_ptr(self.heap.calloc(1, layout.size()));
        }
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.heap.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Plain allocations are always aligned on the size quantum
        if layout.align() <= SIZE_QUANT {
            return as_ptr(self.heap.realloc(NonNull::new(ptr), new_size));
        }

        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;
    use sync::NoExceptions;

    #[repr(align(64))]
    struct Aligned([u8; 0x4000]);

    fn pool() -> &'static mut [u8] {
        &mut Box::leak(Box::new(Aligned([0; 0x4000]))).0
    }

    fn heaps() -> &'static KernelHeaps<NoExceptions> {
        let heaps = Box::leak(Box::new(KernelHeaps::new()));
        heaps.malloc_add_pool(pool()).unwrap();
        heaps.kmalloc_add_pool(pool()).unwrap();
        heaps
    }

    #[test]
    fn independent_heaps() {
        let heaps = heaps();
        let malloc = heaps.malloc().get_stats().allocated;
        let kmalloc = heaps.kmalloc().get_stats().allocated;

        let ptr = heaps.kmalloc().malloc(64).unwrap();
        assert!(heaps.kmalloc().buffer_is_within_alloced(ptr.as_ptr(), 64));
        assert!(!heaps.malloc().buffer_overlaps_heap(ptr.as_ptr(), 64));
        assert!(heaps.kmalloc().get_stats().allocated > kmalloc);
        assert_eq!(heaps.malloc().get_stats().allocated, malloc);

        unsafe { heaps.kmalloc().free(ptr) };
        assert_eq!(heaps.kmalloc().get_stats().allocated, kmalloc);
        heaps.mdbg_check(false);
    }

    #[test]
    fn global_alloc() {
        let heaps = heaps();
        let baseline = heaps.malloc().get_stats().allocated;
        let allocator = HeapAllocator::new(heaps.malloc());

        unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let ptr = allocator.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            assert!(core::slice::from_raw_parts(ptr, 100).iter().all(|b| *b == 0));
            ptr::write_bytes(ptr, 0x42, 100);

            let ptr = allocator.realloc(ptr, layout, 400);
            assert!(!ptr.is_null());
            assert!(core::slice::from_raw_parts(ptr, 100).iter().all(|b| *b == 0x42));
            allocator.dealloc(ptr, Layout::from_size_align(400, 8).unwrap());

            let layout = Layout::from_size_align(100, 256).unwrap();
            let ptr = allocator.alloc(layout);
            assert_eq!(ptr as usize % 256, 0);
            ptr::write_bytes(ptr, 0x17, 100);
            let ptr = allocator.realloc(ptr, layout, 50);
            assert_eq!(ptr as usize % 256, 0);
            assert!(core::slice::from_raw_parts(ptr, 50).iter().all(|b| *b == 0x17));
            allocator.dealloc(ptr, Layout::from_size_align(50, 256).unwrap());

            // Larger than the pool
            let huge = Layout::from_size_align(0x10000, 8).unwrap();
            assert!(allocator.alloc(huge).is_null());
        }
        assert_eq!(heaps.malloc().get_stats().allocated, baseline);
    }

    #[cfg(feature = "stats")]
    #[test]
    fn stats() {
        let heaps = heaps();
        assert_eq!(heaps.malloc().malloc(0x8000), None);
        assert_eq!(heaps.malloc_stats().num_alloc_fail, 1);
        assert_eq!(heaps.malloc_stats().biggest_alloc_fail, 0x8000);
        assert_eq!(heaps.kmalloc_stats().num_alloc_fail, 0);

        heaps.reset_stats();
        assert_eq!(heaps.malloc_stats().num_alloc_fail, 0);
    }
}
