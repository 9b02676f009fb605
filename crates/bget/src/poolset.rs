//! Pool Sets
//!
//! A pool set binds the boundary-tag allocator to a lock, a list of registered pools and
//! statistics. Every public operation holds the lock for its whole duration, with foreign
//! interrupts masked on the current core.

use core::fmt;
use core::mem::size_of;
use core::panic::Location;
use core::ptr::NonNull;

use sync::{ExceptionMask, NoExceptions, SpinLockXsave};
use utils::{align_down, align_up, ranges_overlap};

use crate::block::{Block, Buf, PoolWalker, HDR_SIZE, SIZE_Q};
use crate::bpool::{block_size, BPoolSet, SearchPolicy};
use crate::config::SIZE_QUANT;
use crate::mdbg;
use crate::stats::MallocStats;

/// Whether allocations carry a debug header and footer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tagging {
    Off,
    /// Each allocation records its call site and is framed by magic values.
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// The pool wraps around the address space.
    InvalidRange,
    /// The pool can not hold its own descriptor.
    TooSmall,
}

/// A registered pool, stored in memory obtained from the pool set itself.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct PoolDesc {
    start: usize,
    len: usize,
}

/// Smallest pool accepted: room for one pool descriptor, its header and the sentinel.
const MIN_POOL_LEN: usize =
    ((size_of::<PoolDesc>() + (SIZE_QUANT - 1)) & !(SIZE_QUANT - 1)) + 2 * HDR_SIZE;

pub struct PoolSet<E: ExceptionMask = NoExceptions> {
    inner: SpinLockXsave<Inner, E>,
    tagging: Tagging,
}

pub(crate) struct Inner {
    pub(crate) bset: BPoolSet,
    /// Address of the pool descriptor array, zero until the first pool is added.
    pools: usize,
    pool_len: usize,
    stats: MallocStats,
}

// ———————————————————————————————— Pool Set ———————————————————————————————— //

impl<E: ExceptionMask> PoolSet<E> {
    pub const fn new(desc: &'static str) -> Self {
        Self::with_options(desc, SearchPolicy::DEFAULT, Tagging::Off)
    }

    pub const fn with_options(desc: &'static str, policy: SearchPolicy, tagging: Tagging) -> Self {
        Self {
            inner: SpinLockXsave::new(Inner {
                bset: BPoolSet::new(policy),
                pools: 0,
                pool_len: 0,
                stats: MallocStats::new(desc),
            }),
            tagging,
        }
    }

    /// Registers a new pool of memory.
    pub fn add_pool(&self, pool: &'static mut [u8]) -> Result<(), PoolError> {
        // SAFETY: the slice is exclusively borrowed for the rest of the program.
        unsafe { self.add_pool_raw(pool.as_mut_ptr() as usize, pool.len()) }
    }

    /// Registers `len` bytes starting at `start` as a new pool.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes and unused by anything else for as long as
    /// the pool set lives.
    #[track_caller]
    pub unsafe fn add_pool_raw(&self, start: usize, len: usize) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        inner.add_pool(start, len, self.tagging, Location::caller())
    }

    #[track_caller]
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let ptr = match self.tagging {
            Tagging::Off => inner.raw_malloc(0, 0, size),
            Tagging::Debug => inner.mdbg_malloc(Location::caller(), size),
        };
        to_non_null(ptr)
    }

    /// Allocates `nmemb * size` zeroed bytes, fails if the product overflows.
    #[track_caller]
    pub fn calloc(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let ptr = match self.tagging {
            Tagging::Off => inner.raw_calloc(0, 0, nmemb, size),
            Tagging::Debug => inner.mdbg_calloc(Location::caller(), nmemb, size),
        };
        to_non_null(ptr)
    }

    /// Allocates `size` bytes aligned on `alignment`, which must be a power of two.
    #[track_caller]
    pub fn memalign(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let ptr = match self.tagging {
            Tagging::Off => inner.raw_memalign(0, 0, alignment, size),
            Tagging::Debug => inner.mdbg_memalign(Location::caller(), alignment, size),
        };
        to_non_null(ptr)
    }

    /// Resizes a buffer, or allocates a new one if `ptr` is `None`.
    ///
    /// On failure the original buffer is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool set and not freed since.
    #[track_caller]
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let ptr = ptr.map(|p| p.as_ptr() as usize);
        let mut inner = self.inner.lock();
        let new = match self.tagging {
            Tagging::Off => inner.raw_realloc(ptr, 0, 0, size),
            Tagging::Debug => inner.mdbg_realloc(Location::caller(), ptr, size),
        };
        to_non_null(new)
    }

    /// Releases a buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool set and not freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        match self.tagging {
            Tagging::Off => inner.raw_free(ptr.as_ptr() as usize),
            Tagging::Debug => inner.mdbg_free(ptr.as_ptr() as usize),
        }
    }

    /// Returns true if `[buf, buf + len)` lies entirely within the payload of one live allocation.
    pub fn buffer_is_within_alloced(&self, buf: *const u8, len: usize) -> bool {
        let inner = self.inner.lock();
        inner.buffer_is_within_alloced(buf as usize, len, self.tagging)
    }

    /// Returns true if `[buf, buf + len)` shares at least one byte with any registered pool.
    pub fn buffer_overlaps_heap(&self, buf: *const u8, len: usize) -> bool {
        let inner = self.inner.lock();
        inner.buffer_overlaps_heap(buf as usize, len)
    }

    pub fn get_stats(&self) -> MallocStats {
        let inner = self.inner.lock();
        MallocStats {
            allocated: inner.bset.totalloc(),
            ..inner.stats
        }
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats.reset();
    }

    /// Checks the consistency of every pool, panics on corruption.
    pub fn validate(&self) {
        self.inner.lock().validate_all();
    }

    /// Verifies the debug tags of every live allocation, logging each of them if `dump` is set.
    pub fn mdbg_check(&self, dump: bool) {
        let inner = self.inner.lock();
        inner.validate_pools();
        if self.tagging == Tagging::Debug {
            inner.mdbg_check(dump);
        }
    }
}

fn to_non_null(ptr: Option<usize>) -> Option<NonNull<u8>> {
    ptr.and_then(|p| NonNull::new(p as *mut u8))
}

// ————————————————————————————— Raw Operations ————————————————————————————— //

impl Inner {
    fn pools(&self) -> &[PoolDesc] {
        if self.pool_len == 0 {
            return &[];
        }
        // SAFETY: the descriptor array is a live allocation holding `pool_len` descriptors.
        unsafe { core::slice::from_raw_parts(self.pools as *const PoolDesc, self.pool_len) }
    }

    /// Validates the pools when validation is enabled at compile time.
    pub(crate) fn validate_pools(&self) {
        if cfg!(feature = "validate") {
            self.validate_all();
        }
    }

    fn validate_all(&self) {
        for pool in self.pools() {
            self.bset.validate_pool(pool.start);
        }
    }

    pub(crate) fn return_hook(&mut self, ptr: Option<usize>, requested: usize) {
        let allocated = self.bset.totalloc();
        self.stats.record(ptr.is_some(), requested, allocated);
    }

    pub(crate) fn raw_malloc(&mut self, hdr_size: usize, ftr_size: usize, pl_size: usize) -> Option<usize> {
        self.validate_pools();

        let ptr = pl_size
            .checked_add(hdr_size)
            .and_then(|s| s.checked_add(ftr_size))
            .and_then(|s| self.bset.bget(s.max(1)));
        self.return_hook(ptr, pl_size);
        ptr
    }

    pub(crate) fn raw_free(&mut self, ptr: usize) {
        self.validate_pools();
        self.bset.brel(ptr);
    }

    pub(crate) fn raw_calloc(
        &mut self,
        hdr_size: usize,
        ftr_size: usize,
        pl_nmemb: usize,
        pl_size: usize,
    ) -> Option<usize> {
        self.validate_pools();

        let ptr = pl_nmemb
            .checked_mul(pl_size)
            .and_then(|s| s.checked_add(hdr_size))
            .and_then(|s| s.checked_add(ftr_size))
            .and_then(|s| self.bset.bgetz(s.max(1)));
        self.return_hook(ptr, pl_nmemb.saturating_mul(pl_size));
        ptr
    }

    pub(crate) fn raw_realloc(
        &mut self,
        ptr: Option<usize>,
        hdr_size: usize,
        ftr_size: usize,
        pl_size: usize,
    ) -> Option<usize> {
        self.validate_pools();

        let new = pl_size
            .checked_add(hdr_size)
            .and_then(|s| s.checked_add(ftr_size))
            .and_then(|s| self.bset.bgetr(ptr, s.max(1)));
        self.return_hook(new, pl_size);
        new
    }

    pub(crate) fn raw_memalign(
        &mut self,
        hdr_size: usize,
        ftr_size: usize,
        alignment: usize,
        size: usize,
    ) -> Option<usize> {
        self.validate_pools();

        if !alignment.is_power_of_two() {
            self.return_hook(None, size);
            return None;
        }

        // Buffers are always aligned on the size quantum
        if alignment <= SIZE_QUANT {
            return self.raw_malloc(hdr_size, ftr_size, size);
        }

        // Enough to move the start forward to the next aligned address and still free the front
        let Some(s) = hdr_size
            .checked_add(ftr_size)
            .and_then(|s| s.checked_add(alignment))
            .and_then(|s| s.checked_add(size))
            .and_then(|s| s.checked_add(SIZE_Q + HDR_SIZE))
        else {
            self.return_hook(None, size);
            return None;
        };

        let Some(mut b) = self.bset.bget(s) else {
            self.return_hook(None, size);
            return None;
        };

        if (b + hdr_size) & (alignment - 1) != 0 {
            let mut p = ((b + hdr_size + alignment) & !(alignment - 1)) - hdr_size;
            if p - b < SIZE_Q + HDR_SIZE {
                p += alignment;
            }
            self.bset.release_front(b, p);
            b = p;
        }
        self.bset.release_back(b, hdr_size + ftr_size + size);

        self.return_hook(Some(b), size);
        Some(b)
    }

    /// Resizes through the tagged or plain path, used for the pool descriptor array.
    fn realloc_unlocked(
        &mut self,
        ptr: Option<usize>,
        size: usize,
        tagging: Tagging,
        location: &'static Location<'static>,
    ) -> Option<usize> {
        match tagging {
            Tagging::Off => self.raw_realloc(ptr, 0, 0, size),
            Tagging::Debug => self.mdbg_realloc(location, ptr, size),
        }
    }

    unsafe fn add_pool(
        &mut self,
        start: usize,
        len: usize,
        tagging: Tagging,
        location: &'static Location<'static>,
    ) -> Result<(), PoolError> {
        let end = start.checked_add(len).ok_or(PoolError::InvalidRange)?;
        let start = align_up(start, SIZE_QUANT).ok_or(PoolError::InvalidRange)?;
        let end = align_down(end, SIZE_QUANT);

        if start >= end || end - start < MIN_POOL_LEN {
            log::debug!("Skipping too small pool");
            return Err(PoolError::TooSmall);
        }

        let count = self.pool_len + 1;
        let desc_size = size_of::<PoolDesc>() * count;
        let old = if self.pool_len == 0 {
            None
        } else {
            Some(self.pools)
        };

        // The descriptor array goes to the registered pools if they have room left, otherwise to
        // the new pool, which must then be able to hold it.
        let mut pools =
            old.and_then(|old| self.realloc_unlocked(Some(old), desc_size, tagging, location));
        if pools.is_none() {
            let raw_size = match tagging {
                Tagging::Off => desc_size,
                Tagging::Debug => mdbg::tagged_size(desc_size),
            };
            match block_size(raw_size) {
                Some(needed) if needed <= end - start - HDR_SIZE => (),
                _ => {
                    log::debug!("Pool can not hold the pool descriptors");
                    return Err(PoolError::TooSmall);
                }
            }
        }

        log::trace!(
            "{}: adding pool [0x{:x}, 0x{:x}]",
            self.stats.desc,
            start,
            end
        );
        self.bset.bpool(start, end - start);

        if pools.is_none() {
            pools = self.realloc_unlocked(old, desc_size, tagging, location);
        }
        let Some(pools) = pools else {
            log::error!("{}: no room to register pool 0x{:x}", self.stats.desc, start);
            panic!("Failed to register pool");
        };

        // SAFETY: the new array holds `count` descriptors, the first `pool_len` were copied over.
        (pools as *mut PoolDesc).add(self.pool_len).write(PoolDesc {
            start,
            len: end - start,
        });
        self.pools = pools;
        self.pool_len = count;
        self.stats.size += end - start;
        Ok(())
    }

    /// Iterates over the payload address of every allocated buffer.
    pub(crate) fn allocated(&self) -> impl Iterator<Item = usize> + '_ {
        self.pools().iter().flat_map(|pool| {
            PoolWalker::new(pool.start).filter_map(|(b, buf)| match buf {
                Buf::Allocated { .. } => Some(b.payload()),
                _ => None,
            })
        })
    }

    fn buffer_is_within_alloced(&self, buf: usize, len: usize, tagging: Tagging) -> bool {
        self.validate_pools();

        let Some(buf_end) = buf.checked_add(len) else {
            return false;
        };
        self.allocated().any(|b| {
            let (start, size) = match tagging {
                Tagging::Off => (b, Block::from_payload(b).bsize().unsigned_abs() - HDR_SIZE),
                Tagging::Debug => mdbg::payload_start_size(b),
            };
            buf >= start && buf_end <= start + size
        })
    }

    fn buffer_overlaps_heap(&self, buf: usize, len: usize) -> bool {
        self.validate_pools();

        let Some(buf_end) = buf.checked_add(len) else {
            // Wrapping buffers should not happen
            return true;
        };
        self.pools()
            .iter()
            .any(|pool| ranges_overlap(buf, buf_end, pool.start, pool.start + pool.len))
    }
}

// ———————————————————————————————— Display ————————————————————————————————— //

impl<E: ExceptionMask> fmt::Display for PoolSet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        for (idx, pool) in inner.pools().iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{{")?;
            for (b, buf) in PoolWalker::new(pool.start) {
                let offset = b.addr() - pool.start;
                let (size, state) = match buf {
                    Buf::Free { size, .. } => (size, "free"),
                    Buf::Allocated { size } => (size, "used"),
                    Buf::End => break,
                };
                if offset > 0 {
                    write!(f, " -> ")?;
                }
                write!(f, "[0x{:x}, 0x{:x} | {}]", offset, offset + size, state)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::snap;

    #[repr(align(16))]
    struct Aligned<const N: usize>([u8; N]);

    fn pool_memory<const N: usize>() -> &'static mut [u8] {
        &mut Box::leak(Box::new(Aligned::<N>([0; N]))).0
    }

    fn pool_set<const N: usize>(policy: SearchPolicy, tagging: Tagging) -> &'static PoolSet {
        let set = Box::leak(Box::new(PoolSet::with_options("test", policy, tagging)));
        set.add_pool(pool_memory::<N>()).unwrap();
        set
    }

    fn plain<const N: usize>() -> &'static PoolSet {
        pool_set::<N>(SearchPolicy::FirstFit, Tagging::Off)
    }

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn pool_layout() {
        let set = plain::<1024>();
        snap("{[0x0, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);

        let stats = set.get_stats();
        assert_eq!(stats.size, 1024);
        assert_eq!(stats.allocated, 32);
        assert_eq!(stats.desc, "test");

        // A second pool grows the descriptor array, which moves to the first pool
        set.add_pool(pool_memory::<1024>()).unwrap();
        snap(
            "{[0x0, 0x3a0 | free] -> [0x3a0, 0x3d0 | used] -> [0x3d0, 0x3f0 | free]}\n{[0x0, 0x3f0 | free]}",
            set,
        );
        assert_eq!(set.get_stats().size, 2048);
        set.validate();
    }

    #[test]
    fn add_too_small_pool() {
        let set: PoolSet = PoolSet::new("small");
        assert_eq!(set.add_pool(pool_memory::<32>()), Err(PoolError::TooSmall));
        assert_eq!(set.get_stats().size, 0);
        assert_eq!(set.malloc(1), None);

        assert_eq!(set.add_pool(pool_memory::<MIN_POOL_LEN>()), Ok(()));
        assert_eq!(set.get_stats().size, MIN_POOL_LEN);
    }

    #[test]
    fn debug_pool_too_small() {
        let set: &'static PoolSet =
            Box::leak(Box::new(PoolSet::with_options("debug", SearchPolicy::FirstFit, Tagging::Debug)));
        // Room for a plain descriptor, not for a tagged one
        assert_eq!(set.add_pool(pool_memory::<64>()), Err(PoolError::TooSmall));
        assert_eq!(set.get_stats().size, 0);
        assert_eq!(set.malloc(1), None);

        set.add_pool(pool_memory::<4096>()).unwrap();
        let p = set.malloc(16).unwrap();
        set.mdbg_check(false);
        unsafe { set.free(p) };
        set.validate();
    }

    #[test]
    fn add_pool_when_full() {
        let set = plain::<1024>();
        let mut live = Vec::new();
        while let Some(p) = set.malloc(16) {
            live.push(p);
        }

        // The grown descriptor array fits neither the full heap nor the new pool
        assert_eq!(set.add_pool(pool_memory::<MIN_POOL_LEN>()), Err(PoolError::TooSmall));
        assert_eq!(set.get_stats().size, 1024);
        set.validate();

        set.add_pool(pool_memory::<128>()).unwrap();
        assert_eq!(set.get_stats().size, 1024 + 128);
        assert!(set.malloc(16).is_some());
        set.validate();

        for p in live {
            unsafe { set.free(p) };
        }
        set.validate();
    }

    #[test]
    fn round_trip() {
        let set = plain::<65536>();
        for size in [0, 1, 15, 16, 17, 100, 1000, 4000, 20000] {
            let before = set.get_stats().allocated;
            let p = set.malloc(size).unwrap();
            assert!(set.get_stats().allocated > before);
            unsafe { set.free(p) };
            assert_eq!(set.get_stats().allocated, before);

            let q = set.malloc(size).unwrap();
            assert_eq!(p, q);
            unsafe { set.free(q) };
        }
        set.validate();
    }

    #[test]
    fn no_overlap() {
        let set = plain::<65536>();
        let mut live = Vec::new();
        for i in 0..64 {
            let size = (i * 37) % 500 + 1;
            live.push((set.malloc(size).unwrap(), size));
        }
        let mut idx = 0;
        live.retain(|(ptr, _)| {
            idx += 1;
            if idx % 3 == 0 {
                unsafe { set.free(*ptr) };
                false
            } else {
                true
            }
        });
        for i in 0..32 {
            let size = (i * 53) % 300 + 1;
            live.push((set.malloc(size).unwrap(), size));
        }

        for (i, (a, a_size)) in live.iter().enumerate() {
            for (b, b_size) in live.iter().skip(i + 1) {
                assert!(!ranges_overlap(
                    addr(*a),
                    addr(*a) + a_size,
                    addr(*b),
                    addr(*b) + b_size
                ));
            }
        }
        set.validate();
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn coalescing() {
        // Release the lower buffer first
        let set = plain::<1024>();
        let a = set.malloc(100).unwrap();
        let b = set.malloc(200).unwrap();
        snap("{[0x0, 0x270 | free] -> [0x270, 0x350 | used] -> [0x350, 0x3d0 | used] -> [0x3d0, 0x3f0 | used]}", set);
        unsafe { set.free(a) };
        snap("{[0x0, 0x270 | free] -> [0x270, 0x350 | used] -> [0x350, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);
        unsafe { set.free(b) };
        snap("{[0x0, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);

        // And the other way around
        let set = plain::<1024>();
        let a = set.malloc(100).unwrap();
        let b = set.malloc(200).unwrap();
        unsafe { set.free(b) };
        snap("{[0x0, 0x350 | free] -> [0x350, 0x3d0 | used] -> [0x3d0, 0x3f0 | used]}", set);
        unsafe { set.free(a) };
        snap("{[0x0, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);
        set.validate();
    }

    #[test]
    fn alignment() {
        let set = plain::<65536>();
        let baseline = set.get_stats().allocated;
        let mut live = Vec::new();

        for align in [32, 64, 128, 4096] {
            for size in [1, 24, 100, 3000] {
                let before = set.get_stats().allocated;
                let p = set.memalign(align, size).unwrap();
                assert_eq!(addr(p) % align, 0);
                assert!(set.buffer_is_within_alloced(p.as_ptr(), size));
                assert!(set.get_stats().allocated - before <= size + 64);
                live.push(p);
            }
        }
        set.validate();

        for p in live {
            unsafe { set.free(p) };
        }
        assert_eq!(set.get_stats().allocated, baseline);

        // Small alignments are plain allocations, others must be powers of two
        let p = set.memalign(8, 10).unwrap();
        assert_eq!(addr(p) % SIZE_QUANT, 0);
        assert_eq!(set.memalign(24, 10), None);
        unsafe { set.free(p) };
        set.validate();
    }

    #[test]
    fn calloc() {
        let set = plain::<4096>();
        assert_eq!(set.calloc(usize::MAX / 2 + 1, 2), None);
        assert_eq!(set.get_stats().num_alloc_fail, 1);

        let p = set.malloc(64).unwrap();
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xff, 64);
            set.free(p);
        }
        let q = set.calloc(8, 8).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn stats() {
        let set = plain::<1024>();
        let p = set.malloc(500).unwrap();
        assert_eq!(set.malloc(2000), None);

        let stats = set.get_stats();
        assert_eq!(stats.num_alloc_fail, 1);
        assert_eq!(stats.biggest_alloc_fail, 2000);
        assert_eq!(stats.biggest_alloc_fail_used, stats.allocated);
        assert_eq!(stats.max_allocated, stats.allocated);

        unsafe { set.free(p) };
        let stats = set.get_stats();
        assert!(stats.max_allocated > stats.allocated);

        set.reset_stats();
        let stats = set.get_stats();
        assert_eq!(stats.max_allocated, 0);
        assert_eq!(stats.num_alloc_fail, 0);
        assert_eq!(stats.biggest_alloc_fail, 0);
        assert_eq!(stats.size, 1024);
    }

    #[test]
    fn failed_attempts_are_recorded() {
        let set = plain::<4096>();
        assert_eq!(set.memalign(24, 10), None);
        assert_eq!(set.memalign(4096, usize::MAX - 100), None);
        let stats = set.get_stats();
        assert_eq!(stats.num_alloc_fail, 2);
        assert_eq!(stats.biggest_alloc_fail, usize::MAX - 100);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn failed_tagged_attempts_are_recorded() {
        let set = pool_set::<4096>(SearchPolicy::FirstFit, Tagging::Debug);
        let huge = u32::MAX as usize + 1;
        assert_eq!(set.malloc(huge), None);
        assert_eq!(set.calloc(huge, 1), None);
        assert_eq!(set.memalign(64, huge), None);
        assert_eq!(unsafe { set.realloc(None, huge) }, None);
        let stats = set.get_stats();
        assert_eq!(stats.num_alloc_fail, 4);
        assert_eq!(stats.biggest_alloc_fail, huge);
    }

    #[test]
    fn concurrent_use() {
        let set = plain::<65536>();
        let baseline = set.get_stats().allocated;

        std::thread::scope(|scope| {
            for t in 0..8 {
                scope.spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..200 {
                        let size = (i * 31 + t * 7) % 200 + 1;
                        if let Some(p) = set.malloc(size) {
                            unsafe { core::ptr::write_bytes(p.as_ptr(), t as u8, size) };
                            live.push((p, size));
                        }
                        if i % 3 == 0 {
                            if let Some((p, size)) = live.pop() {
                                let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                                assert!(bytes.iter().all(|b| *b == t as u8));
                                match unsafe { set.realloc(Some(p), size * 2) } {
                                    Some(q) => unsafe { set.free(q) },
                                    None => unsafe { set.free(p) },
                                }
                            }
                        }
                    }
                    for (p, _) in live {
                        unsafe { set.free(p) };
                    }
                });
            }
        });

        set.validate();
        assert_eq!(set.get_stats().allocated, baseline);
    }

    #[test]
    fn within_and_overlap() {
        let memory = pool_memory::<1024>();
        let (pool_start, pool_len) = (memory.as_ptr(), memory.len());
        let set: &'static PoolSet = Box::leak(Box::new(PoolSet::new("test")));
        set.add_pool(memory).unwrap();

        let p = set.malloc(64).unwrap();
        assert!(set.buffer_is_within_alloced(p.as_ptr(), 64));
        assert!(!set.buffer_is_within_alloced(p.as_ptr(), 65));
        assert!(set.buffer_is_within_alloced(unsafe { p.as_ptr().add(8) }, 56));

        let local = [0u8; 16];
        assert!(!set.buffer_is_within_alloced(local.as_ptr(), 16));
        assert!(!set.buffer_is_within_alloced(usize::MAX as *const u8, 16));

        assert!(set.buffer_overlaps_heap(pool_start, 1));
        assert!(set.buffer_overlaps_heap(pool_start, pool_len));
        assert!(!set.buffer_overlaps_heap(local.as_ptr(), 16));
        assert!(set.buffer_overlaps_heap((usize::MAX - 1) as *const u8, 16));

        unsafe { set.free(p) };
        assert!(!set.buffer_is_within_alloced(p.as_ptr(), 1));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn realloc() {
        let set = plain::<1024>();
        let a = set.malloc(64).unwrap();
        let b = set.malloc(64).unwrap();
        unsafe {
            set.free(a);
            for i in 0..64 {
                *b.as_ptr().add(i) = i as u8;
            }
        }
        snap("{[0x0, 0x330 | free] -> [0x330, 0x380 | used] -> [0x380, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);

        // Grows into the free block that follows
        let grown = unsafe { set.realloc(Some(b), 100) }.unwrap();
        assert_eq!(grown, b);
        snap("{[0x0, 0x330 | free] -> [0x330, 0x3b0 | used] -> [0x3b0, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);

        // Shrinks in place
        let shrunk = unsafe { set.realloc(Some(b), 16) }.unwrap();
        assert_eq!(shrunk, b);
        snap("{[0x0, 0x330 | free] -> [0x330, 0x350 | used] -> [0x350, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);

        // Too big, the buffer is left untouched
        assert_eq!(unsafe { set.realloc(Some(b), 2000) }, None);
        snap("{[0x0, 0x330 | free] -> [0x330, 0x350 | used] -> [0x350, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);

        // Moves
        let moved = unsafe { set.realloc(Some(b), 600) }.unwrap();
        assert_ne!(moved, b);
        snap("{[0x0, 0xc0 | free] -> [0xc0, 0x330 | used] -> [0x330, 0x3d0 | free] -> [0x3d0, 0x3f0 | used]}", set);
        let bytes = unsafe { core::slice::from_raw_parts(moved.as_ptr(), 16) };
        assert_eq!(bytes, &(0..16).collect::<Vec<u8>>()[..]);
        set.validate();
    }

    #[test]
    fn best_fit() {
        fn fragment(set: &PoolSet) -> NonNull<u8> {
            let x1 = set.malloc(200).unwrap();
            let _g1 = set.malloc(16).unwrap();
            let x2 = set.malloc(64).unwrap();
            let _g2 = set.malloc(16).unwrap();
            unsafe {
                set.free(x1);
                set.free(x2);
            }
            x2
        }

        let set = pool_set::<1024>(SearchPolicy::FirstFit, Tagging::Off);
        let hole = fragment(set);
        assert_ne!(set.malloc(48).unwrap(), hole);

        let set = pool_set::<1024>(SearchPolicy::BestFit, Tagging::Off);
        let hole = fragment(set);
        assert_eq!(set.malloc(48).unwrap(), hole);
        set.validate();
    }

    #[test]
    #[should_panic]
    fn double_free() {
        let set = plain::<1024>();
        let a = set.malloc(32).unwrap();
        let _b = set.malloc(32).unwrap();
        unsafe {
            set.free(a);
            set.free(a);
        }
    }

    #[test]
    fn debug_tags() {
        let set = pool_set::<4096>(SearchPolicy::FirstFit, Tagging::Debug);
        let p = set.malloc(10).unwrap();
        assert!(set.buffer_is_within_alloced(p.as_ptr(), 10));
        assert!(!set.buffer_is_within_alloced(p.as_ptr(), 11));
        set.mdbg_check(true);

        unsafe {
            for i in 0..10 {
                *p.as_ptr().add(i) = i as u8;
            }
        }
        let q = unsafe { set.realloc(Some(p), 200) }.unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 10) };
        assert_eq!(bytes, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        set.mdbg_check(false);

        let z = set.calloc(4, 4).unwrap();
        let a = set.memalign(64, 20).unwrap();
        assert_eq!(addr(a) % 64, 0);
        set.mdbg_check(true);
        unsafe {
            set.free(q);
            set.free(z);
            set.free(a);
        }
        set.validate();
    }

    #[test]
    #[should_panic]
    fn debug_tags_corruption() {
        let set = pool_set::<4096>(SearchPolicy::FirstFit, Tagging::Debug);
        let p = set.malloc(10).unwrap();
        unsafe {
            // The footer starts right after the 4-byte-rounded payload
            *p.as_ptr().add(12) = 0;
            set.free(p);
        }
    }

    #[test]
    #[cfg(feature = "validate")]
    #[should_panic]
    fn write_after_free() {
        let set = plain::<1024>();
        let a = set.malloc(64).unwrap();
        let _b = set.malloc(64).unwrap();
        unsafe {
            set.free(a);
            *a.as_ptr().add(32) = 0;
        }
        set.validate();
    }
}
