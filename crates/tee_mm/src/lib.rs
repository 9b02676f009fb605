//! Physical Region Allocator
//!
//! Hands out extents of a flat range of secure physical memory. The free space is tracked as a
//! list of extents sorted by address, each node stored in a statically sized arena. Released
//! extents are merged with their free neighbours.
//!
//! Free ranges are never adjacent, so two of them are always separated by at least one extent
//! still handed out. Capping the number of outstanding extents below the arena size therefore
//! guarantees that releasing an extent always finds a node for it.
#![cfg_attr(not(test), no_std)]

use core::fmt;

use arena::{GenArena, Handle};
use utils::{align_down, align_up, PhysAddr};

/// Maximum number of disjoint free ranges tracked by a pool.
pub const NB_FREE_EXTENTS: usize = 128;

/// Maximum number of extents handed out at once.
pub const MAX_EXTENTS: usize = NB_FREE_EXTENTS - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmError {
    /// The range is empty, misaligned or outside of the pool.
    InvalidRange,
    OutOfMemory,
    /// Part of the requested range is already allocated.
    Overlap,
    /// Part of the released extent is already free.
    NotOwned,
}

// ———————————————————————————————— Extents ————————————————————————————————— //

/// An allocated range of physical memory.
///
/// Extents can not be copied, they are consumed when returned to the pool they came from.
#[derive(Debug, PartialEq, Eq)]
pub struct Extent {
    start: usize,
    size: usize,
}

impl Extent {
    pub fn start(&self) -> PhysAddr {
        PhysAddr::new(self.start)
    }

    pub fn end(&self) -> PhysAddr {
        PhysAddr::new(self.start + self.size)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

struct FreeRange {
    start: usize,
    end: usize,
    next: Option<Handle<FreeRange>>,
}

impl FreeRange {
    fn size(&self) -> usize {
        self.end - self.start
    }
}

// ————————————————————————————————— TeeMm —————————————————————————————————— //

pub struct TeeMm {
    lo: usize,
    hi: usize,
    shift: usize,
    free: GenArena<FreeRange, NB_FREE_EXTENTS>,
    head: Option<Handle<FreeRange>>,
    /// Extents handed out and not released yet, leaked ones included.
    outstanding: usize,
}

impl TeeMm {
    /// An empty pool, every allocation fails until [TeeMm::init] is called.
    pub const fn new() -> Self {
        Self {
            lo: 0,
            hi: 0,
            shift: 0,
            free: GenArena::new(),
            head: None,
            outstanding: 0,
        }
    }

    /// Resets the pool to cover `[lo, hi)`, handing out extents in units of `1 << shift` bytes.
    pub fn init(&mut self, lo: PhysAddr, hi: PhysAddr, shift: usize) -> Result<(), MmError> {
        let granule = 1usize.checked_shl(shift as u32).ok_or(MmError::InvalidRange)?;
        if lo >= hi || !lo.is_aligned(granule) || !hi.is_aligned(granule) {
            log::error!("Invalid extent pool [{}, {}]", lo, hi);
            return Err(MmError::InvalidRange);
        }

        log::trace!("Extent pool [{}, {}], granule 0x{:x}", lo, hi, granule);
        self.free = GenArena::new();
        self.lo = lo.as_usize();
        self.hi = hi.as_usize();
        self.shift = shift;
        self.outstanding = 0;
        let range = FreeRange {
            start: self.lo,
            end: self.hi,
            next: None,
        };
        self.head = Some(self.free.insert(range).ok_or(MmError::OutOfMemory)?);
        Ok(())
    }

    pub fn granule(&self) -> usize {
        1 << self.shift
    }

    pub fn bytes_free(&self) -> usize {
        self.iter().map(|(_, range)| range.size()).sum()
    }

    /// Allocates `size` bytes, rounded up to the granule, at the lowest free address that fits.
    pub fn alloc(&mut self, size: usize) -> Result<Extent, MmError> {
        if size == 0 {
            return Err(MmError::InvalidRange);
        }
        let size = align_up(size, self.granule()).ok_or(MmError::OutOfMemory)?;
        self.check_outstanding()?;

        let mut previous = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let range = &mut self.free[handle];
            if range.size() >= size {
                let start = range.start;
                range.start += size;
                if range.start == range.end {
                    self.unlink(previous, handle);
                }
                log::trace!("Allocated extent [0x{:x}, 0x{:x}]", start, start + size);
                self.outstanding += 1;
                return Ok(Extent { start, size });
            }
            previous = cursor;
            cursor = range.next;
        }

        log::trace!("No free extent of 0x{:x} bytes", size);
        Err(MmError::OutOfMemory)
    }

    /// Allocates exactly the granules covering `[start, start + size)`.
    pub fn alloc_at(&mut self, start: PhysAddr, size: usize) -> Result<Extent, MmError> {
        let (start, end) = self.covering(start.as_usize(), size)?;
        self.check_outstanding()?;

        let mut previous = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let range = &self.free[handle];
            if range.start <= start && end <= range.end {
                break;
            }
            if range.start >= end {
                cursor = None;
                break;
            }
            previous = cursor;
            cursor = range.next;
        }
        let Some(handle) = cursor else {
            log::trace!("Extent [0x{:x}, 0x{:x}] is not free", start, end);
            return Err(MmError::Overlap);
        };

        let range = &mut self.free[handle];
        match (range.start == start, range.end == end) {
            (true, true) => self.unlink(previous, handle),
            (true, false) => range.start = end,
            (false, true) => range.end = start,
            (false, false) => {
                // Split, the second half goes after the current range
                let second_half = FreeRange {
                    start: end,
                    end: range.end,
                    next: range.next,
                };
                let second_half = self.free.insert(second_half).ok_or(MmError::OutOfMemory)?;
                let range = &mut self.free[handle];
                range.end = start;
                range.next = Some(second_half);
            }
        }

        log::trace!("Allocated extent [0x{:x}, 0x{:x}]", start, end);
        self.outstanding += 1;
        Ok(Extent {
            start,
            size: end - start,
        })
    }

    /// Returns an extent to the pool.
    pub fn free(&mut self, extent: Extent) -> Result<(), MmError> {
        let (start, end) = (extent.start, extent.start + extent.size);
        if start < self.lo || end > self.hi || start >= end {
            log::error!("Extent [0x{:x}, 0x{:x}] is not part of the pool", start, end);
            return Err(MmError::InvalidRange);
        }

        // Find the last free range below the extent
        let mut previous = None;
        let mut next = self.head;
        while let Some(handle) = next {
            let range = &self.free[handle];
            if range.start >= start {
                break;
            }
            previous = next;
            next = range.next;
        }

        let merge_previous = match previous {
            Some(handle) if self.free[handle].end > start => return Err(self.not_owned(start, end)),
            Some(handle) => self.free[handle].end == start,
            None => false,
        };
        let merge_next = match next {
            Some(handle) if self.free[handle].start < end => return Err(self.not_owned(start, end)),
            Some(handle) => self.free[handle].start == end,
            None => false,
        };

        log::trace!("Releasing extent [0x{:x}, 0x{:x}]", start, end);
        match (previous, next, merge_previous, merge_next) {
            (Some(previous), Some(next), true, true) => {
                let next_range = self.free.remove(next).ok_or(MmError::OutOfMemory)?;
                let range = &mut self.free[previous];
                range.end = next_range.end;
                range.next = next_range.next;
            }
            (Some(previous), _, true, false) => self.free[previous].end = end,
            (_, Some(next), false, true) => self.free[next].start = start,
            _ => {
                let range = FreeRange { start, end, next };
                let handle = self.free.insert(range).ok_or(MmError::OutOfMemory)?;
                match previous {
                    Some(previous) => self.free[previous].next = Some(handle),
                    None => self.head = Some(handle),
                }
            }
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        Ok(())
    }

    fn check_outstanding(&self) -> Result<(), MmError> {
        if self.outstanding >= MAX_EXTENTS {
            log::trace!("Too many extents handed out");
            return Err(MmError::OutOfMemory);
        }
        Ok(())
    }

    /// Rounds `[start, start + size)` out to the granule, checking it is part of the pool.
    fn covering(&self, start: usize, size: usize) -> Result<(usize, usize), MmError> {
        let end = start.checked_add(size).ok_or(MmError::InvalidRange)?;
        let granule = self.granule();
        let start = align_down(start, granule);
        let end = align_up(end, granule).ok_or(MmError::InvalidRange)?;
        if size == 0 || start < self.lo || end > self.hi {
            log::error!(
                "Extent [0x{:x}, 0x{:x}] outside of pool [0x{:x}, 0x{:x}]",
                start,
                end,
                self.lo,
                self.hi
            );
            return Err(MmError::InvalidRange);
        }
        Ok((start, end))
    }

    fn not_owned(&self, start: usize, end: usize) -> MmError {
        log::error!("Extent [0x{:x}, 0x{:x}] overlaps free memory", start, end);
        MmError::NotOwned
    }

    fn unlink(&mut self, previous: Option<Handle<FreeRange>>, handle: Handle<FreeRange>) {
        let next = self.free[handle].next;
        match previous {
            Some(previous) => self.free[previous].next = next,
            None => self.head = next,
        }
        self.free.remove(handle);
    }

    fn iter(&self) -> FreeRangeIterator<'_> {
        FreeRangeIterator {
            pool: self,
            next: self.head,
        }
    }
}

impl Default for TeeMm {
    fn default() -> Self {
        Self::new()
    }
}

// ———————————————————————————————— Iterator ———————————————————————————————— //

struct FreeRangeIterator<'a> {
    pool: &'a TeeMm,
    next: Option<Handle<FreeRange>>,
}

impl<'a> Iterator for FreeRangeIterator<'a> {
    type Item = (Handle<FreeRange>, &'a FreeRange);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.next?;
        let range = &self.pool.free[handle];
        self.next = range.next;
        Some((handle, range))
    }
}

// ———————————————————————————————— Display ————————————————————————————————— //

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}, 0x{:x}]", self.start, self.start + self.size)
    }
}

impl fmt::Display for TeeMm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (_, range) in self.iter() {
            write!(f, "[0x{:x}, 0x{:x}]", range.start, range.end)?;
            if range.next.is_some() {
                write!(f, " -> ")?;
            }
        }
        write!(f, "}}")
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    /// Snapshot testing
    ///
    /// Checks that the given struct matches the provided snapshot.
    fn snap<T: core::fmt::Display>(snap: &str, obj: T) {
        assert_eq!(snap, &format!("{}", obj));
    }

    const MIB: usize = 0x10_0000;

    fn pool() -> TeeMm {
        let mut pool = TeeMm::new();
        pool.init(PhysAddr::new(0x1000_0000), PhysAddr::new(0x1000_0000 + 64 * MIB), 12)
            .unwrap();
        pool
    }

    #[test]
    fn init() {
        let mut pool = TeeMm::new();
        assert_eq!(pool.alloc(0x1000), Err(MmError::OutOfMemory));
        assert_eq!(
            pool.init(PhysAddr::new(0x2000), PhysAddr::new(0x1000), 12),
            Err(MmError::InvalidRange)
        );
        assert_eq!(
            pool.init(PhysAddr::new(0x1800), PhysAddr::new(0x4000), 12),
            Err(MmError::InvalidRange)
        );

        let pool = self::pool();
        snap("{[0x10000000, 0x14000000]}", &pool);
        assert_eq!(pool.bytes_free(), 64 * MIB);
        assert_eq!(pool.granule(), 0x1000);
    }

    #[test]
    fn alloc() {
        let mut pool = pool();
        let a = pool.alloc(0x1000).unwrap();
        snap("[0x10000000, 0x10001000]", &a);

        // Sizes are rounded up to the granule
        let b = pool.alloc(0x1001).unwrap();
        snap("[0x10001000, 0x10003000]", &b);
        snap("{[0x10003000, 0x14000000]}", &pool);

        assert_eq!(pool.alloc(0), Err(MmError::InvalidRange));
        assert_eq!(pool.alloc(64 * MIB), Err(MmError::OutOfMemory));

        pool.free(a).unwrap();
        snap("{[0x10000000, 0x10001000] -> [0x10003000, 0x14000000]}", &pool);

        // The lowest fit is picked
        let c = pool.alloc(0x1000).unwrap();
        snap("[0x10000000, 0x10001000]", &c);
        let d = pool.alloc(0x2000).unwrap();
        snap("[0x10003000, 0x10005000]", &d);

        pool.free(b).unwrap();
        pool.free(d).unwrap();
        pool.free(c).unwrap();
        snap("{[0x10000000, 0x14000000]}", &pool);
    }

    #[test]
    fn alloc_at() {
        let mut pool = pool();
        let reserved = pool.alloc_at(PhysAddr::new(0x1100_0000), 4 * MIB).unwrap();
        snap("{[0x10000000, 0x11000000] -> [0x11400000, 0x14000000]}", &pool);
        assert_eq!(pool.bytes_free(), 60 * MIB);

        // Already allocated, or outside of the pool
        assert_eq!(
            pool.alloc_at(PhysAddr::new(0x1120_0000), 0x1000),
            Err(MmError::Overlap)
        );
        assert_eq!(
            pool.alloc_at(PhysAddr::new(0x10ff_f000), 0x2000),
            Err(MmError::Overlap)
        );
        assert_eq!(
            pool.alloc_at(PhysAddr::new(0x0fff_f000), 0x2000),
            Err(MmError::InvalidRange)
        );
        assert_eq!(
            pool.alloc_at(PhysAddr::new(0x13ff_f000), 0x2000),
            Err(MmError::InvalidRange)
        );

        // Unaligned requests cover whole granules
        let head = pool.alloc_at(PhysAddr::new(0x1000_0800), 0x1000).unwrap();
        snap("[0x10000000, 0x10002000]", &head);
        let tail = pool.alloc_at(PhysAddr::new(0x13ff_f000), 0x1000).unwrap();
        snap(
            "{[0x10002000, 0x11000000] -> [0x11400000, 0x13fff000]}",
            &pool,
        );

        // Allocations skip the reserved range
        let big = pool.alloc(20 * MIB).unwrap();
        snap("[0x11400000, 0x12800000]", &big);

        pool.free(reserved).unwrap();
        pool.free(head).unwrap();
        pool.free(tail).unwrap();
        pool.free(big).unwrap();
        snap("{[0x10000000, 0x14000000]}", &pool);
    }

    #[test]
    fn free_errors() {
        let mut pool = pool();
        let a = pool.alloc(0x2000).unwrap();

        // Forged extents
        let outside = Extent {
            start: 0x2000_0000,
            size: 0x1000,
        };
        assert_eq!(pool.free(outside), Err(MmError::InvalidRange));
        let already_free = Extent {
            start: 0x1000_1000,
            size: 0x2000,
        };
        assert_eq!(pool.free(already_free), Err(MmError::NotOwned));

        pool.free(a).unwrap();
        snap("{[0x10000000, 0x14000000]}", &pool);
    }

    #[test]
    fn reuse_after_free() {
        let mut pool = pool();
        let mut extents = Vec::new();
        for _ in 0..4 {
            extents.push(pool.alloc(MIB).unwrap());
        }
        let second = extents.remove(1);
        let start = second.start();
        pool.free(second).unwrap();
        snap(
            "{[0x10100000, 0x10200000] -> [0x10400000, 0x14000000]}",
            &pool,
        );
        assert_eq!(pool.alloc(MIB).unwrap().start(), start);
    }

    #[test]
    fn scattered_frees() {
        let mut pool = pool();
        let mut extents = Vec::new();
        while let Ok(extent) = pool.alloc(0x1000) {
            extents.push(extent);
        }
        assert_eq!(extents.len(), MAX_EXTENTS);
        let free = pool.bytes_free();
        assert_eq!(free, 64 * MIB - MAX_EXTENTS * 0x1000);

        // Every other page, each release needs a range of its own
        let mut kept = Vec::new();
        for (idx, extent) in extents.into_iter().enumerate() {
            if idx % 2 == 0 {
                pool.free(extent).unwrap();
            } else {
                kept.push(extent);
            }
        }
        assert_eq!(pool.bytes_free(), free + MAX_EXTENTS.div_ceil(2) * 0x1000);

        for extent in kept {
            pool.free(extent).unwrap();
        }
        snap("{[0x10000000, 0x14000000]}", &pool);
    }

    #[test]
    fn leaked_extents_count() {
        let mut pool = pool();
        for _ in 0..MAX_EXTENTS {
            // Carved out for good, from the top
            let top = PhysAddr::new(0x1000_0000 + pool.bytes_free() - 0x1000);
            let _leaked = pool.alloc_at(top, 0x1000).unwrap();
        }
        assert_eq!(pool.alloc(0x1000), Err(MmError::OutOfMemory));
        assert_eq!(pool.bytes_free(), 64 * MIB - MAX_EXTENTS * 0x1000);
    }
}
