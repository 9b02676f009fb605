//! Boundary-tag allocator
//!
//! The core of the allocator: buffers are carved out of free blocks, released buffers are merged
//! with their free neighbours, and free blocks are kept in a circular doubly linked list anchored
//! in the [BPoolSet] itself. A link equal to [ANCHOR] designates the anchor, which keeps the pool
//! set free of self-references and therefore movable.

use utils::align_up;

use crate::block::{Block, Buf, PoolWalker, FREE_HDR_SIZE, HDR_SIZE, SIZE_Q};
use crate::config::{ESENT, FREE_WIPE, SIZE_QUANT};
use crate::debug::debug_check;

/// Free list link designating the anchor.
const ANCHOR: usize = 0;

/// How the free list is searched for a block that fits an allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SearchPolicy {
    /// Take the first block that is large enough.
    FirstFit,
    /// Take the smallest block that is large enough.
    BestFit,
}

impl SearchPolicy {
    pub const DEFAULT: Self = if cfg!(feature = "best_fit") {
        SearchPolicy::BestFit
    } else {
        SearchPolicy::FirstFit
    };
}

pub struct BPoolSet {
    /// First free block.
    flink: usize,
    /// Last free block.
    blink: usize,
    /// Bytes currently allocated, headers included.
    totalloc: usize,
    policy: SearchPolicy,
}

/// Size of the block needed to hold `requested` bytes, or `None` if it can not be represented.
pub fn block_size(requested: usize) -> Option<usize> {
    let size = align_up(requested.max(SIZE_Q), SIZE_QUANT)?;
    let size = size.checked_add(HDR_SIZE)?;
    if size > isize::MAX as usize {
        None
    } else {
        Some(size)
    }
}

impl BPoolSet {
    pub const fn new(policy: SearchPolicy) -> Self {
        Self {
            flink: ANCHOR,
            blink: ANCHOR,
            totalloc: 0,
            policy,
        }
    }

    pub fn totalloc(&self) -> usize {
        self.totalloc
    }

    // ——————————————————————————— Free List ———————————————————————————— //

    fn next_of(&self, link: usize) -> usize {
        if link == ANCHOR {
            self.flink
        } else {
            Block::at(link).flink()
        }
    }

    fn prev_of(&self, link: usize) -> usize {
        if link == ANCHOR {
            self.blink
        } else {
            Block::at(link).blink()
        }
    }

    fn set_next(&mut self, link: usize, next: usize) {
        if link == ANCHOR {
            self.flink = next;
        } else {
            Block::at(link).set_flink(next);
        }
    }

    fn set_prev(&mut self, link: usize, prev: usize) {
        if link == ANCHOR {
            self.blink = prev;
        } else {
            Block::at(link).set_blink(prev);
        }
    }

    fn check_links(&self, b: Block) {
        let addr = b.addr();
        if self.next_of(b.blink()) != addr || self.prev_of(b.flink()) != addr {
            log::error!("Broken free list links at 0x{:x}", addr);
            panic!("Heap corruption");
        }
    }

    fn check_anchor(&self) {
        if self.next_of(self.blink) != ANCHOR || self.prev_of(self.flink) != ANCHOR {
            log::error!("Broken free list anchor");
            panic!("Heap corruption");
        }
    }

    /// Inserts a free block at the tail of the free list.
    fn push_back(&mut self, b: Block) {
        debug_check!(self.check_anchor());
        let tail = self.blink;
        b.set_flink(ANCHOR);
        b.set_blink(tail);
        self.set_next(tail, b.addr());
        self.blink = b.addr();
    }

    fn unlink(&mut self, b: Block) {
        debug_check!(self.check_links(b));
        let (prev, next) = (b.blink(), b.flink());
        self.set_next(prev, next);
        self.set_prev(next, prev);
    }

    /// Takes the place of a free block in the free list, given the links it had.
    fn relink(&mut self, b: Block, flink: usize, blink: usize) {
        b.set_flink(flink);
        b.set_blink(blink);
        self.set_next(blink, b.addr());
        self.set_prev(flink, b.addr());
    }

    fn find_fit(&self, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;
        let mut link = self.flink;
        while link != ANCHOR {
            let b = Block::at(link);
            let bsize = b.bsize() as usize;
            if bsize >= size {
                match self.policy {
                    SearchPolicy::FirstFit => return Some(b),
                    SearchPolicy::BestFit => {
                        if best.map_or(true, |best| bsize < best.bsize() as usize) {
                            best = Some(b);
                        }
                    }
                }
            }
            link = b.flink();
        }
        best
    }

    // ——————————————————————————— Allocation ——————————————————————————— //

    /// Allocates a buffer of at least `requested` bytes, returns the address of its payload.
    pub fn bget(&mut self, requested: usize) -> Option<usize> {
        let size = block_size(requested)?;
        let b = self.find_fit(size)?;
        let bsize = b.bsize() as usize;

        if bsize - size > SIZE_Q + HDR_SIZE {
            // Carve the allocation from the top of the free block, which stays in the list
            let ba = b.forward(bsize - size);
            let bn = ba.forward(size);
            debug_check!(assert_eq!(bn.prev_free(), bsize, "Bad prev_free in next block"));

            b.set_bsize((bsize - size) as isize);
            ba.set_prev_free(bsize - size);
            ba.set_bsize(-(size as isize));
            bn.set_prev_free(0);
            self.totalloc += size;
            log::trace!("bget: {} bytes at 0x{:x}", size, ba.addr());
            Some(ba.payload())
        } else {
            // Not worth splitting, hand out the whole block
            let bn = b.forward(bsize);
            debug_check!(assert_eq!(bn.prev_free(), bsize, "Bad prev_free in next block"));

            self.unlink(b);
            self.totalloc += bsize;
            b.set_bsize(-(bsize as isize));
            bn.set_prev_free(0);
            log::trace!("bget: {} bytes at 0x{:x}", bsize, b.addr());
            Some(b.payload())
        }
    }

    /// Allocates a buffer and clears its whole payload.
    pub fn bgetz(&mut self, requested: usize) -> Option<usize> {
        let buf = self.bget(requested)?;
        let b = Block::from_payload(buf);
        b.fill(HDR_SIZE, b.bsize().unsigned_abs() - HDR_SIZE, 0);
        Some(buf)
    }

    /// Resizes the buffer at `buf`, in place when possible.
    ///
    /// Contents are preserved up to the smallest of the old and new sizes. On failure the original
    /// buffer is left untouched.
    pub fn bgetr(&mut self, buf: Option<usize>, requested: usize) -> Option<usize> {
        let Some(buf) = buf else {
            return self.bget(requested);
        };
        let size = block_size(requested)?;
        let b = Block::from_payload(buf);
        let current = b.bsize().unsigned_abs();

        if size <= current {
            self.trim(b, size);
            return Some(buf);
        }
        if self.grow(b, size) {
            return Some(buf);
        }

        let new_buf = self.bget(requested)?;
        let len = core::cmp::min(requested, current - HDR_SIZE);
        // SAFETY: both buffers are live and distinct, each holds at least `len` bytes.
        unsafe { core::ptr::copy_nonoverlapping(buf as *const u8, new_buf as *mut u8, len) };
        self.brel(buf);
        Some(new_buf)
    }

    /// Tries to extend an allocated block to `size` bytes using the free block right after it.
    fn grow(&mut self, b: Block, size: usize) -> bool {
        let current = b.bsize().unsigned_abs();
        let bn = b.forward(current);
        let Buf::Free {
            size: next_size,
            flink,
            blink,
        } = bn.view()
        else {
            return false;
        };
        if current + next_size < size {
            return false;
        }

        debug_check!(self.check_links(bn));
        let extra = size - current;
        let bnn = bn.forward(next_size);
        let remaining = next_size - extra;
        if remaining >= SIZE_Q + HDR_SIZE {
            // The free block shrinks from the bottom and takes the old one's place in the list
            let nbf = b.forward(size);
            nbf.set_prev_free(0);
            nbf.set_bsize(remaining as isize);
            self.relink(nbf, flink, blink);
            bnn.set_prev_free(remaining);
            wipe(nbf);
            b.set_bsize(-(size as isize));
            self.totalloc += extra;
        } else {
            self.unlink(bn);
            b.set_bsize(-((current + next_size) as isize));
            bnn.set_prev_free(0);
            self.totalloc += next_size;
        }
        true
    }

    /// Releases a buffer, merging it with its free neighbours.
    pub fn brel(&mut self, buf: usize) {
        let mut b = Block::from_payload(buf);
        let bsize = b.bsize();
        debug_check!(assert!(
            bsize < 0 && bsize != ESENT,
            "Releasing a buffer that is not allocated: 0x{:x}",
            buf
        ));
        let size = bsize.unsigned_abs();
        self.totalloc -= size;
        log::trace!("brel: {} bytes at 0x{:x}", size, b.addr());

        if b.prev_free() != 0 {
            // Merge into the previous free block, which already is in the free list
            let prev = b.backward(b.prev_free());
            debug_check!(assert_eq!(
                prev.bsize() as usize,
                b.prev_free(),
                "Bad prev_free"
            ));
            prev.set_bsize(prev.bsize() + size as isize);
            b = prev;
        } else {
            self.push_back(b);
            b.set_bsize(size as isize);
        }

        let mut bn = b.next();
        if bn.bsize() > 0 {
            let bnn = bn.next();
            debug_check!(assert_eq!(
                bnn.prev_free(),
                bn.bsize() as usize,
                "Bad prev_free"
            ));
            self.unlink(bn);
            b.set_bsize(b.bsize() + bn.bsize());
            bn = b.next();
        }

        wipe(b);
        debug_check!(assert!(bn.bsize() < 0, "Two adjacent free blocks"));
        bn.set_prev_free(b.bsize() as usize);
    }

    /// Turns `size` bytes at `bf` into a free block, `bn` is the allocated block that follows.
    fn create_free_block(&mut self, bf: Block, size: usize, bn: Block) {
        debug_check!(assert_eq!(bf.forward(size), bn));
        debug_check!(assert!(bn.bsize() < 0, "Next block should be allocated"));

        bf.set_bsize(size as isize);
        bf.set_prev_free(0);
        bn.set_prev_free(size);
        self.push_back(bf);
        wipe(bf);
    }

    /// Releases the front of the allocated buffer `orig`, which now starts at `new`.
    pub fn release_front(&mut self, orig: usize, new: usize) {
        debug_check!(assert!(orig < new));
        let size = new - orig;
        debug_check!(assert!(size >= SIZE_Q + HDR_SIZE, "No room for a free header"));

        let bf = Block::from_payload(orig);
        let orig_size = bf.bsize().unsigned_abs();
        let b = Block::from_payload(new);

        if bf.prev_free() != 0 {
            let prev = bf.backward(bf.prev_free());
            debug_check!(assert_eq!(prev.bsize() as usize, bf.prev_free()));
            prev.set_bsize(prev.bsize() + size as isize);
            b.set_prev_free(prev.bsize() as usize);
            b.set_bsize(-((orig_size - size) as isize));
            wipe(prev);
        } else {
            b.set_prev_free(0);
            b.set_bsize(-((orig_size - size) as isize));
            self.create_free_block(bf, size, b);
        }
        self.totalloc -= size;
    }

    /// Releases the tail of the allocated buffer at `buf` past its first `requested` bytes.
    pub fn release_back(&mut self, buf: usize, requested: usize) {
        if let Some(size) = block_size(requested) {
            self.trim(Block::from_payload(buf), size);
        }
    }

    /// Shrinks an allocated block to `size` bytes if what is left can form a free block.
    fn trim(&mut self, b: Block, size: usize) {
        let current = b.bsize().unsigned_abs();
        debug_check!(assert!(size <= current));
        let free_size = current - size;
        if free_size < SIZE_Q + HDR_SIZE {
            return;
        }

        let bn = b.forward(current);
        let nbf = b.forward(size);
        b.set_bsize(-(size as isize));
        if let Buf::Free {
            size: next_size,
            flink,
            blink,
        } = bn.view()
        {
            // Next block is free, it grows downwards
            let bnn = bn.forward(next_size);
            debug_check!(assert_eq!(bn.prev_free(), 0));
            debug_check!(assert_eq!(bnn.prev_free(), next_size));

            nbf.set_prev_free(0);
            nbf.set_bsize((next_size + free_size) as isize);
            bnn.set_prev_free(next_size + free_size);
            self.relink(nbf, flink, blink);
            wipe(nbf);
        } else {
            self.create_free_block(nbf, free_size, bn);
        }
        self.totalloc -= free_size;
    }

    // ————————————————————————————— Pools —————————————————————————————— //

    /// Adds `len` bytes at `start` as a new pool.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes, aligned on [SIZE_QUANT] and not used by
    /// anything else for as long as this pool set lives.
    pub unsafe fn bpool(&mut self, start: usize, len: usize) {
        let len = len & !(SIZE_QUANT - 1);
        debug_check!(assert!(len - HDR_SIZE <= isize::MAX as usize));

        let b = Block::at(start);
        b.set_prev_free(0);
        self.push_back(b);
        let size = len - HDR_SIZE;
        b.set_bsize(size as isize);
        wipe(b);

        let sentinel = b.forward(size);
        sentinel.set_prev_free(size);
        sentinel.set_bsize(ESENT);
    }

    /// Checks the consistency of the pool starting at `start`, panics on corruption.
    pub fn validate_pool(&self, start: usize) {
        let mut previous_free = 0;
        for (b, buf) in PoolWalker::new(start) {
            let size = match buf {
                Buf::Allocated { size } => {
                    previous_free = 0;
                    size
                }
                Buf::Free { size, .. } => {
                    if previous_free != 0 {
                        log::error!("Adjacent free blocks at 0x{:x}", b.addr());
                        panic!("Heap corruption");
                    }
                    self.check_links(b);
                    if cfg!(feature = "validate")
                        && !b.is_filled_with(FREE_HDR_SIZE, size - FREE_HDR_SIZE, FREE_WIPE)
                    {
                        log::error!("Free block at 0x{:x} was modified", b.addr());
                        panic!("Heap corruption");
                    }
                    previous_free = size;
                    size
                }
                Buf::End => unreachable!(),
            };
            if size % SIZE_QUANT != 0 || size < SIZE_Q + HDR_SIZE {
                log::error!("Bad block size {} at 0x{:x}", size, b.addr());
                panic!("Heap corruption");
            }
            assert_prev_free(b.next(), previous_free);
        }
    }
}

/// Fills the payload of a free block with a known pattern, checked when validating pools.
fn wipe(b: Block) {
    if cfg!(feature = "validate") {
        b.fill(FREE_HDR_SIZE, b.bsize() as usize - FREE_HDR_SIZE, FREE_WIPE);
    }
}

fn assert_prev_free(b: Block, expected: usize) {
    if b.prev_free() != expected {
        log::error!(
            "Block at 0x{:x} has prev_free {}, expected {}",
            b.addr(),
            b.prev_free(),
            expected
        );
        panic!("Heap corruption");
    }
}
