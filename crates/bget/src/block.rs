//! Boundary tags
//!
//! Every buffer of a pool starts with a two words header: the size of the previous buffer if that
//! one is free (zero otherwise), followed by the size of the buffer itself, negated while the
//! buffer is allocated. Free buffers additionally store the forward and backward links of the free
//! list in their first two payload words. The last header of a pool is a sentinel whose size is
//! [ESENT].

use core::mem::size_of;

use crate::config::{ESENT, SIZE_QUANT};

const WORD: usize = size_of::<usize>();

/// Size of the header in front of every buffer.
pub const HDR_SIZE: usize = 2 * WORD;

/// Size of the header of a free buffer, including the free list links.
pub const FREE_HDR_SIZE: usize = 4 * WORD;

/// Smallest payload a buffer can hold: the free list links must fit in a released buffer.
pub const SIZE_Q: usize = if SIZE_QUANT > 2 * WORD {
    SIZE_QUANT
} else {
    2 * WORD
};

// ————————————————————————————————— Blocks ————————————————————————————————— //

/// A boundary tag, identified by its address.
///
/// Blocks are only ever built from addresses of headers that live inside a pool registered with a
/// [crate::bpool::BPoolSet], or from payload pointers handed out by that pool set. All the
/// accessors below rely on that invariant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Block(usize);

impl Block {
    pub const fn at(addr: usize) -> Self {
        Block(addr)
    }

    /// The header of the buffer whose payload starts at `payload`.
    pub const fn from_payload(payload: usize) -> Self {
        Block(payload - HDR_SIZE)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn payload(self) -> usize {
        self.0 + HDR_SIZE
    }

    /// The block `offset` bytes after this one.
    pub const fn forward(self, offset: usize) -> Self {
        Block(self.0 + offset)
    }

    /// The block `offset` bytes before this one.
    pub const fn backward(self, offset: usize) -> Self {
        Block(self.0 - offset)
    }

    /// The block that follows this one in memory.
    pub fn next(self) -> Self {
        self.forward(self.bsize().unsigned_abs())
    }

    fn read(self, word: usize) -> usize {
        // SAFETY: see the type-level invariant, headers are word aligned and valid for reads.
        unsafe { core::ptr::read((self.0 + word * WORD) as *const usize) }
    }

    fn write(self, word: usize, value: usize) {
        // SAFETY: see the type-level invariant, headers are word aligned and valid for writes.
        unsafe { core::ptr::write((self.0 + word * WORD) as *mut usize, value) }
    }

    pub fn prev_free(self) -> usize {
        self.read(0)
    }

    pub fn set_prev_free(self, size: usize) {
        self.write(0, size)
    }

    pub fn bsize(self) -> isize {
        self.read(1) as isize
    }

    pub fn set_bsize(self, size: isize) {
        self.write(1, size as usize)
    }

    pub fn flink(self) -> usize {
        self.read(2)
    }

    pub fn set_flink(self, link: usize) {
        self.write(2, link)
    }

    pub fn blink(self) -> usize {
        self.read(3)
    }

    pub fn set_blink(self, link: usize) {
        self.write(3, link)
    }

    /// Tagged view of the header.
    pub fn view(self) -> Buf {
        let bsize = self.bsize();
        if bsize == ESENT {
            Buf::End
        } else if bsize < 0 {
            Buf::Allocated {
                size: bsize.unsigned_abs(),
            }
        } else {
            Buf::Free {
                size: bsize as usize,
                flink: self.flink(),
                blink: self.blink(),
            }
        }
    }

    /// Fills `len` bytes starting `offset` bytes after the header with `byte`.
    pub fn fill(self, offset: usize, len: usize, byte: u8) {
        // SAFETY: callers only fill bytes that belong to this buffer.
        unsafe { core::ptr::write_bytes((self.0 + offset) as *mut u8, byte, len) }
    }

    /// Returns true if all `len` bytes starting `offset` bytes after the header equal `byte`.
    pub fn is_filled_with(self, offset: usize, len: usize, byte: u8) -> bool {
        // SAFETY: callers only inspect bytes that belong to this buffer.
        let bytes = unsafe { core::slice::from_raw_parts((self.0 + offset) as *const u8, len) };
        bytes.iter().all(|b| *b == byte)
    }
}

/// A buffer, as seen when walking a pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Buf {
    Free {
        size: usize,
        flink: usize,
        blink: usize,
    },
    Allocated {
        size: usize,
    },
    End,
}

// ———————————————————————————————— Walking ————————————————————————————————— //

/// Iterates over the buffers of one pool, in address order.
pub struct PoolWalker {
    next: Option<Block>,
}

impl PoolWalker {
    /// Walks the pool whose first buffer is at `start`.
    pub fn new(start: usize) -> Self {
        Self {
            next: Some(Block::at(start)),
        }
    }
}

impl Iterator for PoolWalker {
    type Item = (Block, Buf);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        let buf = block.view();
        self.next = match buf {
            Buf::End => None,
            Buf::Free { size, .. } | Buf::Allocated { size } => Some(block.forward(size)),
        };
        match buf {
            Buf::End => None,
            _ => Some((block, buf)),
        }
    }
}
