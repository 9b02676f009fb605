//! Debug tags
//!
//! When a pool set is created with [crate::Tagging::Debug], every allocation is prefixed by a
//! header recording the call site and the payload size, and followed by a footer magic value.
//! Both are verified whenever the buffer is released or resized, and by [crate::PoolSet::mdbg_check].

use core::mem::size_of;
use core::panic::Location;

use crate::block::{Block, HDR_SIZE};
use crate::config::{MDBG_FOOTER_MAGIC, MDBG_HEADER_MAGIC, SIZE_QUANT};
use crate::poolset::Inner;

#[repr(C)]
struct MdbgHeader {
    location: Option<&'static Location<'static>>,
    pl_size: u32,
    magic: u32,
    #[cfg(not(target_pointer_width = "64"))]
    _pad: u32,
}

const MDBG_HDR_SIZE: usize = size_of::<MdbgHeader>();

// Payloads must keep the alignment of plain allocations.
const _: () = assert!(MDBG_HDR_SIZE % SIZE_QUANT == 0);

/// Padding up to the footer plus the footer itself.
fn footer_size(pl_size: usize) -> usize {
    let pad = ((pl_size + 3) & !3) - pl_size;
    pad + size_of::<u32>()
}

fn header<'a>(hdr: usize) -> &'a mut MdbgHeader {
    // SAFETY: `hdr` is the start of a live tagged allocation, aligned on the size quantum.
    unsafe { &mut *(hdr as *mut MdbgHeader) }
}

fn footer(hdr: usize) -> *mut u32 {
    let pl_size = header(hdr).pl_size as usize;
    (hdr + MDBG_HDR_SIZE + pl_size + footer_size(pl_size) - size_of::<u32>()) as *mut u32
}

fn update_header(hdr: usize, location: &'static Location<'static>, pl_size: usize) {
    let header = header(hdr);
    header.location = Some(location);
    header.pl_size = pl_size as u32;
    header.magic = MDBG_HEADER_MAGIC;
    // SAFETY: the footer lies within the allocation, 4-byte aligned.
    unsafe { footer(hdr).write(MDBG_FOOTER_MAGIC) };
}

fn assert_header(hdr: usize) {
    let header = header(hdr);
    // SAFETY: the footer lies within the allocation, 4-byte aligned.
    let footer = unsafe { footer(hdr).read() };
    if header.magic != MDBG_HEADER_MAGIC || footer != MDBG_FOOTER_MAGIC {
        match header.location {
            Some(location) => log::error!(
                "Corrupted allocation of {} bytes from {}:{}",
                header.pl_size,
                location.file(),
                location.line()
            ),
            None => log::error!("Corrupted allocation at 0x{:x}", hdr),
        }
        panic!("Heap corruption");
    }
}

/// Start and size of the payload of the tagged buffer starting at `buf`.
pub(crate) fn payload_start_size(buf: usize) -> (usize, usize) {
    let pl_size = header(buf).pl_size as usize;
    debug_assert!(Block::from_payload(buf).bsize().unsigned_abs() - HDR_SIZE >= pl_size);
    (buf + MDBG_HDR_SIZE, pl_size)
}

/// Size of a tagged allocation of `pl_size` bytes, header and footer included.
pub(crate) fn tagged_size(pl_size: usize) -> usize {
    MDBG_HDR_SIZE + pl_size + footer_size(pl_size)
}

/// Sizes stored in the header are 32 bits wide.
fn fits(size: usize) -> bool {
    size <= u32::MAX as usize
}

impl Inner {
    pub(crate) fn mdbg_malloc(
        &mut self,
        location: &'static Location<'static>,
        size: usize,
    ) -> Option<usize> {
        if !fits(size) {
            self.return_hook(None, size);
            return None;
        }
        let hdr = self.raw_malloc(MDBG_HDR_SIZE, footer_size(size), size)?;
        update_header(hdr, location, size);
        Some(hdr + MDBG_HDR_SIZE)
    }

    pub(crate) fn mdbg_calloc(
        &mut self,
        location: &'static Location<'static>,
        nmemb: usize,
        size: usize,
    ) -> Option<usize> {
        let Some(total) = nmemb.checked_mul(size) else {
            // Fails on the overflow, and records the failure
            return self.raw_calloc(MDBG_HDR_SIZE, 0, nmemb, size);
        };
        if !fits(total) {
            self.return_hook(None, total);
            return None;
        }
        let hdr = self.raw_calloc(MDBG_HDR_SIZE, footer_size(total), nmemb, size)?;
        update_header(hdr, location, total);
        Some(hdr + MDBG_HDR_SIZE)
    }

    pub(crate) fn mdbg_realloc(
        &mut self,
        location: &'static Location<'static>,
        ptr: Option<usize>,
        size: usize,
    ) -> Option<usize> {
        if !fits(size) {
            self.return_hook(None, size);
            return None;
        }
        let hdr = ptr.map(|p| p - MDBG_HDR_SIZE);
        if let Some(hdr) = hdr {
            assert_header(hdr);
        }
        let hdr = self.raw_realloc(hdr, MDBG_HDR_SIZE, footer_size(size), size)?;
        update_header(hdr, location, size);
        Some(hdr + MDBG_HDR_SIZE)
    }

    pub(crate) fn mdbg_memalign(
        &mut self,
        location: &'static Location<'static>,
        alignment: usize,
        size: usize,
    ) -> Option<usize> {
        if !fits(size) {
            self.return_hook(None, size);
            return None;
        }
        let hdr = self.raw_memalign(MDBG_HDR_SIZE, footer_size(size), alignment, size)?;
        update_header(hdr, location, size);
        Some(hdr + MDBG_HDR_SIZE)
    }

    pub(crate) fn mdbg_free(&mut self, ptr: usize) {
        let hdr = ptr - MDBG_HDR_SIZE;
        assert_header(hdr);
        // SAFETY: the header was just checked, the footer lies within the allocation.
        unsafe { footer(hdr).write(0) };
        header(hdr).magic = 0;
        self.raw_free(hdr);
    }

    pub(crate) fn mdbg_check(&self, dump: bool) {
        for buf in self.allocated() {
            assert_header(buf);
            if dump {
                let header = header(buf);
                let (file, line) = match header.location {
                    Some(location) => (location.file(), location.line()),
                    None => ("unknown", 0),
                };
                log::info!("buffer: {} bytes {}:{}", header.pl_size, file, line);
            }
        }
    }
}
