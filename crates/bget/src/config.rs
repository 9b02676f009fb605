//! Allocator configuration

/// Buffer allocation size quantum: all buffers allocated are a multiple of this size.
#[cfg(target_pointer_width = "64")]
pub const SIZE_QUANT: usize = 16;
#[cfg(not(target_pointer_width = "64"))]
pub const SIZE_QUANT: usize = 8;

/// Size of the sentinel block closing each pool.
pub const ESENT: isize = isize::MIN;

/// Pattern written over released buffers when pools are validated.
pub const FREE_WIPE: u8 = 0x55;

/// Debug tag magic values.
pub const MDBG_HEADER_MAGIC: u32 = 0xadadadad;
pub const MDBG_FOOTER_MAGIC: u32 = 0xecececec;
