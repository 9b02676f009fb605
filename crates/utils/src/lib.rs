#![cfg_attr(not(test), no_std)]

mod address;

pub use address::{align_down, align_up, PhysAddr, VirtAddr};

// ——————————————————————————————— Page sizes ——————————————————————————————— //

pub const SMALL_PAGE_SHIFT: usize = 12;
pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;

/// Size covered by one entry of the first level translation table.
pub const CORE_MMU_PGDIR_SHIFT: usize = 20;
pub const CORE_MMU_PGDIR_SIZE: usize = 1 << CORE_MMU_PGDIR_SHIFT;
pub const CORE_MMU_PGDIR_MASK: usize = CORE_MMU_PGDIR_SIZE - 1;

/// Devices and TA RAM are mapped at page directory granularity.
pub const CORE_MMU_DEVICE_SIZE: usize = CORE_MMU_PGDIR_SIZE;

// ———————————————————————————————— Ranges —————————————————————————————————— //

/// Returns true if `[a_start, a_end)` and `[b_start, b_end)` share at least one byte.
#[inline]
pub const fn ranges_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start < b_end && b_start < a_end
}
