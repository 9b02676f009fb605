//! R-Car memory layout
//!
//! Everything lives in TZDRAM: the TEE core at the bottom, followed by the TA RAM.

use utils::{align_down, align_up, VirtAddr, CORE_MMU_DEVICE_SIZE};
use virtualization::VirtConfig;

pub const TZDRAM_BASE: usize = 0x4400_0000;
pub const TZDRAM_SIZE: usize = 0x03E0_0000;

/// Non-secure shared memory, right above TZDRAM.
pub const SHMEM_START: usize = TZDRAM_BASE + TZDRAM_SIZE;

pub const TEE_RAM_VA_SIZE: usize = 1536 * 1024;
pub const TEE_RAM_START: usize = TZDRAM_BASE + 0x10_0000;

pub const TA_RAM_START: usize = match align_up(TEE_RAM_START + TEE_RAM_VA_SIZE, CORE_MMU_DEVICE_SIZE)
{
    Some(start) => start,
    None => panic!("TA RAM start overflows"),
};
pub const WHOLE_TA_RAM_SIZE: usize = TZDRAM_BASE + TZDRAM_SIZE - TA_RAM_START;

pub const VIRT_MAX_GUESTS: usize = 4;
/// TA RAM of one guest.
pub const TA_RAM_SIZE: usize =
    align_down(WHOLE_TA_RAM_SIZE / VIRT_MAX_GUESTS, CORE_MMU_DEVICE_SIZE);

pub const NB_CORES: usize = virtualization::config::NB_CORES;

/// Registry layout for this platform, given where the TEE core r/w data and initialized data
/// were linked.
pub const fn virt_config(
    rw_start: VirtAddr,
    rw_size: usize,
    data_start: VirtAddr,
    data_size: usize,
) -> VirtConfig {
    VirtConfig {
        secure_ram_start: utils::PhysAddr::new(TEE_RAM_START),
        secure_ram_end: utils::PhysAddr::new(TA_RAM_START + WHOLE_TA_RAM_SIZE),
        rw_start,
        rw_size,
        data_start,
        data_size,
        ta_ram_size: WHOLE_TA_RAM_SIZE,
        max_guests: VIRT_MAX_GUESTS,
    }
}
