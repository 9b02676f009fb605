//! Guest Virtualization
//!
//! When the TEE runs under a hypervisor, each guest gets its own instance of the TEE core: its own
//! copy of the r/w data, its own TA RAM and its own translation context. The [GuestRegistry]
//! creates and tears down those per-guest contexts, and tracks which guest is active on each core.
#![cfg_attr(not(test), no_std)]

mod memory_map;
mod platform;
mod registry;

use tee_mm::MmError;
use utils::{align_down, PhysAddr, VirtAddr, CORE_MMU_DEVICE_SIZE};

pub use memory_map::{derive_guest_map, guest_map_len, MemArea, MemAttr, MmapRegion};
pub use platform::Platform;
pub use registry::{GuestContext, GuestMemory, GuestRegistry};

/// Configuration for the static registry size.
pub mod config {
    use crate::GuestId;

    pub const NB_CORES: usize = 8;
    /// Id used by the hypervisor itself, never backed by a guest context.
    pub const HYP_CLNT_ID: GuestId = 0;
}

pub type GuestId = u16;

// ————————————————————————————————— Errors ————————————————————————————————— //

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtError {
    /// Not enough memory to create the guest, nothing was left behind.
    OutOfMemory,
    /// No guest with this id.
    NotFound,
    /// The id is reserved or already in use.
    InvalidGuest,
    /// The TEE can not continue, the caller must halt.
    Fatal(FatalError),
}

/// Violations of the guest life cycle, or of the registry's own invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// Destroying a guest that still has threads running.
    GuestInUse { id: GuestId, refcnt: u16 },
    /// Switching to a guest while another one is active on this core.
    AlreadyHasGuest { current: GuestId, requested: GuestId },
    NoCurrentGuest,
    RefcountUnderflow { id: GuestId },
    /// The memory used by the TEE core could not be reserved.
    Carveout,
    /// The page pool rejected an operation on memory it handed out.
    Extent(MmError),
    /// An address has no mapping.
    Unmapped(usize),
}

impl VirtError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, VirtError::Fatal(_))
    }
}

impl From<FatalError> for VirtError {
    fn from(err: FatalError) -> Self {
        VirtError::Fatal(err)
    }
}

impl From<MmError> for VirtError {
    fn from(err: MmError) -> Self {
        match err {
            MmError::OutOfMemory => VirtError::OutOfMemory,
            _ => VirtError::Fatal(FatalError::Extent(err)),
        }
    }
}

// ————————————————————————————— Configuration —————————————————————————————— //

/// Memory layout the registry works with.
#[derive(Clone, Copy, Debug)]
pub struct VirtConfig {
    /// Start of the secure RAM shared between guests.
    pub secure_ram_start: PhysAddr,
    /// End (exclusive) of the secure RAM shared between guests.
    pub secure_ram_end: PhysAddr,
    /// Virtual address of the TEE core r/w data and bss, duplicated for each guest.
    pub rw_start: VirtAddr,
    pub rw_size: usize,
    /// Initialized data, within the r/w region, restored for each new guest.
    pub data_start: VirtAddr,
    pub data_size: usize,
    /// TA RAM, split evenly between guests.
    pub ta_ram_size: usize,
    pub max_guests: usize,
}

impl VirtConfig {
    /// TA RAM of each guest, in whole page directories so that it can be mapped with sections.
    pub fn ta_ram_per_guest(&self) -> usize {
        align_down(self.ta_ram_size / self.max_guests.max(1), CORE_MMU_DEVICE_SIZE)
    }

    /// Offset of the initialized data within the r/w region.
    pub fn data_offset(&self) -> Option<usize> {
        let offset = self.data_start.offset_from(self.rw_start)?;
        match offset.checked_add(self.data_size) {
            Some(end) if end <= self.rw_size => Some(offset),
            _ => None,
        }
    }
}
