//! Memory map
//!
//! The memory map is the list of regions the MMU layer maps for the TEE core. Each guest gets its
//! own copy of the static map, with the r/w data region backed by the guest's own memory and an
//! extra region for the guest's TA RAM.

use core::fmt;

use bitflags::bitflags;
use utils::{align_up, PhysAddr, VirtAddr, CORE_MMU_PGDIR_MASK, SMALL_PAGE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemArea {
    TeeRamRx,
    TeeRamRo,
    TeeRamRw,
    KernRamRw,
    TaRam,
    NsecShm,
    IoNsec,
    IoSec,
    /// Alias covering the whole secure RAM, used to reach memory not mapped otherwise.
    SecRamOverall,
    ResVaspace,
}

bitflags! {
    pub struct MemAttr: u32 {
        const VALID = 1 << 0;
        /// Privileged read.
        const PR = 1 << 1;
        /// Privileged write.
        const PW = 1 << 2;
        /// Privileged execute.
        const PX = 1 << 3;
        const GLOBAL = 1 << 4;
        const SECURE = 1 << 5;
        const CACHED = 1 << 6;
    }
}

const SECURE_RAM: MemAttr = MemAttr::VALID
    .union(MemAttr::GLOBAL)
    .union(MemAttr::SECURE)
    .union(MemAttr::CACHED);

impl MemArea {
    /// Mapping attributes of a region of this kind.
    pub const fn attr(self) -> MemAttr {
        match self {
            MemArea::TeeRamRx => SECURE_RAM.union(MemAttr::PR).union(MemAttr::PX),
            MemArea::TeeRamRo => SECURE_RAM.union(MemAttr::PR),
            MemArea::TeeRamRw
            | MemArea::KernRamRw
            | MemArea::TaRam
            | MemArea::SecRamOverall => SECURE_RAM.union(MemAttr::PR).union(MemAttr::PW),
            MemArea::NsecShm => MemAttr::VALID
                .union(MemAttr::GLOBAL)
                .union(MemAttr::CACHED)
                .union(MemAttr::PR)
                .union(MemAttr::PW),
            MemArea::IoNsec => MemAttr::VALID
                .union(MemAttr::GLOBAL)
                .union(MemAttr::PR)
                .union(MemAttr::PW),
            MemArea::IoSec => MemAttr::VALID
                .union(MemAttr::GLOBAL)
                .union(MemAttr::SECURE)
                .union(MemAttr::PR)
                .union(MemAttr::PW),
            MemArea::ResVaspace => MemAttr::empty(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MemArea::TeeRamRx => "TEE_RAM_RX",
            MemArea::TeeRamRo => "TEE_RAM_RO",
            MemArea::TeeRamRw => "TEE_RAM_RW",
            MemArea::KernRamRw => "KERN_RAM_RW",
            MemArea::TaRam => "TA_RAM",
            MemArea::NsecShm => "NSEC_SHM",
            MemArea::IoNsec => "IO_NSEC",
            MemArea::IoSec => "IO_SEC",
            MemArea::SecRamOverall => "SEC_RAM_OVERALL",
            MemArea::ResVaspace => "RES_VASPACE",
        }
    }

    /// Areas holding the TEE core itself, which must never be handed out to a guest.
    pub const fn is_core_memory(self) -> bool {
        matches!(
            self,
            MemArea::TeeRamRx | MemArea::TeeRamRo | MemArea::KernRamRw
        )
    }
}

// ————————————————————————————————— Regions ———————————————————————————————— //

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmapRegion {
    pub kind: MemArea,
    /// Granularity of the mapping.
    pub region_size: usize,
    pub pa: PhysAddr,
    pub va: VirtAddr,
    pub size: usize,
    pub attr: MemAttr,
}

impl MmapRegion {
    /// An unused entry.
    pub const EMPTY: Self = Self::new(
        MemArea::ResVaspace,
        0,
        PhysAddr::zero(),
        VirtAddr::zero(),
        0,
    );

    /// A region of `kind` with the attributes of that kind.
    pub const fn new(
        kind: MemArea,
        region_size: usize,
        pa: PhysAddr,
        va: VirtAddr,
        size: usize,
    ) -> Self {
        Self {
            kind,
            region_size,
            pa,
            va,
            size,
            attr: kind.attr(),
        }
    }

    pub fn va_end(&self) -> usize {
        self.va.as_usize() + self.size
    }
}

impl fmt::Display for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T: {:<16} rsz: {:08x}, pa: {:08x}, va: {:08x}, sz: {:08x} attr: {:x}",
            self.kind.name(),
            self.region_size,
            self.pa.as_usize(),
            self.va.as_usize(),
            self.size,
            self.attr.bits()
        )
    }
}

// ———————————————————————————————— Guest Maps —————————————————————————————— //

/// Number of entries of a guest map derived from `kernel_map`.
pub const fn guest_map_len(kernel_map: &[MmapRegion]) -> usize {
    kernel_map.len() + 1
}

/// Fills `guest_map` with a copy of `kernel_map` where the region mapped at `rw_va` is backed by
/// `tee_data`, followed by a TA RAM region for `[ta_ram, ta_ram + ta_ram_size)`.
///
/// The TA RAM is placed above every other region, at a virtual address with the same offset
/// within a page directory as its physical address so that it can be mapped with sections.
pub fn derive_guest_map(
    guest_map: &mut [MmapRegion],
    kernel_map: &[MmapRegion],
    rw_va: VirtAddr,
    tee_data: PhysAddr,
    ta_ram: PhysAddr,
    ta_ram_size: usize,
) -> Option<()> {
    let entries = kernel_map.len();
    if guest_map.len() != guest_map_len(kernel_map) {
        return None;
    }

    let mut max_va = 0;
    for (region, original) in guest_map.iter_mut().zip(kernel_map) {
        *region = *original;
        if region.va == rw_va {
            region.kind = MemArea::TeeRamRw;
            region.attr = region.kind.attr();
            region.pa = tee_data;
        }
        max_va = max_va.max(region.va_end());
    }

    let mut va = align_up(max_va, SMALL_PAGE_SIZE)?;
    va = va.checked_add(ta_ram.as_usize().wrapping_sub(va) & CORE_MMU_PGDIR_MASK)?;
    guest_map[entries] = MmapRegion::new(
        MemArea::TaRam,
        SMALL_PAGE_SIZE,
        ta_ram,
        VirtAddr::new(va),
        ta_ram_size,
    );

    log::debug!("New map ({}):", rw_va);
    for region in guest_map.iter() {
        log::debug!("{}", region);
    }
    Some(())
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_map() -> [MmapRegion; 4] {
        [
            MmapRegion::new(
                MemArea::TeeRamRx,
                SMALL_PAGE_SIZE,
                PhysAddr::new(0x4410_0000),
                VirtAddr::new(0x4410_0000),
                0x8_0000,
            ),
            MmapRegion::new(
                MemArea::TeeRamRo,
                SMALL_PAGE_SIZE,
                PhysAddr::new(0x4418_0000),
                VirtAddr::new(0x4418_0000),
                0x4_0000,
            ),
            MmapRegion::new(
                MemArea::KernRamRw,
                SMALL_PAGE_SIZE,
                PhysAddr::new(0x441c_0000),
                VirtAddr::new(0x441c_0000),
                0x4_0000,
            ),
            MmapRegion::new(
                MemArea::NsecShm,
                0x10_0000,
                PhysAddr::new(0x47e0_0000),
                VirtAddr::new(0x4420_0000),
                0x10_0000,
            ),
        ]
    }

    #[test]
    fn attributes() {
        assert!(MemArea::TeeRamRx.attr().contains(MemAttr::PX));
        assert!(!MemArea::TeeRamRw.attr().contains(MemAttr::PX));
        assert!(MemArea::TaRam.attr().contains(MemAttr::SECURE | MemAttr::PW));
        assert!(!MemArea::NsecShm.attr().contains(MemAttr::SECURE));
        assert!(MemArea::ResVaspace.attr().is_empty());
        assert!(MemArea::KernRamRw.is_core_memory());
        assert!(!MemArea::TeeRamRw.is_core_memory());
    }

    #[test]
    fn guest_map() {
        let kernel_map = kernel_map();
        let mut guest_map = [MmapRegion::EMPTY; 5];
        derive_guest_map(
            &mut guest_map,
            &kernel_map,
            VirtAddr::new(0x441c_0000),
            PhysAddr::new(0x4460_0000),
            PhysAddr::new(0x4478_0000),
            0x20_0000,
        )
        .unwrap();

        // r/w data now backed by the guest memory
        assert_eq!(guest_map[2].kind, MemArea::TeeRamRw);
        assert_eq!(guest_map[2].pa, PhysAddr::new(0x4460_0000));
        assert_eq!(guest_map[2].va, VirtAddr::new(0x441c_0000));
        assert_eq!(&guest_map[..2], &kernel_map[..2]);
        assert_eq!(guest_map[3], kernel_map[3]);

        // TA RAM above the highest VA, same offset within the page directory as its PA
        let ta = guest_map[4];
        assert_eq!(ta.kind, MemArea::TaRam);
        assert_eq!(ta.va, VirtAddr::new(0x4438_0000));
        assert_eq!(ta.va.as_usize() & CORE_MMU_PGDIR_MASK, 0x8_0000);
        assert_eq!(ta.size, 0x20_0000);
        assert_eq!(
            format!("{}", ta),
            "T: TA_RAM           rsz: 00001000, pa: 44780000, va: 44380000, sz: 00200000 attr: 77"
        );
    }

    #[test]
    fn wrong_length() {
        let mut guest_map = [MmapRegion::EMPTY; 3];
        let result = derive_guest_map(
            &mut guest_map,
            &kernel_map(),
            VirtAddr::new(0x441c_0000),
            PhysAddr::new(0x4460_0000),
            PhysAddr::new(0x4478_0000),
            0x20_0000,
        );
        assert_eq!(result, None);
    }
}
