use sync::ExceptionMask;
use utils::{PhysAddr, VirtAddr};

use crate::memory_map::{MemArea, MmapRegion};

/// Services the guest registry consumes from the rest of the TEE core.
pub trait Platform: Sync {
    /// Interrupt masking of the current core.
    type Mask: ExceptionMask + 'static;

    /// A translation context, as built by the MMU layer.
    type MmuCtx: Send + Sync;

    /// Index of the current core, below [crate::config::NB_CORES].
    fn core_id(&self) -> usize;

    fn phys_to_virt(&self, pa: PhysAddr, area: MemArea) -> Option<VirtAddr>;

    fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Bytes of page table memory needed by one translation context.
    fn mmu_tables_size(&self) -> usize;

    /// Creates a translation context whose tables live at `tables`.
    fn alloc_mmu_ctx(&self, tables: VirtAddr) -> Option<Self::MmuCtx>;

    /// Populates the translation context from a memory map.
    fn init_mmu_ctx(&self, ctx: &mut Self::MmuCtx, map: &[MmapRegion]);

    /// Installs a translation context on the current core.
    fn set_mmu_ctx(&self, ctx: &Self::MmuCtx);

    /// Restores the translation context of the TEE core itself.
    fn set_default_mmu_ctx(&self);

    fn free_mmu_ctx(&self, ctx: Self::MmuCtx);

    /// Sets up the thread contexts of a freshly created guest, runs in that guest's context.
    fn init_threads(&self);

    /// One-time runtime initialization of the current guest, on its first standard call.
    fn init_runtime(&self);
}
