//! Guest Registry
//!
//! Guest contexts live in memory from the kernel heap, linked in a list protected by a global
//! spinlock. Each core records the guest it is currently running on behalf of, that slot is only
//! ever touched by its own core with foreign interrupts masked.
//!
//! A context stays alive while it is current on a core: it can only be destroyed once its
//! reference count drops back to zero, and each core holding it as current accounts for one
//! reference.

use core::fmt;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use bget::{PoolBox, PoolSet};
use sync::{with_foreign_masked, SpinLockXsave};
use tee_mm::{Extent, MmError, TeeMm};
use utils::{PhysAddr, VirtAddr, SMALL_PAGE_SHIFT};

use crate::config::{HYP_CLNT_ID, NB_CORES};
use crate::memory_map::{derive_guest_map, guest_map_len, MemArea, MmapRegion};
use crate::platform::Platform;
use crate::{FatalError, GuestId, VirtConfig, VirtError};

/// Memory from the kernel heap.
type KBox<P, T> = PoolBox<'static, T, <P as Platform>::Mask>;

// ————————————————————————————— Guest Contexts ————————————————————————————— //

/// Physical memory owned by a guest.
pub struct GuestMemory {
    /// Backs the TEE core r/w data and bss.
    pub tee_ram: Extent,
    pub ta_ram: Extent,
    /// Page tables of the guest translation context.
    pub tables: Extent,
}

impl GuestMemory {
    /// Returns all three extents to `pages`, reporting the first failure.
    fn release(self, pages: &mut TeeMm) -> Result<(), MmError> {
        let tee_ram = pages.free(self.tee_ram);
        let ta_ram = pages.free(self.ta_ram);
        let tables = pages.free(self.tables);
        tee_ram.and(ta_ram).and(tables)
    }
}

pub struct GuestContext<P: Platform> {
    id: GuestId,
    memory: GuestMemory,
    mmu_ctx: P::MmuCtx,
    memory_map: KBox<P, [MmapRegion]>,
    refcnt: spin::Mutex<u16>,
    runtime_initialized: AtomicBool,
    /// Serializes the runtime initialization.
    init_lock: spin::Mutex<()>,
    next: Option<KBox<P, GuestContext<P>>>,
}

impl<P: Platform> GuestContext<P> {
    pub fn id(&self) -> GuestId {
        self.id
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn mmu_ctx(&self) -> &P::MmuCtx {
        &self.mmu_ctx
    }

    pub fn memory_map(&self) -> &[MmapRegion] {
        &self.memory_map
    }

    pub fn refcnt(&self) -> u16 {
        *self.refcnt.lock()
    }

    pub fn runtime_initialized(&self) -> bool {
        self.runtime_initialized.load(Ordering::Acquire)
    }
}

/// Singly linked list of guest contexts, most recent first.
struct GuestList<P: Platform> {
    head: Option<KBox<P, GuestContext<P>>>,
    len: usize,
}

impl<P: Platform> GuestList<P> {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn push(&mut self, mut ctx: KBox<P, GuestContext<P>>) {
        ctx.next = self.head.take();
        self.head = Some(ctx);
        self.len += 1;
    }

    fn find(&self, id: GuestId) -> Option<&GuestContext<P>> {
        let mut cursor = self.head.as_deref();
        while let Some(ctx) = cursor {
            if ctx.id == id {
                return Some(ctx);
            }
            cursor = ctx.next.as_deref();
        }
        None
    }

    fn remove(&mut self, id: GuestId) -> Option<KBox<P, GuestContext<P>>> {
        let mut cursor = &mut self.head;
        while cursor.as_ref()?.id != id {
            cursor = &mut cursor.as_mut()?.next;
        }
        let mut ctx = cursor.take()?;
        *cursor = ctx.next.take();
        self.len -= 1;
        Some(ctx)
    }
}

/// Clears a fresh guest r/w region and restores its initialized data.
struct DataReseed {
    rw: *mut u8,
    rw_size: usize,
    data: *mut u8,
    pristine: *const u8,
    data_size: usize,
}

impl DataReseed {
    /// # Safety
    ///
    /// The r/w region must be exclusively owned by the caller and the pristine data readable.
    unsafe fn run(self) {
        ptr::write_bytes(self.rw, 0, self.rw_size);
        ptr::copy_nonoverlapping(self.pristine, self.data, self.data_size);
    }
}

// ———————————————————————————————— Registry ———————————————————————————————— //

pub struct GuestRegistry<P: Platform> {
    platform: P,
    config: VirtConfig,
    /// Heap used for the contexts and their memory maps.
    kheap: &'static PoolSet<P::Mask>,
    /// Secure RAM pages handed out to guests.
    pages: SpinLockXsave<TeeMm, P::Mask>,
    kernel_map: spin::Once<&'static [MmapRegion]>,
    guests: SpinLockXsave<GuestList<P>, P::Mask>,
    current: [AtomicPtr<GuestContext<P>>; NB_CORES],
}

impl<P: Platform> GuestRegistry<P> {
    pub fn new(platform: P, config: VirtConfig, kheap: &'static PoolSet<P::Mask>) -> Self {
        Self {
            platform,
            config,
            kheap,
            pages: SpinLockXsave::new(TeeMm::new()),
            kernel_map: spin::Once::new(),
            guests: SpinLockXsave::new(GuestList::new()),
            current: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Creates the page pool over the secure RAM, minus the memory used by the TEE core as
    /// described by `kernel_map`. Guest memory maps are derived from `kernel_map`.
    pub fn init_memory(&self, kernel_map: &'static [MmapRegion]) -> Result<(), VirtError> {
        let start = self.config.secure_ram_start;
        let end = self.config.secure_ram_end;
        let mut pages = self.pages.lock();
        pages.init(start, end, SMALL_PAGE_SHIFT).map_err(|err| {
            log::error!("Can't create pool with free pages");
            FatalError::Extent(err)
        })?;
        log::debug!("Created virtual mapper pool from {} to {}", start, end);

        for region in kernel_map.iter().filter(|region| region.kind.is_core_memory()) {
            log::debug!(
                "Carving out area of type {} ({}-{})",
                region.kind.name(),
                region.pa,
                region.pa + region.size
            );
            // Carved out for good, the extent is never released
            if pages.alloc_at(region.pa, region.size).is_err() {
                log::error!("Can't carve out used area");
                return Err(FatalError::Carveout.into());
            }
        }
        drop(pages);

        self.kernel_map.call_once(|| kernel_map);
        Ok(())
    }

    fn kernel_map(&self) -> &'static [MmapRegion] {
        self.kernel_map.get().copied().unwrap_or(&[])
    }

    /// Creates a context for guest `id`.
    ///
    /// Either the guest is fully set up and registered, or nothing is left behind.
    pub fn guest_created(&self, id: GuestId) -> Result<(), VirtError> {
        if id == HYP_CLNT_ID || self.is_registered(id) {
            log::error!("Invalid guest id {}", id);
            return Err(VirtError::InvalidGuest);
        }

        let slot = PoolBox::<MaybeUninit<GuestContext<P>>, P::Mask>::try_new_uninit(self.kheap)
            .ok_or(VirtError::OutOfMemory)?;
        let ctx = self.configure_guest(id)?;
        let ctx = PoolBox::<MaybeUninit<GuestContext<P>>, P::Mask>::write(slot, ctx);

        self.set_current_ctx(Some(&*ctx));
        self.platform.init_threads();

        let rejected = {
            let mut guests = self.guests.lock();
            if guests.find(id).is_some() {
                Some(ctx)
            } else {
                guests.push(ctx);
                None
            }
        };

        self.set_current_ctx(None);
        self.platform.set_default_mmu_ctx();

        if let Some(ctx) = rejected {
            log::error!("Guest {} was added concurrently", id);
            self.release_guest(ctx)?;
            return Err(VirtError::InvalidGuest);
        }
        log::info!("Added guest {}", id);
        Ok(())
    }

    /// Allocates and maps the guest memory, and switches to the guest translation context.
    fn configure_guest(&self, id: GuestId) -> Result<GuestContext<P>, VirtError> {
        let memory = self.alloc_guest_memory()?;
        match self.map_guest(&memory) {
            Ok((mmu_ctx, memory_map)) => Ok(GuestContext {
                id,
                memory,
                mmu_ctx,
                memory_map,
                refcnt: spin::Mutex::new(0),
                runtime_initialized: AtomicBool::new(false),
                init_lock: spin::Mutex::new(()),
                next: None,
            }),
            Err(err) => {
                memory
                    .release(&mut self.pages.lock())
                    .map_err(FatalError::Extent)?;
                Err(err)
            }
        }
    }

    fn alloc_guest_memory(&self) -> Result<GuestMemory, VirtError> {
        let mut pages = self.pages.lock();

        let tee_ram = pages.alloc(self.config.rw_size).map_err(|err| {
            log::error!("Can't allocate memory for TEE runtime context");
            err
        })?;
        log::debug!("TEE RAM: {}", tee_ram.start());

        let ta_ram = match pages.alloc(self.config.ta_ram_per_guest()) {
            Ok(extent) => extent,
            Err(err) => {
                log::error!("Can't allocate memory for TA data");
                pages.free(tee_ram)?;
                return Err(err.into());
            }
        };
        log::debug!("TA RAM: {}", ta_ram.start());

        let tables = match pages.alloc(self.platform.mmu_tables_size()) {
            Ok(extent) => extent,
            Err(err) => {
                log::error!("Can't allocate memory for page tables");
                pages.free(tee_ram)?;
                pages.free(ta_ram)?;
                return Err(err.into());
            }
        };

        Ok(GuestMemory {
            tee_ram,
            ta_ram,
            tables,
        })
    }

    fn map_guest(
        &self,
        memory: &GuestMemory,
    ) -> Result<(P::MmuCtx, KBox<P, [MmapRegion]>), VirtError> {
        let tables_va = self.sec_ram(memory.tables.start())?;
        let reseed = self.data_reseed(&memory.tee_ram)?;

        let mut mmu_ctx = self
            .platform
            .alloc_mmu_ctx(tables_va)
            .ok_or(VirtError::OutOfMemory)?;
        let Some(memory_map) = self.prepare_memory_map(memory) else {
            self.platform.free_mmu_ctx(mmu_ctx);
            return Err(VirtError::OutOfMemory);
        };
        self.platform.init_mmu_ctx(&mut mmu_ctx, &memory_map);

        self.platform.set_mmu_ctx(&mmu_ctx);
        // SAFETY: the guest r/w region was just allocated, nothing else references it.
        unsafe { reseed.run() };

        Ok((mmu_ctx, memory_map))
    }

    fn prepare_memory_map(&self, memory: &GuestMemory) -> Option<KBox<P, [MmapRegion]>> {
        let kernel_map = self.kernel_map();
        let mut map = PoolBox::<[MmapRegion], P::Mask>::try_new_slice_with(
            guest_map_len(kernel_map),
            self.kheap,
            |_| MmapRegion::EMPTY,
        )?;
        derive_guest_map(
            &mut map,
            kernel_map,
            self.config.rw_start,
            memory.tee_ram.start(),
            memory.ta_ram.start(),
            memory.ta_ram.size(),
        )?;
        Some(map)
    }

    /// Resolves the guest r/w region and the pristine data through the secure RAM alias.
    fn data_reseed(&self, tee_ram: &Extent) -> Result<DataReseed, VirtError> {
        let data_start = self.config.data_start;
        let offset = self
            .config
            .data_offset()
            .ok_or(FatalError::Unmapped(data_start.as_usize()))?;
        let original_data = self
            .platform
            .virt_to_phys(data_start)
            .ok_or(FatalError::Unmapped(data_start.as_usize()))?;

        let rw = self.sec_ram(tee_ram.start())?.as_usize() as *mut u8;
        let pristine = self.sec_ram(original_data)?.as_usize() as *const u8;
        Ok(DataReseed {
            rw,
            rw_size: self.config.rw_size,
            data: rw.wrapping_add(offset),
            pristine,
            data_size: self.config.data_size,
        })
    }

    fn sec_ram(&self, pa: PhysAddr) -> Result<VirtAddr, FatalError> {
        self.platform
            .phys_to_virt(pa, MemArea::SecRamOverall)
            .ok_or(FatalError::Unmapped(pa.as_usize()))
    }

    /// Unregisters guest `id` and releases its memory.
    ///
    /// Destroying a guest that is still running is fatal, its context is then left allocated.
    pub fn guest_destroyed(&self, id: GuestId) -> Result<(), VirtError> {
        log::info!("Removing guest {}", id);

        if id == HYP_CLNT_ID {
            return Ok(());
        }

        let removed = self.guests.lock().remove(id);
        let Some(ctx) = removed else {
            log::error!("Client with id {} is not found", id);
            return Ok(());
        };

        let refcnt = ctx.refcnt();
        if refcnt != 0 {
            log::error!("Guest thread(s) is still running. refcnt = {}", refcnt);
            let _ = PoolBox::leak(ctx);
            return Err(FatalError::GuestInUse { id, refcnt }.into());
        }

        self.release_guest(ctx)
    }

    /// Frees the extents, the translation context, the memory map and finally the context itself.
    fn release_guest(&self, ctx: KBox<P, GuestContext<P>>) -> Result<(), VirtError> {
        let (ctx, slot) = PoolBox::take(ctx);
        let GuestContext {
            memory,
            mmu_ctx,
            memory_map,
            ..
        } = ctx;
        let released = memory.release(&mut self.pages.lock());
        self.platform.free_mmu_ctx(mmu_ctx);
        drop(memory_map);
        drop(slot);
        released.map_err(FatalError::Extent)?;
        Ok(())
    }

    /// Makes guest `id` the current guest of this core.
    pub fn set_guest(&self, id: GuestId) -> Result<(), VirtError> {
        if id == HYP_CLNT_ID {
            return Ok(());
        }

        if let Some(current) = self.current_ctx() {
            // Only when returning from an IRQ RPC, the guest was never left
            if current.id == id {
                return Ok(());
            }
            log::error!("Virtual guest context is already set");
            return Err(FatalError::AlreadyHasGuest {
                current: current.id,
                requested: id,
            }
            .into());
        }

        let guests = self.guests.lock();
        let ctx = guests.find(id).ok_or(VirtError::NotFound)?;
        self.set_current_ctx(Some(ctx));
        self.platform.set_mmu_ctx(&ctx.mmu_ctx);
        *ctx.refcnt.lock() += 1;
        Ok(())
    }

    /// Leaves the current guest, if any.
    pub fn unset_guest(&self) -> Result<(), VirtError> {
        let Some(ctx) = self.current_ctx() else {
            return Ok(());
        };

        self.set_current_ctx(None);
        self.platform.set_default_mmu_ctx();
        let mut refcnt = ctx.refcnt.lock();
        *refcnt = refcnt
            .checked_sub(1)
            .ok_or(FatalError::RefcountUnderflow { id: ctx.id })?;
        Ok(())
    }

    /// Initializes the runtime of the current guest on its first standard call.
    pub fn on_std_call(&self) -> Result<(), VirtError> {
        let ctx = self.current_ctx().ok_or(FatalError::NoCurrentGuest)?;

        if !ctx.runtime_initialized.load(Ordering::Acquire) {
            let _guard = ctx.init_lock.lock();
            if !ctx.runtime_initialized.load(Ordering::Acquire) {
                self.platform.init_runtime();
                ctx.runtime_initialized.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Memory map of the current guest.
    pub fn get_memory_map(&self) -> Option<&[MmapRegion]> {
        self.current_ctx().map(|ctx| ctx.memory_map())
    }

    /// Virtual bounds of the current guest TA RAM.
    pub fn get_ta_ram_range(&self) -> Option<(VirtAddr, VirtAddr)> {
        let ta_ram = &self.current_ctx()?.memory.ta_ram;
        let start = self.platform.phys_to_virt(ta_ram.start(), MemArea::TaRam)?;
        Some((start, start + ta_ram.size()))
    }

    /// Id of the guest current on this core.
    pub fn current_guest(&self) -> Option<GuestId> {
        self.current_ctx().map(|ctx| ctx.id)
    }

    pub fn guest_count(&self) -> usize {
        self.guests.lock().len
    }

    pub fn is_registered(&self, id: GuestId) -> bool {
        self.guests.lock().find(id).is_some()
    }

    /// Runs `f` on the context of guest `id`, with the guest list locked.
    pub fn with_guest<R>(&self, id: GuestId, f: impl FnOnce(&GuestContext<P>) -> R) -> Option<R> {
        self.guests.lock().find(id).map(f)
    }

    /// Secure RAM not yet handed out.
    pub fn bytes_free(&self) -> usize {
        self.pages.lock().bytes_free()
    }

    // ——————————————————————————— Per-core Slots ——————————————————————————— //

    fn current_ctx(&self) -> Option<&GuestContext<P>> {
        let ctx = with_foreign_masked::<P::Mask, _>(|| {
            self.current[self.platform.core_id()].load(Ordering::Acquire)
        });
        // SAFETY: a context can not be destroyed while it is current on a core.
        unsafe { ctx.as_ref() }
    }

    fn set_current_ctx(&self, ctx: Option<&GuestContext<P>>) {
        let ctx = ctx.map_or(ptr::null_mut(), |ctx| ctx as *const _ as *mut _);
        with_foreign_masked::<P::Mask, _>(|| {
            self.current[self.platform.core_id()].store(ctx, Ordering::Release)
        });
    }
}

/// Dumps the free secure RAM pages.
impl<P: Platform> fmt::Display for GuestRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self.pages.lock())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
