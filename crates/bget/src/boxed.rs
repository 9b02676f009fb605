use core::alloc::Layout;
use core::fmt;
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use sync::{ExceptionMask, NoExceptions};

use crate::PoolSet;

/// A Box-like owning pointer whose memory comes from a [PoolSet].
///
/// The value is dropped and its memory returned to the pool set when the box is dropped.
pub struct PoolBox<'p, T: ?Sized, E: ExceptionMask = NoExceptions> {
    ptr: NonNull<T>,
    pool: &'p PoolSet<E>,
}

impl<'p, T, E: ExceptionMask> PoolBox<'p, T, E> {
    /// Moves `value` into memory allocated from `pool`, returns `None` if the pool is exhausted.
    #[track_caller]
    pub fn try_new(value: T, pool: &'p PoolSet<E>) -> Option<Self> {
        let slot = PoolBox::<MaybeUninit<T>, E>::try_new_uninit(pool)?;
        Some(PoolBox::<MaybeUninit<T>, E>::write(slot, value))
    }

    /// Consumes the box without releasing its memory.
    pub fn leak(b: Self) -> &'p mut T {
        // Safe because the memory is never returned to the pool set.
        unsafe { &mut *ManuallyDrop::new(b).ptr.as_ptr() }
    }

    /// Moves the value out of the box, the memory is released when the returned slot is dropped.
    pub fn take(b: Self) -> (T, PoolBox<'p, MaybeUninit<T>, E>) {
        let b = ManuallyDrop::new(b);
        // SAFETY: the value is read exactly once, the slot no longer considers it initialized.
        let value = unsafe { b.ptr.as_ptr().read() };
        let slot = PoolBox {
            ptr: b.ptr.cast(),
            pool: b.pool,
        };
        (value, slot)
    }
}

impl<'p, T, E: ExceptionMask> PoolBox<'p, MaybeUninit<T>, E> {
    /// Allocates room for a `T` without initializing it.
    #[track_caller]
    pub fn try_new_uninit(pool: &'p PoolSet<E>) -> Option<Self> {
        let layout = Layout::new::<T>();
        let ptr = pool.memalign(layout.align(), layout.size())?.cast();
        Some(Self { ptr, pool })
    }

    /// Initializes the box with `value`.
    pub fn write(b: Self, value: T) -> PoolBox<'p, T, E> {
        let b = ManuallyDrop::new(b);
        // SAFETY: the allocation is large enough and aligned for a `T`.
        unsafe { b.ptr.as_ptr().write(MaybeUninit::new(value)) };
        PoolBox {
            ptr: b.ptr.cast(),
            pool: b.pool,
        }
    }
}

impl<'p, T, E: ExceptionMask> PoolBox<'p, [T], E> {
    /// Allocates a slice of `len` items from `pool`, item `i` being initialized to `f(i)`.
    #[track_caller]
    pub fn try_new_slice_with(
        len: usize,
        pool: &'p PoolSet<E>,
        mut f: impl FnMut(usize) -> T,
    ) -> Option<Self> {
        let layout = Layout::array::<T>(len).ok()?;
        let ptr = pool.memalign(layout.align(), layout.size())?.cast::<T>();
        for idx in 0..len {
            // SAFETY: the allocation holds `len` properly aligned `T`.
            unsafe { ptr.as_ptr().add(idx).write(f(idx)) };
        }
        Some(Self {
            ptr: NonNull::slice_from_raw_parts(ptr, len),
            pool,
        })
    }
}

impl<'p, T: Clone, E: ExceptionMask> PoolBox<'p, [T], E> {
    /// Allocates a slice from `pool` holding a clone of `src`.
    #[track_caller]
    pub fn try_new_slice(src: &[T], pool: &'p PoolSet<E>) -> Option<Self> {
        Self::try_new_slice_with(src.len(), pool, |idx| src[idx].clone())
    }
}

impl<'p, T: ?Sized, E: ExceptionMask> PoolBox<'p, T, E> {
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<'p, T: ?Sized, E: ExceptionMask> Drop for PoolBox<'p, T, E> {
    fn drop(&mut self) {
        // Safe because the box owns the value and the memory, which came from `pool`.
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            self.pool.free(self.ptr.cast());
        }
    }
}

impl<'p, T: ?Sized, E: ExceptionMask> Deref for PoolBox<'p, T, E> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safe because this pointer is guaranteed to be valid in the constructor.
        unsafe { self.ptr.as_ref() }
    }
}

impl<'p, T: ?Sized, E: ExceptionMask> DerefMut for PoolBox<'p, T, E> {
    fn deref_mut(&mut self) -> &mut T {
        // Safe because this pointer is guaranteed to be valid in the constructor.
        unsafe { self.ptr.as_mut() }
    }
}

impl<'p, T: ?Sized + fmt::Debug, E: ExceptionMask> fmt::Debug for PoolBox<'p, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// Safety: Like Box<T>, PoolBox<T> is Send/Sync iff T is Send/Sync, the pool set is Sync.
unsafe impl<'p, T: ?Sized + Send, E: ExceptionMask> Send for PoolBox<'p, T, E> {}
unsafe impl<'p, T: ?Sized + Sync, E: ExceptionMask> Sync for PoolBox<'p, T, E> {}
