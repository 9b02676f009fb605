//! Synchronization primitives
//!
//! Locks in the TEE core must not be taken from a foreign interrupt handler on a core that already
//! holds them, so every spinlock here masks foreign interrupts for as long as it is held. The
//! actual masking is platform specific and provided through [ExceptionMask].
#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

// ————————————————————————————— Exception Mask ————————————————————————————— //

/// Interrupt-mask primitives of the current core.
pub trait ExceptionMask {
    /// Masks foreign interrupts on the current core and returns the previous mask state.
    fn mask_foreign() -> u32;

    /// Restores a mask state previously returned by [ExceptionMask::mask_foreign].
    fn restore(state: u32);
}

/// No interrupts to mask, used when running outside of the TEE core (host tests, user mode).
pub struct NoExceptions;

impl ExceptionMask for NoExceptions {
    fn mask_foreign() -> u32 {
        0
    }

    fn restore(_state: u32) {}
}

/// Runs `f` with foreign interrupts masked on the current core.
pub fn with_foreign_masked<E: ExceptionMask, R>(f: impl FnOnce() -> R) -> R {
    let exceptions = E::mask_foreign();
    let result = f();
    E::restore(exceptions);
    result
}

// ————————————————————————————— Xsave Spinlock ————————————————————————————— //

/// A spinlock that masks foreign interrupts while held.
pub struct SpinLockXsave<T, E> {
    inner: spin::Mutex<T>,
    _mask: PhantomData<fn() -> E>,
}

impl<T, E: ExceptionMask> SpinLockXsave<T, E> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            _mask: PhantomData,
        }
    }

    /// Masks foreign interrupts, then spins until the lock is acquired.
    pub fn lock(&self) -> XsaveGuard<'_, T, E> {
        let exceptions = E::mask_foreign();
        XsaveGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            exceptions,
            _mask: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct XsaveGuard<'a, T, E: ExceptionMask> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    exceptions: u32,
    _mask: PhantomData<fn() -> E>,
}

impl<'a, T, E: ExceptionMask> Deref for XsaveGuard<'a, T, E> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T, E: ExceptionMask> DerefMut for XsaveGuard<'a, T, E> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T, E: ExceptionMask> Drop for XsaveGuard<'a, T, E> {
    fn drop(&mut self) {
        // The lock must be released before interrupts are unmasked.
        // SAFETY: the guard is never used again after this point.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        E::restore(self.exceptions);
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
