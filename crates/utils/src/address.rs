//! Address representation
use core::fmt;
use core::ops::{Add, Sub};

/// A macro for implementing addresses types.
///
/// An address is just a wrapper around an `usize`, with getter and alignment helpers.
macro_rules! addr_impl {
    ($name:ident) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Creates an address that points to `0`.
            #[inline]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "`align` must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns address downwards.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                Self::new(align_down(self.0, align))
            }

            /// Aligns address upwards.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                match align_up(self.0, align) {
                    Some(aligned) => Self::new(aligned),
                    None => panic!("Attempt to add with overflow"),
                }
            }

            /// Adds `offset` bytes, returning `None` on overflow.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(addr) => Some(Self::new(addr)),
                    None => None,
                }
            }

            /// Distance in bytes from `base` to `self`, `None` if `self` is below `base`.
            #[inline]
            pub const fn offset_from(self, base: Self) -> Option<usize> {
                self.0.checked_sub(base.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;
            fn add(self, other: usize) -> Self {
                return Self::new(self.as_usize() + other);
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;
            fn sub(self, other: usize) -> Self {
                return Self::new(self.as_usize() - other);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

addr_impl!(PhysAddr);
addr_impl!(VirtAddr);

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "`align` must be a power of two");
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
///
/// Returns `None` if the result does not fit in an `usize`.
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    assert!(align.is_power_of_two(), "`align` must be a power of two");
    let align_mask = align - 1;
    if value & align_mask == 0 {
        Some(value)
    } else {
        (value | align_mask).checked_add(1)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_up(0x1234, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align_up(usize::MAX, 0x10), None);

        let addr = PhysAddr::new(0x4410_0010);
        assert!(!addr.is_aligned(0x1000));
        assert_eq!(addr.align_down(0x1000), PhysAddr::new(0x4410_0000));
        assert_eq!(addr.align_up(0x1000), PhysAddr::new(0x4410_1000));
    }

    #[test]
    fn offsets() {
        let base = VirtAddr::new(0x1000);
        assert_eq!((base + 0x20).offset_from(base), Some(0x20));
        assert_eq!(base.offset_from(base + 1), None);
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
        assert_eq!(format!("{}", base), "0x1000");
    }
}
