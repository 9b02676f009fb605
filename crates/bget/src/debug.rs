//! Debug utilities

/// Run a consistency check in debug builds, or when pool validation is enabled.
macro_rules! debug_check {
    ($check:expr) => {
        if cfg!(any(debug_assertions, feature = "validate")) {
            $check;
        }
    };
}

pub(crate) use debug_check;

/// Snapshot testing
///
/// Checks that the given struct matches the provided snapshot.
#[cfg(test)]
pub(crate) fn snap<T: core::fmt::Display>(snap: &str, obj: T) {
    assert_eq!(snap, &format!("{}", obj));
}
