//! A few internal utilities.

use std::any::Any;

/// NaN-aware equality: values are unchanged iff each compares equal to
/// itself and to the other. `f64::NAN -> f64::NAN` counts as unchanged,
/// `f64::NAN -> 1.0` as changed.
pub(crate) fn values_equal<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b || (a != a && b != b)
}

/// Monomorphic entry point for [`values_equal`] over type-erased values, so
/// that untyped node code can compare without knowing `T`.
pub(crate) fn erased_eq<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => values_equal(a, b),
        _ => false,
    }
}

/// Extracts a human-readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<opaque panic payload>")
}

/// Warns through `tracing` when the `trace` feature is enabled, to stderr in
/// debug builds otherwise, and compiles to nothing in release builds.
macro_rules! debug_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "trace")]
        tracing::warn!($($arg)*);
        #[cfg(all(debug_assertions, not(feature = "trace")))]
        eprintln!("[alder-reactive] {}", format_args!($($arg)*));
        #[cfg(all(not(debug_assertions), not(feature = "trace")))]
        {
            let _ = format!($($arg)*);
        }
    }};
}
pub(crate) use debug_warn;
