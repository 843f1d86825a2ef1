#![forbid(unsafe_code)]

//! Logging facade for the leaf components.
//!
//! With the `tracing` feature enabled the macros below are plain re-exports of
//! the `tracing` crate. Without it they expand to nothing, so token callbacks
//! and the config resolver can log unconditionally at no cost.
//!
//! Use them through the crate root (`crate::warn!`, `pfe_core::debug!`) so call
//! sites compile the same way in both configurations.

#[cfg(feature = "tracing")]
pub use tracing::{debug, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop_macros {
    /// No-op debug macro when tracing is disabled.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op trace macro when tracing is disabled.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op warn macro when tracing is disabled.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }
}
