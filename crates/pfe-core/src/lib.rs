#![forbid(unsafe_code)]
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

//! Core: cancellation tokens, escalation config resolution, progress values,
//! and progress throttling.
//!
//! Everything here is a leaf: no module depends on another except through
//! plain value types, and nothing owns a thread or a clock. Time-dependent
//! operations take an explicit `Instant` in their `_at` variants.

pub mod cancel;
pub mod config;
pub mod guard;
pub mod logging;
pub mod progress;
pub mod throttle;

// Re-export tracing macros at crate root for ergonomic use.
#[cfg(feature = "tracing")]
pub use logging::{debug, trace, warn};

pub use cancel::{CancelReason, CancelRegistration, CancellationToken};
pub use config::{
    ConfigCatalog, ConfigError, ConfigLayer, EscalationConfig, EscalationLevel, LevelFlags,
    TimeoutPolicy,
};
pub use progress::{Progress, ProgressKind, ProgressUpdate};
pub use throttle::{ProgressThrottler, ThrottleConfig, ThrottleDecision, ThrottleStats};
