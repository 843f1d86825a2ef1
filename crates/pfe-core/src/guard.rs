#![forbid(unsafe_code)]

//! Panic containment for user-supplied callbacks.
//!
//! Cancellation callbacks and operation subscribers are foreign code. A panic
//! in one of them must not unwind through the token or registry that invoked
//! it, and must not stop the remaining callbacks from running.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// A panic caught while running a guarded callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPanic {
    /// Panic message, or `"unknown panic"` for non-string payloads.
    pub message: String,
}

impl CapturedPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self { message }
    }
}

impl fmt::Display for CapturedPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback panicked: {}", self.message)
    }
}

impl std::error::Error for CapturedPanic {}

/// Run `f`, converting a panic into a [`CapturedPanic`].
///
/// Callers hold no locks while invoking this, so the unwind-safety assertion
/// only covers state owned by the closure itself.
pub fn run_guarded<F>(f: F) -> Result<(), CapturedPanic>
where
    F: FnOnce(),
{
    catch_unwind(AssertUnwindSafe(f)).map_err(CapturedPanic::from_payload)
}
