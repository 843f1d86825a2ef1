#![forbid(unsafe_code)]

//! Env-gated stderr timeline of operation lifecycles.
//!
//! Set `PFE_DEBUG_TRACE=1` (or `true`) and every start, escalation, timeout,
//! and finish prints one line keyed by operation id:
//!
//! ```text
//! [PFE       0ms] op-3 start parent=op-1
//! [PFE     200ms] op-3 escalate inline
//! [PFE     512ms] op-3 timeout
//! [PFE     512ms] op-3 finish cancelled level=inline
//! ```
//!
//! Unlike `tracing` output this needs no subscriber, so it still works when a
//! host app swallows logs. Grepping for one id gives that operation's whole
//! history.

use std::fmt;
use std::sync::LazyLock;
use std::time::Instant;

use pfe_core::config::EscalationLevel;

use crate::operation::{OperationId, OperationStatus};

/// Environment variable that enables the timeline.
pub const ENV_VAR: &str = "PFE_DEBUG_TRACE";

static ENABLED: LazyLock<bool> =
    LazyLock::new(|| flag_enabled(std::env::var(ENV_VAR).ok().as_deref()));

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

fn flag_enabled(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Check if the timeline is enabled. A single bool load after first use.
#[inline]
pub fn is_enabled() -> bool {
    *ENABLED
}

/// One lifecycle step of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark<'a> {
    Start {
        id: &'a OperationId,
        parent: Option<&'a OperationId>,
    },
    Escalate {
        id: &'a OperationId,
        level: EscalationLevel,
    },
    Timeout {
        id: &'a OperationId,
    },
    /// Records finished by the registry itself because the token had no
    /// callback left to report the cancellation.
    Settle {
        id: &'a OperationId,
        count: usize,
    },
    Finish {
        id: &'a OperationId,
        status: OperationStatus,
        level: EscalationLevel,
    },
}

impl Mark<'_> {
    /// The operation this mark belongs to.
    #[must_use]
    pub fn id(&self) -> &OperationId {
        match self {
            Self::Start { id, .. }
            | Self::Escalate { id, .. }
            | Self::Timeout { id }
            | Self::Settle { id, .. }
            | Self::Finish { id, .. } => id,
        }
    }
}

impl fmt::Display for Mark<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.id())?;
        match self {
            Self::Start { parent: None, .. } => f.write_str("start"),
            Self::Start {
                parent: Some(parent),
                ..
            } => write!(f, "start parent={parent}"),
            Self::Escalate { level, .. } => write!(f, "escalate {level}"),
            Self::Timeout { .. } => f.write_str("timeout"),
            Self::Settle { count, .. } => write!(f, "settle count={count}"),
            Self::Finish { status, level, .. } => write!(f, "finish {status} level={level}"),
        }
    }
}

/// Format a timeline line for `mark` at `elapsed_ms` since the first trace.
#[must_use]
pub fn line(elapsed_ms: u64, mark: &Mark<'_>) -> String {
    format!("[PFE {elapsed_ms:>8}ms] {mark}")
}

/// Print `mark` to stderr when `PFE_DEBUG_TRACE` is set.
#[inline]
pub fn record(mark: Mark<'_>) {
    if is_enabled() {
        let elapsed = EPOCH.elapsed().as_millis() as u64;
        eprintln!("{}", line(elapsed, &mark));
    }
}
