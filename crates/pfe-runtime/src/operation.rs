#![forbid(unsafe_code)]

//! Operation records, identifiers, outcomes, and events.
//!
//! An [`Operation`] is what readers see: a cloned snapshot of one tracked
//! unit of work. The registry owns the live record; nothing here holds a
//! lock or a reference back into it. Parent/child links are plain
//! [`OperationId`]s resolved through the registry.
//!
//! # State Machine
//!
//! ```text
//! pending ─► running ─┬─► completed
//!                     ├─► failed
//!                     └─► cancelled (user | timeout)
//! ```
//!
//! Terminal states are absorbing. Once terminal, `escalation_level`,
//! `child_ids`, and `progress` are frozen.

use std::fmt;
use std::time::{Duration, Instant};

use pfe_core::cancel::CancelReason;
use pfe_core::config::EscalationLevel;
use pfe_core::progress::Progress;
use serde_json::Value;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque operation identifier. Never reused within one registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(String);

impl OperationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for OperationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for OperationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Status and errors
// ============================================================================

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Check whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of why an operation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The unit of work reported a failure.
    Operation,
    /// The operation exceeded its timeout.
    Timeout,
    /// Infrastructure failure outside the unit of work.
    System,
}

impl ErrorCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::Timeout => "timeout",
            Self::System => "system",
        }
    }
}

/// Failure reported for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl OperationError {
    /// A failure of the unit of work itself.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Operation,
            message: message.into(),
        }
    }

    /// A failure of the surrounding system.
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::System,
            message: message.into(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category.as_str(), self.message)
    }
}

impl std::error::Error for OperationError {}

// ============================================================================
// Outcomes
// ============================================================================

/// Terminal outcome of one child, as seen by its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildOutcome {
    pub id: OperationId,
    pub status: OperationStatus,
    pub result: Option<Value>,
    pub error: Option<OperationError>,
    pub cancel_reason: Option<CancelReason>,
}

impl ChildOutcome {
    pub(crate) fn of(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            status: op.status,
            result: op.result.clone(),
            error: op.error.clone(),
            cancel_reason: op.cancel_reason,
        }
    }
}

/// Outcomes of every child of an operation, in creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositeResult {
    pub children: Vec<ChildOutcome>,
}

impl CompositeResult {
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Check whether every child completed successfully.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.children
            .iter()
            .all(|c| c.status == OperationStatus::Completed)
    }

    /// Number of children that ended in `status`.
    #[must_use]
    pub fn count(&self, status: OperationStatus) -> usize {
        self.children.iter().filter(|c| c.status == status).count()
    }

    /// Completion payloads in creation order (`None` for children without one).
    pub fn results(&self) -> impl Iterator<Item = Option<&Value>> {
        self.children.iter().map(|c| c.result.as_ref())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only snapshot of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub status: OperationStatus,
    pub escalation_level: EscalationLevel,
    pub progress: Progress,
    /// Present only when `status` is `Failed`.
    pub error: Option<OperationError>,
    /// Present only when `status` is `Cancelled`.
    pub cancel_reason: Option<CancelReason>,
    pub start_time: Instant,
    pub finished_at: Option<Instant>,
    pub parent_id: Option<OperationId>,
    /// Children in creation order.
    pub child_ids: Vec<OperationId>,
    pub operation_type: Option<String>,
    pub result: Option<Value>,
    /// Outcomes of all children once the last one settled.
    pub composite: Option<CompositeResult>,
}

impl Operation {
    pub(crate) fn new(
        id: OperationId,
        parent_id: Option<OperationId>,
        operation_type: Option<String>,
        start_time: Instant,
    ) -> Self {
        Self {
            id,
            status: OperationStatus::Pending,
            escalation_level: EscalationLevel::None,
            progress: Progress::default(),
            error: None,
            cancel_reason: None,
            start_time,
            finished_at: None,
            parent_id,
            child_ids: Vec::new(),
            operation_type,
            result: None,
            composite: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent running, up to `now` or the terminal transition.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.finished_at
            .unwrap_or(now)
            .saturating_duration_since(self.start_time)
    }

    /// Category of the failure, treating timeouts as errors.
    ///
    /// A user cancellation is not an error and yields `None`.
    #[must_use]
    pub fn error_category(&self) -> Option<ErrorCategory> {
        match self.status {
            OperationStatus::Failed => self.error.as_ref().map(|e| e.category),
            OperationStatus::Cancelled if self.cancel_reason == Some(CancelReason::Timeout) => {
                Some(ErrorCategory::Timeout)
            }
            _ => None,
        }
    }

    /// Check whether re-running the same work could reasonably succeed.
    ///
    /// Failures of the work itself and timeouts are retryable; system errors
    /// and user cancellations are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.error_category(),
            Some(ErrorCategory::Operation | ErrorCategory::Timeout)
        )
    }
}

// ============================================================================
// Events
// ============================================================================

/// What changed in an [`OperationEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Throttled progress was applied.
    ProgressUpdated,
    /// Feedback intensity increased.
    Escalated(EscalationLevel),
    /// A child was started under this operation.
    ChildStarted(OperationId),
    /// The last outstanding child reached a terminal state.
    ChildrenSettled,
    Completed,
    Failed,
    Cancelled(CancelReason),
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProgressUpdated => "progress_updated",
            Self::Escalated(_) => "escalated",
            Self::ChildStarted(_) => "child_started",
            Self::ChildrenSettled => "children_settled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Check whether this event marks a terminal transition.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled(_))
    }
}

/// A state change delivered to subscribers of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationEvent {
    pub id: OperationId,
    pub kind: EventKind,
    /// State right after the change.
    pub snapshot: Operation,
}
