#![forbid(unsafe_code)]

//! Bridge from work-side progress notifications to the registry.
//!
//! Background work does not touch the registry directly. It reports
//! [`SourceEvent`]s through a [`SourceSender`]; the host thread calls
//! [`SourceBridge::pump`] (typically right before
//! [`OperationRegistry::tick`]) to apply them in arrival order.
//!
//! ```text
//! worker ──SourceSender──► mpsc ──pump()──► OperationRegistry
//! ```
//!
//! Hosts that already own a channel can skip the bridge and call
//! [`apply_source_event`] directly.

use std::sync::mpsc;
use std::time::Instant;

use pfe_core::progress::ProgressUpdate;
use serde_json::Value;

use crate::operation::{OperationError, OperationId};
use crate::registry::OperationRegistry;

/// Notification emitted by a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Work counters; `total == 0` means the total is unknown.
    Progress {
        current: u64,
        total: u64,
        message: Option<String>,
    },
    Complete { result: Option<Value> },
    Error { message: String },
    Cancelled,
}

/// Apply one source event to the registry.
///
/// Returns whatever the underlying registry call returned: `false` for
/// unknown or already-terminal operations.
pub fn apply_source_event(
    registry: &OperationRegistry,
    id: &OperationId,
    event: SourceEvent,
    now: Instant,
) -> bool {
    match event {
        SourceEvent::Progress {
            current,
            total,
            message,
        } => {
            let update = ProgressUpdate::from_counts(current, total, message);
            registry.update_progress_at(id, update, now)
        }
        SourceEvent::Complete { result } => registry.complete_operation_at(id, result, now),
        SourceEvent::Error { message } => {
            registry.fail_operation_at(id, OperationError::new(message), now)
        }
        SourceEvent::Cancelled => registry.cancel_operation_at(id, now),
    }
}

/// Cloneable sending half handed to workers.
#[derive(Debug, Clone)]
pub struct SourceSender {
    sender: mpsc::Sender<(OperationId, SourceEvent)>,
}

impl SourceSender {
    /// Queue an event. Returns `false` if the bridge was dropped.
    pub fn send(&self, id: &OperationId, event: SourceEvent) -> bool {
        self.sender.send((id.clone(), event)).is_ok()
    }

    /// Queue a determinate `current / total` update.
    pub fn progress(&self, id: &OperationId, current: u64, total: u64) -> bool {
        self.send(
            id,
            SourceEvent::Progress {
                current,
                total,
                message: None,
            },
        )
    }

    /// Queue completion with an optional result payload.
    pub fn complete(&self, id: &OperationId, result: Option<Value>) -> bool {
        self.send(id, SourceEvent::Complete { result })
    }

    /// Queue a failure with `message`.
    pub fn error(&self, id: &OperationId, message: impl Into<String>) -> bool {
        self.send(
            id,
            SourceEvent::Error {
                message: message.into(),
            },
        )
    }
}

/// Receiving end, owned by the host thread.
#[derive(Debug)]
pub struct SourceBridge {
    sender: mpsc::Sender<(OperationId, SourceEvent)>,
    receiver: mpsc::Receiver<(OperationId, SourceEvent)>,
}

impl Default for SourceBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceBridge {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    #[must_use]
    pub fn sender(&self) -> SourceSender {
        SourceSender {
            sender: self.sender.clone(),
        }
    }

    /// Apply every queued event now. Returns the number applied.
    pub fn pump(&self, registry: &OperationRegistry) -> usize {
        self.pump_at(registry, Instant::now())
    }

    /// Apply every queued event at `now`, in arrival order.
    pub fn pump_at(&self, registry: &OperationRegistry, now: Instant) -> usize {
        let mut applied = 0;
        while let Ok((id, event)) = self.receiver.try_recv() {
            tracing::trace!(op_id = %id, ?event, "source event");
            apply_source_event(registry, &id, event, now);
            applied += 1;
        }
        applied
    }
}
