#![forbid(unsafe_code)]

//! Progressive Feedback Runtime
//!
//! Tracks long-running operations and decides how loudly to tell the user
//! about them. Feedback escalates `none → inline → overlay → modal` as an
//! operation keeps running; cancellation flows down the parent/child tree;
//! progress reaches subscribers at a bounded rate.
//!
//! # Key Components
//!
//! - [`OperationRegistry`] - Owns operations, dispatches events, drives timers
//! - [`OperationHandle`] - Bound handle given to the code doing the work
//! - [`EscalationScheduler`] - Per-level timers, shared between parent and child
//! - [`NotificationBus`] - Per-id subscriber fan-out
//! - [`SourceBridge`] - Channel from worker threads to the registry
//!
//! # How it fits in the system
//! Leaf pieces (tokens, config resolution, throttling) live in `pfe-core`.
//! Rendering is left to the host: it subscribes to operations, reads
//! `escalation_level`, and calls [`OperationRegistry::tick`] every frame.

pub mod bus;
pub mod debug_trace;
pub mod error;
pub mod operation;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod timer;

pub use bus::{NotificationBus, Subscription};
pub use error::{RegistryError, RegistryResult};
pub use operation::{
    ChildOutcome, CompositeResult, ErrorCategory, EventKind, Operation, OperationError,
    OperationEvent, OperationId, OperationStatus,
};
pub use registry::{
    OperationHandle, OperationRegistry, RegistryConfig, RegistryStats, StartRequest, TickReport,
};
pub use scheduler::{EscalationScheduler, ScheduledEvent};
pub use source::{SourceBridge, SourceEvent, SourceSender, apply_source_event};

pub use pfe_core::{
    CancelReason, CancellationToken, ConfigLayer, EscalationConfig, EscalationLevel, Progress,
    ProgressKind, ProgressUpdate, TimeoutPolicy,
};
