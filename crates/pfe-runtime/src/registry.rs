#![forbid(unsafe_code)]

//! Operation registry: lifecycle, escalation, cancellation, aggregation.
//!
//! The [`OperationRegistry`] owns every in-flight [`Operation`], the
//! cancellation token of each, the escalation timers, and a progress
//! throttler per operation. It is a cheap, clonable handle; construct one
//! per session and pass it where needed.
//!
//! # Locking
//!
//! All state sits behind a single mutex. Mutations queue
//! [`OperationEvent`]s while the lock is held; the queue is drained after
//! the lock is released by whichever caller wins the dispatch flag. Token
//! callbacks and subscribers therefore never run under the registry lock
//! and may call back into the registry freely. Events for one id are
//! delivered in the order the mutations happened.
//!
//! # Time
//!
//! Every time-dependent method has an `_at(now)` variant. Timers and
//! trailing progress emissions only fire from [`OperationRegistry::tick_at`];
//! hosts call it once per frame or sleep until
//! [`OperationRegistry::next_deadline`].
//!
//! # Invariants
//!
//! 1. Ids are never reused, even after an operation is purged.
//! 2. `escalation_level` never decreases and is frozen once terminal.
//! 3. A terminal operation holds no armed timers.
//! 4. A mutation of one operation changes no other operation's state,
//!    except for parent aggregation and token-driven cancellation of
//!    descendants.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Mutation of unknown id | Logged at `warn`, returns `false` |
//! | Mutation of terminal id | Logged at `debug`, returns `false` |
//! | Subscriber or token callback panics | Logged at `warn`, counted |
//! | Poisoned lock | State recovered; every mutation is applied whole |

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use pfe_core::cancel::{CancelReason, CancellationToken};
use pfe_core::config::{ConfigCatalog, ConfigLayer, EscalationConfig};
use pfe_core::progress::ProgressUpdate;
use pfe_core::throttle::{ProgressThrottler, ThrottleConfig, ThrottleDecision};
use serde_json::Value;

use crate::bus::{NotificationBus, Subscription};
use crate::debug_trace::{self, Mark};
use crate::error::{RegistryError, RegistryResult};
use crate::operation::{
    ChildOutcome, CompositeResult, EventKind, Operation, OperationError, OperationEvent,
    OperationId, OperationStatus,
};
use crate::scheduler::{EscalationScheduler, ScheduledEvent};

// ============================================================================
// Configuration
// ============================================================================

/// Registry-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Global escalation defaults plus per-operation-type layers.
    pub catalog: ConfigCatalog,
    /// Progress rate limit applied to every operation.
    pub throttle: ThrottleConfig,
    /// How long terminal operations stay readable before `tick_at` purges
    /// them. `None` keeps them until [`OperationRegistry::sweep_terminal`].
    pub terminal_retention_ms: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            catalog: ConfigCatalog::default(),
            throttle: ThrottleConfig::default(),
            terminal_retention_ms: Some(30_000),
        }
    }
}

impl RegistryConfig {
    /// Defaults with the global escalation layer read from `PFE_ESCALATION_*`.
    pub fn from_env() -> RegistryResult<Self> {
        let layer = ConfigLayer::from_env()?;
        let global = layer.apply_to(EscalationConfig::default()).normalized();
        Ok(Self::default().with_catalog(ConfigCatalog::new(global)))
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: ConfigCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn with_global(mut self, global: EscalationConfig) -> Self {
        self.catalog.global = global;
        self
    }

    /// Register an operation-type layer (builder pattern).
    #[must_use]
    pub fn with_type(mut self, name: impl Into<String>, layer: ConfigLayer) -> Self {
        self.catalog = self.catalog.with_type(name, layer);
        self
    }

    /// Replace the progress rate limit applied to every operation.
    #[must_use]
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Purge terminal operations this long after they finish. `None` keeps
    /// them until [`OperationRegistry::sweep_terminal`] is called.
    #[must_use]
    pub fn with_retention_ms(mut self, retention_ms: Option<u64>) -> Self {
        self.terminal_retention_ms = retention_ms;
        self
    }
}

// ============================================================================
// Requests and reports
// ============================================================================

/// Parameters for [`OperationRegistry::start_operation`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    /// Caller-chosen id; minted when absent.
    pub id: Option<OperationId>,
    pub parent_id: Option<OperationId>,
    /// Selects the operation-type config layer.
    pub operation_type: Option<String>,
    /// Component-level config layer (most specific).
    pub config: Option<ConfigLayer>,
}

impl StartRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn parent(mut self, parent_id: &OperationId) -> Self {
        self.parent_id = Some(parent_id.clone());
        self
    }

    #[must_use]
    pub fn operation_type(mut self, name: impl Into<String>) -> Self {
        self.operation_type = Some(name.into());
        self
    }

    #[must_use]
    pub fn config(mut self, layer: ConfigLayer) -> Self {
        self.config = Some(layer);
        self
    }
}

/// What one call to [`OperationRegistry::tick_at`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub escalated: usize,
    pub timed_out: usize,
    pub progress_emitted: usize,
    pub purged: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// All cancellations, timeouts included.
    pub cancelled: u64,
    /// Cancellations with reason `Timeout`.
    pub timed_out: u64,
    pub escalations: u64,
    pub progress_emitted: u64,
    pub progress_coalesced: u64,
    pub purged: u64,
    pub notifications_delivered: u64,
    pub subscriber_panics: u64,
}

// ============================================================================
// Internal state
// ============================================================================

struct Entry {
    op: Operation,
    token: CancellationToken,
    config: EscalationConfig,
    throttler: ProgressThrottler,
}

enum Outcome {
    Completed(Option<Value>),
    Failed(OperationError),
    Cancelled(CancelReason),
}

struct RegistryState {
    ops: HashMap<OperationId, Entry>,
    used_ids: HashSet<OperationId>,
    next_seq: u64,
    scheduler: EscalationScheduler,
    queue: VecDeque<OperationEvent>,
    orphaned: Vec<OperationId>,
    config: RegistryConfig,
    stats: RegistryStats,
    /// Latest time observed through any `_at` call.
    clock: Instant,
}

impl RegistryState {
    fn observe(&mut self, now: Instant) {
        if now > self.clock {
            self.clock = now;
        }
    }

    fn mint_id(&mut self) -> OperationId {
        loop {
            self.next_seq += 1;
            let id = OperationId::new(format!("op-{}", self.next_seq));
            if !self.used_ids.contains(&id) {
                return id;
            }
        }
    }

    fn push_event(&mut self, id: &OperationId, kind: EventKind) {
        if let Some(entry) = self.ops.get(id) {
            self.queue.push_back(OperationEvent {
                id: id.clone(),
                kind,
                snapshot: entry.op.clone(),
            });
        }
    }

    fn child_outcomes(&self, parent: &Operation) -> CompositeResult {
        CompositeResult {
            children: parent
                .child_ids
                .iter()
                .filter_map(|child| self.ops.get(child))
                .map(|entry| ChildOutcome::of(&entry.op))
                .collect(),
        }
    }

    fn is_settled(&self, id: &OperationId) -> bool {
        self.ops.get(id).is_none_or(|e| e.op.is_terminal())
    }

    /// Apply a terminal transition. Returns `false` if the operation is
    /// unknown or already terminal.
    fn finish(&mut self, id: &OperationId, outcome: Outcome, now: Instant) -> bool {
        let Some(entry) = self.ops.get_mut(id) else {
            tracing::warn!(op_id = %id, "terminal transition for unknown operation");
            return false;
        };
        if entry.op.is_terminal() {
            tracing::debug!(
                op_id = %id,
                status = entry.op.status.as_str(),
                "operation already terminal"
            );
            return false;
        }

        while let Some(entry) = self.ops.get_mut(id)
            && let Some(progress) = entry.throttler.flush()
        {
            entry.op.progress = progress;
            self.stats.progress_emitted += 1;
            self.push_event(id, EventKind::ProgressUpdated);
        }

        self.scheduler.disarm(id);

        let Some(entry) = self.ops.get_mut(id) else {
            return false;
        };
        entry.op.finished_at = Some(now);
        let kind = match outcome {
            Outcome::Completed(result) => {
                entry.op.status = OperationStatus::Completed;
                entry.op.result = result;
                entry.token.detach_children();
                self.stats.completed += 1;
                EventKind::Completed
            }
            Outcome::Failed(error) => {
                entry.op.status = OperationStatus::Failed;
                entry.op.error = Some(error);
                entry.token.detach_children();
                self.stats.failed += 1;
                EventKind::Failed
            }
            Outcome::Cancelled(reason) => {
                entry.op.status = OperationStatus::Cancelled;
                entry.op.cancel_reason = Some(reason);
                self.stats.cancelled += 1;
                if reason == CancelReason::Timeout {
                    self.stats.timed_out += 1;
                }
                EventKind::Cancelled(reason)
            }
        };

        if kind == EventKind::Completed && !entry.op.child_ids.is_empty() {
            let composite = self.child_outcomes(&self.ops[id].op);
            if let Some(entry) = self.ops.get_mut(id) {
                entry.op.composite = Some(composite);
            }
        }

        let (status, level, parent_id) = {
            let op = &self.ops[id].op;
            (op.status, op.escalation_level, op.parent_id.clone())
        };
        tracing::debug!(
            op_id = %id,
            status = status.as_str(),
            level = level.as_str(),
            "operation finished"
        );
        debug_trace::record(Mark::Finish { id, status, level });
        self.push_event(id, kind);

        if let Some(parent_id) = parent_id {
            self.aggregate_into(&parent_id);
        }
        true
    }

    /// Finish every live operation in the cancelled subtree of `root`.
    ///
    /// Token callbacks normally get there first; this catches records whose
    /// callback is gone (a disposed token). The walk stops at completed or
    /// failed operations, whose children were detached. Returns the tokens
    /// of the operations finished here.
    fn settle_cancelled(
        &mut self,
        root: &OperationId,
        reason: CancelReason,
        now: Instant,
    ) -> Vec<CancellationToken> {
        let mut settled = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            let Some(entry) = self.ops.get(&id) else {
                continue;
            };
            let status = entry.op.status;
            if status.is_terminal() && status != OperationStatus::Cancelled {
                continue;
            }
            stack.extend(entry.op.child_ids.iter().rev().cloned());
            if status.is_terminal() {
                continue;
            }
            let token = entry.token.clone();
            if self.finish(&id, Outcome::Cancelled(reason), now) {
                tracing::debug!(op_id = %id, reason = reason.as_str(), "operation cancelled");
                settled.push(token);
            }
        }
        settled
    }

    /// Attach child outcomes to a running parent once its last child settles.
    fn aggregate_into(&mut self, parent_id: &OperationId) {
        let Some(parent) = self.ops.get(parent_id) else {
            return;
        };
        if parent.op.status != OperationStatus::Running {
            return;
        }
        if !parent.op.child_ids.iter().all(|c| self.is_settled(c)) {
            return;
        }
        let composite = self.child_outcomes(&parent.op);
        tracing::debug!(
            op_id = %parent_id,
            children = composite.len(),
            "children settled"
        );
        if let Some(parent) = self.ops.get_mut(parent_id) {
            parent.op.composite = Some(composite);
        }
        self.push_event(parent_id, EventKind::ChildrenSettled);
    }

    /// Terminal operations that can be dropped without breaking a live tree.
    fn purgeable(&self, entry: &Entry) -> bool {
        entry.op.is_terminal()
            && entry
                .op
                .parent_id
                .as_ref()
                .is_none_or(|p| self.is_settled(p))
            && entry.op.child_ids.iter().all(|c| self.is_settled(c))
    }

    fn purge(&mut self, ids: Vec<OperationId>) -> usize {
        let mut purged = 0;
        for id in ids {
            if let Some(entry) = self.ops.remove(&id) {
                entry.token.dispose();
                self.scheduler.disarm(&id);
                self.orphaned.push(id);
                purged += 1;
            }
        }
        self.stats.purged += purged as u64;
        purged
    }
}

struct Shared {
    state: Mutex<RegistryState>,
    bus: NotificationBus,
    dispatching: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Shared handle to the set of tracked operations.
#[derive(Clone)]
pub struct OperationRegistry {
    shared: Arc<Shared>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("OperationRegistry")
            .field("operations", &state.ops.len())
            .field("queued_events", &state.queue.len())
            .finish()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl OperationRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState {
                    ops: HashMap::new(),
                    used_ids: HashSet::new(),
                    next_seq: 0,
                    scheduler: EscalationScheduler::new(),
                    queue: VecDeque::new(),
                    orphaned: Vec::new(),
                    config,
                    stats: RegistryStats::default(),
                    clock: Instant::now(),
                }),
                bus: NotificationBus::new(),
                dispatching: AtomicBool::new(false),
            }),
        }
    }

    /// Registry configured from `PFE_ESCALATION_*` environment variables.
    pub fn from_env() -> RegistryResult<Self> {
        Ok(Self::new(RegistryConfig::from_env()?))
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Start an operation now.
    pub fn start_operation(&self, request: StartRequest) -> RegistryResult<OperationHandle> {
        self.start_operation_at(request, Instant::now())
    }

    /// Start an operation at `now`.
    pub fn start_operation_at(
        &self,
        request: StartRequest,
        now: Instant,
    ) -> RegistryResult<OperationHandle> {
        let StartRequest {
            id,
            parent_id,
            operation_type,
            config: component,
        } = request;

        let (id, token) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.observe(now);

            let id = match id {
                Some(id) if state.used_ids.contains(&id) => {
                    return Err(RegistryError::DuplicateOperationId(id));
                }
                Some(id) => id,
                None => state.mint_id(),
            };

            let parent_token = match &parent_id {
                None => None,
                Some(pid) => match state.ops.get(pid) {
                    Some(parent) if parent.op.status == OperationStatus::Running => {
                        Some(parent.token.clone())
                    }
                    _ => return Err(RegistryError::ParentNotFound(pid.clone())),
                },
            };

            let token = match parent_token {
                Some(parent) => parent.create_child(),
                None => CancellationToken::new(),
            };
            let config = state
                .config
                .catalog
                .resolve_for(operation_type.as_deref(), component.as_ref());
            let throttler = ProgressThrottler::new(state.config.throttle);

            let mut op = Operation::new(id.clone(), parent_id.clone(), operation_type, now);
            op.status = OperationStatus::Running;

            state.scheduler.arm(&id, now, &config, parent_id.as_ref());
            state.used_ids.insert(id.clone());
            state.ops.insert(
                id.clone(),
                Entry {
                    op,
                    token: token.clone(),
                    config,
                    throttler,
                },
            );
            state.stats.started += 1;

            if let Some(pid) = &parent_id {
                if let Some(parent) = state.ops.get_mut(pid) {
                    parent.op.child_ids.push(id.clone());
                }
                state.push_event(pid, EventKind::ChildStarted(id.clone()));
            }

            tracing::debug!(
                op_id = %id,
                parent_id = parent_id.as_ref().map(OperationId::as_str),
                "operation started"
            );
            debug_trace::record(Mark::Start {
                id: &id,
                parent: parent_id.as_ref(),
            });
            (id, token)
        };

        let weak = Arc::downgrade(&self.shared);
        let watched = id.clone();
        let _registration = token.on_cancel(move |reason| {
            on_token_cancelled(&weak, &watched, reason);
        });

        self.dispatch();
        Ok(OperationHandle {
            id,
            token,
            registry: self.clone(),
        })
    }

    /// Merge a progress update, subject to throttling.
    pub fn update_progress(&self, id: &OperationId, update: ProgressUpdate) -> bool {
        self.update_progress_at(id, update, Instant::now())
    }

    /// Merge a progress update at `now`.
    ///
    /// Returns `true` if the update was accepted (emitted or coalesced).
    pub fn update_progress_at(
        &self,
        id: &OperationId,
        update: ProgressUpdate,
        now: Instant,
    ) -> bool {
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.observe(now);
            let Some(entry) = state.ops.get_mut(id) else {
                tracing::warn!(op_id = %id, "progress update for unknown operation");
                return false;
            };
            if entry.op.is_terminal() {
                tracing::debug!(
                    op_id = %id,
                    status = entry.op.status.as_str(),
                    "progress update after terminal status ignored"
                );
                return false;
            }
            match entry.throttler.push_at(&update, now) {
                ThrottleDecision::Emit(progress) => {
                    entry.op.progress = progress;
                    state.stats.progress_emitted += 1;
                    state.push_event(id, EventKind::ProgressUpdated);
                }
                ThrottleDecision::Coalesced => state.stats.progress_coalesced += 1,
            }
        }
        self.dispatch();
        true
    }

    /// Mark an operation completed.
    pub fn complete_operation(&self, id: &OperationId, result: Option<Value>) -> bool {
        self.complete_operation_at(id, result, Instant::now())
    }

    pub fn complete_operation_at(
        &self,
        id: &OperationId,
        result: Option<Value>,
        now: Instant,
    ) -> bool {
        self.finish_at(id, Outcome::Completed(result), now)
    }

    /// Mark an operation failed. The parent is not affected.
    pub fn fail_operation(&self, id: &OperationId, error: OperationError) -> bool {
        self.fail_operation_at(id, error, Instant::now())
    }

    pub fn fail_operation_at(&self, id: &OperationId, error: OperationError, now: Instant) -> bool {
        self.finish_at(id, Outcome::Failed(error), now)
    }

    /// Cancel an operation and, through its token, every descendant.
    /// Records whose tokens were disposed are settled directly.
    ///
    /// Returns `true` if this call performed the cancellation; terminal or
    /// unknown operations are left untouched.
    pub fn cancel_operation(&self, id: &OperationId) -> bool {
        self.cancel_operation_at(id, Instant::now())
    }

    pub fn cancel_operation_at(&self, id: &OperationId, now: Instant) -> bool {
        let token = {
            let mut state = self.shared.lock();
            state.observe(now);
            match state.ops.get(id) {
                None => {
                    tracing::warn!(op_id = %id, "cancel for unknown operation");
                    return false;
                }
                Some(entry) if entry.op.is_terminal() => {
                    tracing::debug!(op_id = %id, "cancel of terminal operation ignored");
                    return false;
                }
                Some(entry) => entry.token.clone(),
            }
        };
        let cancelled = self.cancel_subtree(id, &token, CancelReason::User, now);
        self.dispatch();
        cancelled
    }

    /// Cancel `token`, then finish any record of the subtree its callbacks
    /// did not reach. Must be called without the state lock held.
    fn cancel_subtree(
        &self,
        id: &OperationId,
        token: &CancellationToken,
        reason: CancelReason,
        now: Instant,
    ) -> bool {
        let cancelled = token.cancel_with(reason);
        let reason = token.reason().unwrap_or(reason);
        let settled = self.shared.lock().settle_cancelled(id, reason, now);
        if !settled.is_empty() {
            tracing::warn!(
                op_id = %id,
                settled = settled.len(),
                "cancellation settled operations without a token callback"
            );
            debug_trace::record(Mark::Settle {
                id,
                count: settled.len(),
            });
        }
        for straggler in &settled {
            straggler.cancel_with(reason);
        }
        cancelled || !settled.is_empty()
    }

    fn finish_at(&self, id: &OperationId, outcome: Outcome, now: Instant) -> bool {
        let finished = {
            let mut state = self.shared.lock();
            state.observe(now);
            state.finish(id, outcome, now)
        };
        self.dispatch();
        finished
    }

    // ── Time ───────────────────────────────────────────────────────────

    /// Fire due timers and trailing progress now.
    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// Fire due escalation and timeout timers, release trailing progress,
    /// and purge expired terminal operations.
    pub fn tick_at(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let timed_out = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.observe(now);

            let mut timed_out = Vec::new();
            for event in state.scheduler.poll(now) {
                match event {
                    ScheduledEvent::Escalate { id, level } => {
                        let Some(entry) = state.ops.get_mut(&id) else {
                            continue;
                        };
                        if entry.op.is_terminal() || level <= entry.op.escalation_level {
                            continue;
                        }
                        entry.op.escalation_level = level;
                        state.stats.escalations += 1;
                        report.escalated += 1;
                        tracing::debug!(op_id = %id, level = level.as_str(), "operation escalated");
                        debug_trace::record(Mark::Escalate { id: &id, level });
                        state.push_event(&id, EventKind::Escalated(level));
                    }
                    ScheduledEvent::TimedOut { id } => {
                        if let Some(entry) = state.ops.get(&id)
                            && !entry.op.is_terminal()
                        {
                            tracing::debug!(op_id = %id, "operation timed out");
                            debug_trace::record(Mark::Timeout { id: &id });
                            timed_out.push((id.clone(), entry.token.clone()));
                        }
                    }
                }
            }

            let mut trailing = Vec::new();
            for (id, entry) in state.ops.iter_mut() {
                if entry.op.is_terminal() || !entry.throttler.has_pending() {
                    continue;
                }
                if let Some(progress) = entry.throttler.tick_at(now) {
                    entry.op.progress = progress;
                    trailing.push(id.clone());
                }
            }
            trailing.sort();
            for id in &trailing {
                state.push_event(id, EventKind::ProgressUpdated);
            }
            report.progress_emitted = trailing.len();
            state.stats.progress_emitted += trailing.len() as u64;

            if let Some(retention) = state.config.terminal_retention_ms.map(Duration::from_millis) {
                let expired: Vec<OperationId> = state
                    .ops
                    .iter()
                    .filter(|(_, e)| state.purgeable(e))
                    .filter(|(_, e)| e.op.finished_at.is_some_and(|at| at + retention <= now))
                    .map(|(id, _)| id.clone())
                    .collect();
                report.purged = state.purge(expired);
            }
            timed_out
        };

        report.timed_out = timed_out.len();
        for (id, token) in &timed_out {
            self.cancel_subtree(id, token, CancelReason::Timeout, now);
        }
        self.dispatch();
        report
    }

    /// Earliest instant at which [`Self::tick_at`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = self.shared.lock();
        let timers = state.scheduler.next_deadline();
        let trailing = state
            .ops
            .values()
            .filter(|e| !e.op.is_terminal())
            .filter_map(|e| e.throttler.next_deadline())
            .min();
        let retention = state
            .config
            .terminal_retention_ms
            .map(Duration::from_millis)
            .and_then(|retention| {
                state
                    .ops
                    .values()
                    .filter(|e| state.purgeable(e))
                    .filter_map(|e| e.op.finished_at.map(|at| at + retention))
                    .min()
            });
        [timers, trailing, retention].into_iter().flatten().min()
    }

    /// Purge every terminal operation that no live tree still references.
    ///
    /// Tokens are disposed; ids stay reserved.
    pub fn sweep_terminal(&self) -> usize {
        let purged = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let ids: Vec<OperationId> = state
                .ops
                .iter()
                .filter(|(_, e)| state.purgeable(e))
                .map(|(id, _)| id.clone())
                .collect();
            state.purge(ids)
        };
        self.dispatch();
        purged
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Snapshot of an operation.
    #[must_use]
    pub fn get_operation(&self, id: &OperationId) -> Option<Operation> {
        self.shared.lock().ops.get(id).map(|e| e.op.clone())
    }

    /// Effective escalation config resolved for an operation at start.
    #[must_use]
    pub fn escalation_config(&self, id: &OperationId) -> Option<EscalationConfig> {
        self.shared.lock().ops.get(id).map(|e| e.config.clone())
    }

    /// Config an operation of `operation_type` with `component` overrides
    /// would get if started now.
    #[must_use]
    pub fn config_for(
        &self,
        operation_type: Option<&str>,
        component: Option<&ConfigLayer>,
    ) -> EscalationConfig {
        self.shared
            .lock()
            .config
            .catalog
            .resolve_for(operation_type, component)
    }

    /// Cancellation token of an operation.
    #[must_use]
    pub fn token(&self, id: &OperationId) -> Option<CancellationToken> {
        self.shared.lock().ops.get(id).map(|e| e.token.clone())
    }

    /// Number of armed escalation and timeout timer handles for `id`.
    #[must_use]
    pub fn active_timer_count(&self, id: &OperationId) -> usize {
        self.shared.lock().scheduler.active_timer_count(id)
    }

    /// Number of operations held (running and retained terminal).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared
            .lock()
            .ops
            .values()
            .filter(|e| e.op.status == OperationStatus::Running)
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = self.shared.lock().stats;
        stats.notifications_delivered = self.shared.bus.delivered();
        stats.subscriber_panics = self.shared.bus.panics();
        stats
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    /// Receive every event of `id` until unsubscribed.
    pub fn subscribe<F>(&self, id: &OperationId, callback: F) -> Subscription
    where
        F: Fn(&OperationEvent) + Send + Sync + 'static,
    {
        if !self.shared.lock().ops.contains_key(id) {
            tracing::debug!(op_id = %id, "subscribing to an operation that is not tracked");
        }
        self.shared.bus.subscribe(id, callback)
    }

    /// Drain queued events to subscribers.
    ///
    /// Only one caller drains at a time; a re-entrant or concurrent caller
    /// leaves its events to the active drainer, which preserves per-id
    /// order.
    fn dispatch(&self) {
        loop {
            if self
                .shared
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let next = {
                    let mut state = self.shared.lock();
                    match state.queue.pop_front() {
                        Some(event) => Ok(event),
                        None => Err(std::mem::take(&mut state.orphaned)),
                    }
                };
                match next {
                    Ok(event) => {
                        self.shared.bus.deliver(&event);
                    }
                    Err(orphaned) => {
                        for id in &orphaned {
                            self.shared.bus.remove_all(id);
                        }
                        break;
                    }
                }
            }

            self.shared.dispatching.store(false, Ordering::Release);
            if self.shared.lock().queue.is_empty() {
                return;
            }
        }
    }
}

/// Token callback: mark the operation cancelled with the token's reason.
fn on_token_cancelled(shared: &Weak<Shared>, id: &OperationId, reason: CancelReason) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let registry = OperationRegistry { shared };
    {
        let mut state = registry.shared.lock();
        let now = state.clock;
        if state.finish(id, Outcome::Cancelled(reason), now) {
            tracing::debug!(op_id = %id, reason = reason.as_str(), "operation cancelled");
        }
    }
    registry.dispatch();
}

// ============================================================================
// Handle
// ============================================================================

/// Handle given to the code doing the work.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    token: CancellationToken,
    registry: OperationRegistry,
}

impl OperationHandle {
    #[must_use]
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Token to poll or wait on for cooperative cancellation.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn update_progress(&self, update: ProgressUpdate) -> bool {
        self.registry.update_progress(&self.id, update)
    }

    pub fn complete(&self, result: Option<Value>) -> bool {
        self.registry.complete_operation(&self.id, result)
    }

    pub fn fail(&self, error: OperationError) -> bool {
        self.registry.fail_operation(&self.id, error)
    }

    pub fn cancel(&self) -> bool {
        self.registry.cancel_operation(&self.id)
    }

    /// Start a child operation under this one.
    pub fn start_child(&self, request: StartRequest) -> RegistryResult<OperationHandle> {
        self.registry.start_operation(request.parent(&self.id))
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<Operation> {
        self.registry.get_operation(&self.id)
    }

    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }
}
