#![forbid(unsafe_code)]

//! Leading + trailing progress throttler.
//!
//! Work can report progress far faster than anyone can look at it. The
//! throttler sits between [`ProgressUpdate`]s and subscribers and bounds how
//! often a new [`Progress`] is released.
//!
//! # Usage
//!
//! ```
//! use std::time::{Duration, Instant};
//! use pfe_core::progress::ProgressUpdate;
//! use pfe_core::throttle::{ProgressThrottler, ThrottleConfig, ThrottleDecision};
//!
//! let mut throttler = ProgressThrottler::new(ThrottleConfig::default());
//! let t0 = Instant::now();
//!
//! // First update in a quiet window goes straight through.
//! assert!(matches!(
//!     throttler.push_at(&ProgressUpdate::determinate(10.0), t0),
//!     ThrottleDecision::Emit(_)
//! ));
//!
//! // The next one inside the window is held back...
//! let t1 = t0 + Duration::from_millis(5);
//! assert_eq!(
//!     throttler.push_at(&ProgressUpdate::determinate(20.0), t1),
//!     ThrottleDecision::Coalesced
//! );
//!
//! // ...and released at the window boundary.
//! let t2 = t0 + Duration::from_millis(17);
//! assert_eq!(throttler.tick_at(t2).and_then(|p| p.value()), Some(20.0));
//! ```
//!
//! # Decision Rule
//!
//! 1) Merge the update into the latest state.
//! 2) If nothing was emitted yet, or `min_interval` has passed since the last
//!    emission, **emit**. A pinned transition goes out first.
//! 3) Otherwise **coalesce**. If the update turned indeterminate progress
//!    determinate and no transition is pinned yet, pin a snapshot of it.
//! 4) [`ProgressThrottler::tick_at`] releases the pinned snapshot at the
//!    window boundary, then the latest state one window later.
//!
//! # Invariants
//!
//! - **Rate bound**: two emissions are never closer than `min_interval`.
//! - **Transitions are seen**: a determinate state reached from an
//!   indeterminate one is emitted at least once per window in which it
//!   happened, even if later updates in the window switch back.
//! - **Latest wins**: the most recent merged state is always emitted
//!   eventually; nothing is dropped, only merged.
//! - **Deterministic**: identical update/time sequences yield identical
//!   decisions.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `max_rate_hz = 0` | Unthrottled, every push emits |
//! | `tick_at` with nothing pending | Returns `None` |
//! | Clock goes backwards | Treated as inside the window |

use std::time::{Duration, Instant};

use crate::progress::{Progress, ProgressKind, ProgressUpdate};

/// Throttle rate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ThrottleConfig {
    /// Maximum emissions per second. `0` disables throttling.
    pub max_rate_hz: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { max_rate_hz: 60 }
    }
}

impl ThrottleConfig {
    /// Create a config with a custom rate.
    #[must_use]
    pub const fn with_rate(max_rate_hz: u32) -> Self {
        Self { max_rate_hz }
    }

    /// Minimum spacing between two emissions, rounded up to the nanosecond.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        if self.max_rate_hz == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(1_000_000_000u64.div_ceil(self.max_rate_hz as u64))
        }
    }
}

/// Outcome of pushing one update.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    /// Deliver this state now.
    Emit(Progress),
    /// Held back; merged into the pending trailing emission.
    Coalesced,
}

impl ThrottleDecision {
    /// The emitted progress, or `None` if the update was coalesced.
    #[must_use]
    pub fn into_emitted(self) -> Option<Progress> {
        match self {
            Self::Emit(progress) => Some(progress),
            Self::Coalesced => None,
        }
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    /// Updates pushed.
    pub pushed: u64,
    /// States released (leading, trailing, pinned, and flushed).
    pub emitted: u64,
    /// Updates held back for a trailing emission.
    pub coalesced: u64,
    /// Determinate transitions pinned for the next window boundary.
    pub pinned: u64,
}

/// Per-operation throttle state.
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    min_interval: Duration,
    latest: Progress,
    last_emitted: Option<Instant>,
    /// `latest` has changed since it was last emitted or pinned.
    pending: bool,
    /// Determinate snapshot owed to subscribers before `latest`.
    pinned: Option<Progress>,
    stats: ThrottleStats,
}

impl ProgressThrottler {
    /// Create a throttler starting from indeterminate progress.
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self::with_initial(config, Progress::default())
    }

    /// Create a throttler starting from `initial`.
    #[must_use]
    pub fn with_initial(config: ThrottleConfig, initial: Progress) -> Self {
        Self {
            min_interval: config.min_interval(),
            latest: initial,
            last_emitted: None,
            pending: false,
            pinned: None,
            stats: ThrottleStats::default(),
        }
    }

    /// Push an update using the current time.
    pub fn push(&mut self, update: &ProgressUpdate) -> ThrottleDecision {
        self.push_at(update, Instant::now())
    }

    /// Push an update at a specific time.
    pub fn push_at(&mut self, update: &ProgressUpdate, now: Instant) -> ThrottleDecision {
        self.stats.pushed += 1;
        let was = self.latest.kind();
        self.latest.apply(update);
        self.pending = true;

        if self.window_open(now) {
            return ThrottleDecision::Emit(self.emit(now));
        }

        self.stats.coalesced += 1;
        let became_determinate =
            was == ProgressKind::Indeterminate && self.latest.kind() == ProgressKind::Determinate;
        if became_determinate && self.pinned.is_none() {
            self.stats.pinned += 1;
            crate::trace!(
                value = self.latest.value().unwrap_or(0.0) as f64,
                "determinate transition pinned"
            );
            self.pinned = Some(self.latest.clone());
            self.pending = false;
        }
        ThrottleDecision::Coalesced
    }

    /// Release the pending trailing state if its window has closed.
    pub fn tick(&mut self) -> Option<Progress> {
        self.tick_at(Instant::now())
    }

    /// Release the next owed state if its window has closed at `now`.
    pub fn tick_at(&mut self, now: Instant) -> Option<Progress> {
        if self.has_pending() && self.window_open(now) {
            Some(self.emit(now))
        } else {
            None
        }
    }

    /// Release owed state regardless of the window.
    ///
    /// Used at terminal transitions. A pinned transition comes out first and
    /// the latest state on the next call, so call until it returns `None`.
    pub fn flush(&mut self) -> Option<Progress> {
        if let Some(pinned) = self.pinned.take() {
            self.stats.emitted += 1;
            return Some(pinned);
        }
        if !self.pending {
            return None;
        }
        self.pending = false;
        self.stats.emitted += 1;
        Some(self.latest.clone())
    }

    /// Check if a trailing emission is waiting.
    #[inline]
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending || self.pinned.is_some()
    }

    /// When the pending state may be emitted, if anything is pending.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.has_pending() {
            return None;
        }
        self.last_emitted.map(|at| at + self.min_interval)
    }

    /// Time remaining until the pending state may be emitted.
    #[must_use]
    pub fn time_until_emit(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Latest merged state, emitted or not.
    #[must_use]
    pub fn latest(&self) -> &Progress {
        &self.latest
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> ThrottleStats {
        self.stats
    }

    fn window_open(&self, now: Instant) -> bool {
        match self.last_emitted {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.min_interval,
        }
    }

    fn emit(&mut self, now: Instant) -> Progress {
        self.last_emitted = Some(now);
        self.stats.emitted += 1;
        if let Some(pinned) = self.pinned.take() {
            return pinned;
        }
        self.pending = false;
        self.latest.clone()
    }
}
