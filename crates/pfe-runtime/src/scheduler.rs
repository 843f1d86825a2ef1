#![forbid(unsafe_code)]

//! Escalation timers for running operations.
//!
//! The scheduler arms one timer per enabled escalation level at
//! `start + threshold`, plus an optional timeout timer, and reports what
//! fired when polled. It knows nothing about operation state; the registry
//! decides what a fired timer means.
//!
//! # Shared Timers
//!
//! A child started while its parent still has an armed timer for a level
//! follows that timer instead of arming its own, provided the parent's
//! deadline is not later than the child's own. One firing then escalates
//! the parent and every follower together. A shared timer is cancelled only
//! when its last follower disarms.
//!
//! ```text
//! parent: ──●inline──────●overlay──────────●modal
//! child:        └ follows ┘ └──── follows ──┘
//! ```
//!
//! # Invariants
//!
//! 1. Disabled levels are never armed.
//! 2. After [`EscalationScheduler::disarm`], no event is ever reported for
//!    that operation.
//! 3. Events for one timer are reported in arm order (parent before
//!    followers).

use std::collections::HashMap;
use std::time::Instant;

use pfe_core::config::{EscalationConfig, EscalationLevel};

use crate::operation::OperationId;
use crate::timer::{TimerId, TimerQueue};

/// What a fired timer means for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledEvent {
    /// The operation reached `level`.
    Escalate {
        id: OperationId,
        level: EscalationLevel,
    },
    /// The operation's timeout elapsed.
    TimedOut { id: OperationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Level(EscalationLevel),
    Timeout,
}

#[derive(Debug, Default)]
struct ArmedTimers {
    levels: [Option<TimerId>; 3],
    timeout: Option<TimerId>,
}

impl ArmedTimers {
    fn handles(&self) -> impl Iterator<Item = TimerId> + '_ {
        self.levels.iter().flatten().copied().chain(self.timeout)
    }

    fn clear(&mut self, timer: TimerId) {
        for slot in &mut self.levels {
            if *slot == Some(timer) {
                *slot = None;
            }
        }
        if self.timeout == Some(timer) {
            self.timeout = None;
        }
    }

    fn count(&self) -> usize {
        self.handles().count()
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Timers created.
    pub armed: u64,
    /// Level slots that followed a parent's timer instead of arming one.
    pub shared: u64,
    /// Timers that fired.
    pub fired: u64,
    /// Timers cancelled before firing.
    pub cancelled: u64,
}

/// Arms and reports escalation and timeout timers.
#[derive(Debug, Default)]
pub struct EscalationScheduler {
    queue: TimerQueue<TimerKind>,
    followers: HashMap<TimerId, Vec<OperationId>>,
    ops: HashMap<OperationId, ArmedTimers>,
    stats: SchedulerStats,
}

impl EscalationScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm timers for an operation that started at `start`.
    ///
    /// Re-arming an id first disarms its previous timers.
    pub fn arm(
        &mut self,
        id: &OperationId,
        start: Instant,
        config: &EscalationConfig,
        parent: Option<&OperationId>,
    ) {
        if self.ops.contains_key(id) {
            self.disarm(id);
        }

        let mut armed = ArmedTimers::default();
        for (level, offset) in config.armed_levels() {
            let Some(slot) = level.timed_index() else {
                continue;
            };
            let deadline = start + offset;
            let shared = parent
                .and_then(|p| self.ops.get(p))
                .and_then(|p| p.levels[slot])
                .filter(|timer| {
                    self.queue
                        .deadline(*timer)
                        .is_some_and(|at| at <= deadline)
                });

            let timer = match shared {
                Some(timer) => {
                    self.stats.shared += 1;
                    timer
                }
                None => {
                    self.stats.armed += 1;
                    self.queue.schedule(deadline, TimerKind::Level(level))
                }
            };
            self.followers.entry(timer).or_default().push(id.clone());
            armed.levels[slot] = Some(timer);
        }

        if let Some(after) = config.timeout.duration() {
            let timer = self.queue.schedule(start + after, TimerKind::Timeout);
            self.stats.armed += 1;
            self.followers.insert(timer, vec![id.clone()]);
            armed.timeout = Some(timer);
        }

        tracing::trace!(
            op_id = %id,
            timers = armed.count(),
            shared = parent.is_some(),
            "escalation timers armed"
        );
        self.ops.insert(id.clone(), armed);
    }

    /// Disarm every pending timer of an operation.
    ///
    /// Returns the number of handles released. Shared timers stay armed
    /// while other operations still follow them.
    pub fn disarm(&mut self, id: &OperationId) -> usize {
        let Some(armed) = self.ops.remove(id) else {
            return 0;
        };
        let mut released = 0;
        for timer in armed.handles() {
            released += 1;
            let now_empty = match self.followers.get_mut(&timer) {
                Some(list) => {
                    list.retain(|follower| follower != id);
                    list.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.followers.remove(&timer);
                if self.queue.cancel(timer).is_some() {
                    self.stats.cancelled += 1;
                }
            }
        }
        released
    }

    /// Report every timer due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<ScheduledEvent> {
        let mut events = Vec::new();
        for (timer, kind) in self.queue.pop_due(now) {
            self.stats.fired += 1;
            let followers = self.followers.remove(&timer).unwrap_or_default();
            for id in followers {
                if let Some(armed) = self.ops.get_mut(&id) {
                    armed.clear(timer);
                }
                events.push(match kind {
                    TimerKind::Level(level) => ScheduledEvent::Escalate { id, level },
                    TimerKind::Timeout => ScheduledEvent::TimedOut { id },
                });
            }
        }
        events
    }

    /// Number of still-armed timer handles held by an operation.
    #[must_use]
    pub fn active_timer_count(&self, id: &OperationId) -> usize {
        self.ops.get(id).map_or(0, ArmedTimers::count)
    }

    /// Earliest pending deadline across all operations.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Number of distinct armed timers.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfe_core::config::TimeoutPolicy;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn id(s: &str) -> OperationId {
        OperationId::from(s)
    }

    fn escalations(events: &[ScheduledEvent]) -> Vec<(String, EscalationLevel)> {
        events
            .iter()
            .filter_map(|e| match e {
                ScheduledEvent::Escalate { id, level } => Some((id.to_string(), *level)),
                ScheduledEvent::TimedOut { .. } => None,
            })
            .collect()
    }

    #[test]
    fn levels_fire_at_absolute_offsets() {
        let t0 = Instant::now();
        let mut s = EscalationScheduler::new();
        s.arm(&id("a"), t0, &EscalationConfig::default(), None);
        assert_eq!(s.active_timer_count(&id("a")), 3);

        assert!(s.poll(t0 + ms(199)).is_empty());
        assert_eq!(
            escalations(&s.poll(t0 + ms(200))),
            vec![("a".into(), EscalationLevel::Inline)]
        );
        assert_eq!(s.active_timer_count(&id("a")), 2);
        assert_eq!(
            escalations(&s.poll(t0 + ms(5000))),
            vec![
                ("a".into(), EscalationLevel::Overlay),
                ("a".into(), EscalationLevel::Modal)
            ]
        );
        assert_eq!(s.active_timer_count(&id("a")), 0);
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn disarm_before_threshold_reports_nothing() {
        let t0 = Instant::now();
        let mut s = EscalationScheduler::new();
        s.arm(&id("a"), t0, &EscalationConfig::default(), None);
        assert_eq!(s.disarm(&id("a")), 3);
        assert!(s.poll(t0 + ms(10_000)).is_empty());
        assert_eq!(s.armed_timers(), 0);
        assert_eq!(s.disarm(&id("a")), 0);
    }

    #[test]
    fn disabled_levels_are_not_armed() {
        let t0 = Instant::now();
        let config = EscalationConfig::default().with_level(EscalationLevel::Inline, false);
        let mut s = EscalationScheduler::new();
        s.arm(&id("a"), t0, &config, None);
        assert_eq!(s.active_timer_count(&id("a")), 2);
        assert_eq!(s.next_deadline(), Some(t0 + ms(500)));
        assert_eq!(
            escalations(&s.poll(t0 + ms(600))),
            vec![("a".into(), EscalationLevel::Overlay)]
        );
    }

    #[test]
    fn timeout_timer_fires_separately() {
        let t0 = Instant::now();
        let config = EscalationConfig::default().with_timeout(TimeoutPolicy::AfterMs(300));
        let mut s = EscalationScheduler::new();
        s.arm(&id("a"), t0, &config, None);
        assert_eq!(s.active_timer_count(&id("a")), 4);

        let events = s.poll(t0 + ms(300));
        assert_eq!(
            events,
            vec![
                ScheduledEvent::Escalate {
                    id: id("a"),
                    level: EscalationLevel::Inline
                },
                ScheduledEvent::TimedOut { id: id("a") },
            ]
        );
    }

    #[test]
    fn child_follows_earlier_parent_timer() {
        let t0 = Instant::now();
        let config = EscalationConfig::default();
        let mut s = EscalationScheduler::new();
        s.arm(&id("parent"), t0, &config, None);
        s.arm(&id("child"), t0 + ms(50), &config, Some(&id("parent")));

        // All three child levels follow the parent's timers.
        assert_eq!(s.armed_timers(), 3);
        assert_eq!(s.stats().shared, 3);

        assert_eq!(
            escalations(&s.poll(t0 + ms(200))),
            vec![
                ("parent".into(), EscalationLevel::Inline),
                ("child".into(), EscalationLevel::Inline)
            ]
        );
    }

    #[test]
    fn child_with_earlier_deadline_arms_its_own() {
        let t0 = Instant::now();
        let mut s = EscalationScheduler::new();
        s.arm(&id("parent"), t0, &EscalationConfig::default(), None);
        let eager = EscalationConfig::default().with_thresholds(50, 500, 2000);
        s.arm(&id("child"), t0, &eager, Some(&id("parent")));

        assert_eq!(s.armed_timers(), 4);
        assert_eq!(
            escalations(&s.poll(t0 + ms(60))),
            vec![("child".into(), EscalationLevel::Inline)]
        );
    }

    #[test]
    fn shared_timer_survives_until_last_follower_disarms() {
        let t0 = Instant::now();
        let config = EscalationConfig::default();
        let mut s = EscalationScheduler::new();
        s.arm(&id("parent"), t0, &config, None);
        s.arm(&id("child"), t0, &config, Some(&id("parent")));

        s.disarm(&id("parent"));
        assert_eq!(s.armed_timers(), 3);
        assert_eq!(s.active_timer_count(&id("parent")), 0);

        assert_eq!(
            escalations(&s.poll(t0 + ms(200))),
            vec![("child".into(), EscalationLevel::Inline)]
        );

        s.disarm(&id("child"));
        assert_eq!(s.armed_timers(), 0);
        assert!(s.poll(t0 + ms(10_000)).is_empty());
    }

    #[test]
    fn fired_parent_level_is_not_shared() {
        let t0 = Instant::now();
        let config = EscalationConfig::default();
        let mut s = EscalationScheduler::new();
        s.arm(&id("parent"), t0, &config, None);
        s.poll(t0 + ms(250));

        s.arm(&id("child"), t0 + ms(250), &config, Some(&id("parent")));
        // Inline is the child's own; overlay and modal follow the parent.
        assert_eq!(s.stats().shared, 2);
        assert_eq!(s.next_deadline(), Some(t0 + ms(450)));
    }

    #[test]
    fn rearm_replaces_previous_timers() {
        let t0 = Instant::now();
        let mut s = EscalationScheduler::new();
        s.arm(&id("a"), t0, &EscalationConfig::default(), None);
        s.arm(&id("a"), t0 + ms(1000), &EscalationConfig::default(), None);
        assert_eq!(s.armed_timers(), 3);
        assert_eq!(s.next_deadline(), Some(t0 + ms(1200)));
    }
}
