#![forbid(unsafe_code)]

//! End-to-end lifecycle tests for the operation registry.
//!
//! Each test drives the registry with injected time and checks what
//! subscribers and snapshots observe.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pfe_runtime::{
    CancelReason, ConfigLayer, EscalationLevel, EventKind, OperationEvent, OperationId,
    OperationRegistry, OperationStatus, ProgressKind, ProgressUpdate, RegistryConfig,
    SourceBridge, StartRequest, TimeoutPolicy,
};
use serde_json::json;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn registry() -> OperationRegistry {
    OperationRegistry::new(RegistryConfig::default().with_retention_ms(None))
}

type Log = Arc<Mutex<Vec<OperationEvent>>>;

fn record(registry: &OperationRegistry, id: &OperationId) -> Log {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    // Dropping the handle keeps the listener registered.
    let _ = registry.subscribe(id, move |event| sink.lock().unwrap().push(event.clone()));
    log
}

fn kinds(log: &Log) -> Vec<EventKind> {
    log.lock().unwrap().iter().map(|e| e.kind.clone()).collect()
}

// ═════════════════════════════════════════════════════════════════════════
// Escalation
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn escalation_walks_every_level_in_order() {
    let reg = registry();
    let t0 = Instant::now();
    let h = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let log = record(&reg, h.id());

    let mut now = t0;
    while now <= t0 + ms(2100) {
        reg.tick_at(now);
        now += ms(10);
    }

    assert_eq!(
        kinds(&log),
        vec![
            EventKind::Escalated(EscalationLevel::Inline),
            EventKind::Escalated(EscalationLevel::Overlay),
            EventKind::Escalated(EscalationLevel::Modal),
        ]
    );
    let levels: Vec<_> = log
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.snapshot.escalation_level)
        .collect();
    assert!(levels.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn completion_before_inline_threshold_stays_silent() {
    let reg = registry();
    let t0 = Instant::now();
    let h = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    reg.tick_at(t0 + ms(100));
    reg.complete_operation_at(h.id(), None, t0 + ms(150));
    reg.tick_at(t0 + ms(5000));

    let snap = h.snapshot().unwrap();
    assert_eq!(snap.status, OperationStatus::Completed);
    assert_eq!(snap.escalation_level, EscalationLevel::None);
}

#[test]
fn disabled_overlay_jumps_from_inline_to_modal() {
    let reg = registry();
    let t0 = Instant::now();
    let h = reg
        .start_operation_at(
            StartRequest::new().config(ConfigLayer::new().enable(EscalationLevel::Overlay, false)),
            t0,
        )
        .unwrap();
    let log = record(&reg, h.id());
    reg.tick_at(t0 + ms(1000));
    assert_eq!(h.snapshot().unwrap().escalation_level, EscalationLevel::Inline);
    reg.tick_at(t0 + ms(2000));
    assert_eq!(
        kinds(&log),
        vec![
            EventKind::Escalated(EscalationLevel::Inline),
            EventKind::Escalated(EscalationLevel::Modal),
        ]
    );
}

#[test]
fn nested_child_shares_parent_timers() {
    let reg = registry();
    let t0 = Instant::now();
    let parent = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let child = reg
        .start_operation_at(StartRequest::new().parent(parent.id()), t0 + ms(20))
        .unwrap();

    reg.tick_at(t0 + ms(200));
    assert_eq!(parent.snapshot().unwrap().escalation_level, EscalationLevel::Inline);
    assert_eq!(child.snapshot().unwrap().escalation_level, EscalationLevel::Inline);

    // Finishing the parent first must not strand the child's escalation.
    reg.complete_operation_at(parent.id(), None, t0 + ms(300));
    reg.tick_at(t0 + ms(600));
    assert_eq!(child.snapshot().unwrap().escalation_level, EscalationLevel::Overlay);
    assert_eq!(parent.snapshot().unwrap().escalation_level, EscalationLevel::Inline);
}

// ═════════════════════════════════════════════════════════════════════════
// Cancellation
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn cancelling_root_cancels_three_levels_synchronously() {
    let reg = registry();
    let a = reg.start_operation(StartRequest::new().id("A")).unwrap();
    let b = a.start_child(StartRequest::new().id("B")).unwrap();
    let c = b.start_child(StartRequest::new().id("C")).unwrap();

    assert!(reg.cancel_operation(a.id()));

    for handle in [&a, &b, &c] {
        let snap = handle.snapshot().unwrap();
        assert_eq!(snap.status, OperationStatus::Cancelled, "{}", snap.id);
        assert_eq!(snap.cancel_reason, Some(CancelReason::User));
        assert!(handle.token().is_cancelled());
        assert_eq!(reg.active_timer_count(handle.id()), 0);
    }
}

#[test]
fn cancelling_child_leaves_parent_running() {
    let reg = registry();
    let parent = reg.start_operation(StartRequest::new()).unwrap();
    let child = parent.start_child(StartRequest::new()).unwrap();
    let sibling = parent.start_child(StartRequest::new()).unwrap();

    child.cancel();
    assert_eq!(parent.snapshot().unwrap().status, OperationStatus::Running);
    assert_eq!(sibling.snapshot().unwrap().status, OperationStatus::Running);
    assert!(!parent.token().is_cancelled());
}

#[test]
fn timeout_propagates_reason_to_descendants() {
    let reg = registry();
    let t0 = Instant::now();
    let parent = reg
        .start_operation_at(
            StartRequest::new().config(ConfigLayer::new().timeout(TimeoutPolicy::AfterMs(500))),
            t0,
        )
        .unwrap();
    let child = reg
        .start_operation_at(StartRequest::new().parent(parent.id()), t0 + ms(10))
        .unwrap();

    reg.tick_at(t0 + ms(500));
    let child = child.snapshot().unwrap();
    assert_eq!(child.status, OperationStatus::Cancelled);
    assert_eq!(child.cancel_reason, Some(CancelReason::Timeout));
    assert!(child.is_retryable());
    assert_eq!(reg.stats().timed_out, 2);
}

#[test]
fn worker_observes_cancellation_through_token() {
    let reg = registry();
    let h = reg.start_operation(StartRequest::new()).unwrap();
    let token = h.token().clone();

    let worker = thread::spawn(move || token.wait_timeout(Duration::from_secs(5)));
    thread::sleep(ms(10));
    h.cancel();
    assert!(worker.join().unwrap());
}

// ═════════════════════════════════════════════════════════════════════════
// Progress
// ═════════════════════════════════════════════════════════════════════════

/// Drive `update_for(i)` at 100µs spacing from `t0` and return the instants
/// at which a notification reached the subscriber.
fn burst(
    reg: &OperationRegistry,
    id: &OperationId,
    log: &Log,
    t0: Instant,
    update_for: impl Fn(u64) -> ProgressUpdate,
) -> Vec<Instant> {
    let mut delivered_at = Vec::new();
    for i in 0..1000u64 {
        let now = t0 + Duration::from_micros(i * 100);
        let before = log.lock().unwrap().len();
        reg.update_progress_at(id, update_for(i), now);
        reg.tick_at(now);
        let after = log.lock().unwrap().len();
        delivered_at.extend(std::iter::repeat_n(now, after - before));
    }
    delivered_at
}

#[test]
fn thousand_updates_in_100ms_notify_at_most_six_times() {
    let reg = registry();
    let t0 = Instant::now();
    let h = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let log = record(&reg, h.id());

    let delivered_at = burst(&reg, h.id(), &log, t0, |i| {
        ProgressUpdate::determinate((i + 1) as f32 / 10.0)
    });
    // The leading notification at t0 counts toward the six.
    assert_eq!(delivered_at.first(), Some(&t0));
    let within_window = delivered_at.iter().filter(|at| **at < t0 + ms(100)).count();
    assert!(within_window <= 6, "{within_window} notifications within 100ms");

    // The last value rides the next window boundary, outside the burst.
    let deadline = reg.next_deadline().unwrap();
    assert!(deadline >= t0 + ms(100));
    reg.tick_at(deadline);
    let last = log.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.kind, EventKind::ProgressUpdated);
    assert_eq!(last.snapshot.progress.value(), Some(100.0));
}

#[test]
fn alternating_progress_kinds_stay_rate_bound() {
    let reg = registry();
    let t0 = Instant::now();
    let h = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let log = record(&reg, h.id());

    let delivered_at = burst(&reg, h.id(), &log, t0, |i| {
        if i % 2 == 0 {
            ProgressUpdate::indeterminate()
        } else {
            ProgressUpdate::determinate(i as f32 / 10.0)
        }
    });
    assert!(delivered_at.len() <= 6, "{} notifications", delivered_at.len());
    assert!(
        log.lock()
            .unwrap()
            .iter()
            .any(|e| e.snapshot.progress.kind() == ProgressKind::Determinate)
    );
}

#[test]
fn determinate_transition_is_never_coalesced_away() {
    let reg = registry();
    let t0 = Instant::now();
    let h = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let log = record(&reg, h.id());

    reg.update_progress_at(h.id(), ProgressUpdate::indeterminate().message("scanning"), t0);
    reg.update_progress_at(h.id(), ProgressUpdate::determinate(40.0), t0 + ms(1));
    reg.update_progress_at(h.id(), ProgressUpdate::indeterminate(), t0 + ms(2));
    while let Some(deadline) = reg.next_deadline() {
        if deadline > t0 + ms(150) {
            break;
        }
        reg.tick_at(deadline);
    }

    let seen: Vec<_> = log
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.snapshot.progress.kind(), e.snapshot.progress.value()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (ProgressKind::Indeterminate, None),
            (ProgressKind::Determinate, Some(40.0)),
            (ProgressKind::Indeterminate, None),
        ]
    );
    assert_eq!(h.snapshot().unwrap().progress.message(), Some("scanning"));
}

// ═════════════════════════════════════════════════════════════════════════
// Aggregation, isolation, round-trip
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn parent_collects_children_in_creation_order() {
    let reg = registry();
    let parent = reg.start_operation(StartRequest::new().id("batch")).unwrap();
    let children: Vec<_> = (0..3)
        .map(|i| parent.start_child(StartRequest::new().id(format!("part-{i}"))).unwrap())
        .collect();

    children[2].complete(Some(json!({"bytes": 30})));
    children[0].complete(Some(json!({"bytes": 10})));
    children[1].complete(Some(json!({"bytes": 20})));

    let composite = parent.snapshot().unwrap().composite.unwrap();
    let bytes: Vec<_> = composite
        .results()
        .map(|r| r.and_then(|v| v["bytes"].as_u64()))
        .collect();
    assert_eq!(bytes, vec![Some(10), Some(20), Some(30)]);
    assert!(composite.all_completed());
}

#[test]
fn unrelated_operations_are_isolated() {
    let reg = registry();
    let t0 = Instant::now();
    let a = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let b = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let a_log = record(&reg, a.id());
    let before = b.snapshot().unwrap();

    reg.update_progress_at(a.id(), ProgressUpdate::determinate(70.0), t0 + ms(1));
    reg.fail_operation_at(a.id(), pfe_runtime::OperationError::new("x"), t0 + ms(2));

    assert_eq!(b.snapshot().unwrap(), before);
    assert!(a_log.lock().unwrap().iter().all(|e| &e.id == a.id()));
}

#[test]
fn round_trip_leaves_no_armed_timers() {
    let reg = registry();
    let t0 = Instant::now();
    let parent = reg.start_operation_at(StartRequest::new(), t0).unwrap();
    let h = reg
        .start_operation_at(
            StartRequest::new()
                .parent(parent.id())
                .config(ConfigLayer::new().timeout(TimeoutPolicy::AfterMs(60_000))),
            t0,
        )
        .unwrap();
    assert!(reg.active_timer_count(h.id()) > 0);

    for i in 1..=5u64 {
        let update = ProgressUpdate::determinate(i as f32 * 20.0);
        reg.update_progress_at(h.id(), update, t0 + ms(i * 30));
    }
    assert!(reg.complete_operation_at(h.id(), Some(json!("ok")), t0 + ms(200)));

    let snap = h.snapshot().unwrap();
    assert_eq!(snap.status, OperationStatus::Completed);
    assert_eq!(snap.progress.value(), Some(100.0));
    assert_eq!(reg.active_timer_count(h.id()), 0);

    assert!(!reg.update_progress(h.id(), ProgressUpdate::determinate(1.0)));
    assert!(h.start_child(StartRequest::new()).is_err());
    assert!(h.snapshot().unwrap().child_ids.is_empty());
}

#[test]
fn source_bridge_drives_registry_from_worker_thread() {
    let reg = registry();
    let h = reg.start_operation(StartRequest::new()).unwrap();
    let bridge = SourceBridge::new();
    let tx = bridge.sender();
    let id = h.id().clone();
    let log = record(&reg, h.id());

    let worker = thread::spawn(move || {
        tx.progress(&id, 0, 0);
        tx.progress(&id, 5, 10);
        tx.complete(&id, None);
    });
    worker.join().unwrap();
    bridge.pump(&reg);

    let kinds = kinds(&log);
    assert_eq!(kinds.first(), Some(&EventKind::ProgressUpdated));
    assert_eq!(kinds.last(), Some(&EventKind::Completed));
    assert_eq!(h.snapshot().unwrap().progress.value(), Some(50.0));
}
