#![forbid(unsafe_code)]

//! Per-operation subscriber fan-out.
//!
//! The bus keeps an independent subscriber list per [`OperationId`] and
//! delivers each [`OperationEvent`] to every subscriber of its id,
//! synchronously, on the calling thread.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Subscriber panics | Logged at `warn`, counted, remaining subscribers still called |
//! | Unsubscribe during delivery | Takes effect from the next event |
//! | Subscribe to unknown id | Accepted; the list simply never fires |

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use pfe_core::guard::run_guarded;

use crate::operation::{OperationEvent, OperationId};

/// Subscriber callback.
pub type Subscriber = Arc<dyn Fn(&OperationEvent) + Send + Sync + 'static>;

type Lists = HashMap<OperationId, Vec<(u64, Subscriber)>>;

struct BusInner {
    lists: Mutex<Lists>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    panics: AtomicU64,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Synchronous per-id event fan-out.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("ids", &self.inner.lock().len())
            .field("delivered", &self.delivered())
            .finish()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                lists: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                panics: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback` for events of `id`.
    pub fn subscribe<F>(&self, id: &OperationId, callback: F) -> Subscription
    where
        F: Fn(&OperationEvent) + Send + Sync + 'static,
    {
        let key = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(id.clone())
            .or_default()
            .push((key, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id: id.clone(),
            key,
        }
    }

    /// Deliver `event` to every current subscriber of its id.
    ///
    /// Must be called without holding any registry lock. Returns the number
    /// of subscribers that ran to completion.
    pub fn deliver(&self, event: &OperationEvent) -> usize {
        let subscribers: Vec<Subscriber> = match self.inner.lock().get(&event.id) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };

        let mut ok = 0;
        for subscriber in subscribers {
            match run_guarded(|| subscriber(event)) {
                Ok(()) => ok += 1,
                Err(panic) => {
                    self.inner.panics.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        op_id = %event.id,
                        event = event.kind.as_str(),
                        error = %panic,
                        "subscriber panicked"
                    );
                }
            }
        }
        self.inner.delivered.fetch_add(ok as u64, Ordering::Relaxed);
        ok
    }

    /// Drop every subscriber of `id`.
    pub fn remove_all(&self, id: &OperationId) -> usize {
        self.inner.lock().remove(id).map_or(0, |list| list.len())
    }

    #[must_use]
    pub fn subscriber_count(&self, id: &OperationId) -> usize {
        self.inner.lock().get(id).map_or(0, Vec::len)
    }

    /// Total successful deliveries.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Total subscriber panics caught.
    #[must_use]
    pub fn panics(&self) -> u64 {
        self.inner.panics.load(Ordering::Relaxed)
    }
}

/// Handle returned by [`NotificationBus::subscribe`].
///
/// Dropping it keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop receiving events.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: OperationId,
    key: u64,
}

impl Subscription {
    /// Operation this subscription listens to.
    #[must_use]
    pub fn operation_id(&self) -> &OperationId {
        &self.id
    }

    /// De-register. Returns `true` if the subscriber was still registered.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut lists = inner.lock();
        let Some(list) = lists.get_mut(&self.id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(key, _)| *key != self.key);
        let removed = list.len() != before;
        if list.is_empty() {
            lists.remove(&self.id);
        }
        removed
    }
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}
