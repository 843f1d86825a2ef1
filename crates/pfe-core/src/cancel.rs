#![forbid(unsafe_code)]

//! Hierarchical cancellation tokens.
//!
//! A [`CancellationToken`] is a cheap, cloneable handle to shared
//! cancellation state. Work polls [`CancellationToken::is_cancelled`] or
//! blocks in [`CancellationToken::wait_timeout`]; owners react through
//! [`CancellationToken::on_cancel`] callbacks.
//!
//! Tokens form a tree through [`CancellationToken::create_child`].
//! Cancelling a token cancels its whole subtree depth-first with the same
//! [`CancelReason`]. Cancelling a child never affects its parent.
//!
//! # Invariants
//!
//! 1. The cancelled flag transitions `false -> true` exactly once.
//! 2. Every registered callback runs at most once, with the reason of the
//!    first cancellation.
//! 3. No lock is held while callbacks or child cancellations run, so a
//!    callback may freely call back into the token.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Callback panics | Logged at `warn`; remaining callbacks and children still run |
//! | Cancel after dispose | Still flips the flag; no callbacks remain to run |
//! | Child created from cancelled parent | Child starts cancelled |
//! | Poisoned lock | Inner state recovered; flags stay consistent |

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::guard::run_guarded;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum CancelReason {
    /// Explicit request from a user or caller.
    User,
    /// The operation's timeout elapsed.
    Timeout,
}

impl CancelReason {
    /// Get the stable string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Callback = Box<dyn FnOnce(CancelReason) + Send + 'static>;

struct TokenState {
    reason: Option<CancelReason>,
    callbacks: Vec<(u64, Callback)>,
    next_callback_id: u64,
    parent: Option<Weak<TokenInner>>,
    children: Vec<CancellationToken>,
    disposed: bool,
}

struct TokenInner {
    cancelled: AtomicBool,
    state: Mutex<TokenState>,
    signal: Condvar,
}

impl TokenInner {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared cancellation handle. Clones observe the same state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a fresh, uncancelled root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TokenState {
                    reason: None,
                    callbacks: Vec::new(),
                    next_callback_id: 0,
                    parent: None,
                    children: Vec::new(),
                    disposed: false,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// Check whether cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Reason of the first cancellation, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.lock().reason
    }

    /// Cancel with [`CancelReason::User`].
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::User)
    }

    /// Cancel this token and its subtree.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// token was already cancelled (in which case nothing runs again).
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        let (callbacks, children) = {
            let mut state = self.inner.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            self.inner.cancelled.store(true, Ordering::Release);
            (
                std::mem::take(&mut state.callbacks),
                state.children.clone(),
            )
        };
        self.inner.signal.notify_all();

        crate::trace!(
            reason = reason.as_str(),
            callbacks = callbacks.len(),
            children = children.len(),
            "token cancelled"
        );

        for (id, callback) in callbacks {
            if let Err(panic) = run_guarded(|| callback(reason)) {
                crate::warn!(callback_id = id, error = %panic, "cancellation callback panicked");
            }
        }

        for child in children {
            child.cancel_with(reason);
        }
        true
    }

    /// Register a callback that runs once on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately on
    /// the calling thread and the returned registration is inert.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        let reason = {
            let mut state = self.inner.lock();
            match state.reason {
                Some(reason) => reason,
                None if state.disposed => {
                    return CancelRegistration::inert();
                }
                None => {
                    let id = state.next_callback_id;
                    state.next_callback_id += 1;
                    state.callbacks.push((id, Box::new(callback)));
                    return CancelRegistration {
                        token: Arc::downgrade(&self.inner),
                        id: Some(id),
                    };
                }
            }
        };

        if let Err(panic) = run_guarded(|| callback(reason)) {
            crate::warn!(error = %panic, "cancellation callback panicked");
        }
        CancelRegistration::inert()
    }

    /// Create a child token linked to this one.
    ///
    /// The child is cancelled whenever this token is. A child created from
    /// an already-cancelled token starts cancelled with the same reason.
    #[must_use]
    pub fn create_child(&self) -> CancellationToken {
        let child = CancellationToken::new();
        child.inner.lock().parent = Some(Arc::downgrade(&self.inner));

        let inherited = {
            let mut state = self.inner.lock();
            match state.reason {
                Some(reason) => Some(reason),
                None => {
                    if !state.disposed {
                        state.children.push(child.clone());
                    }
                    None
                }
            }
        };

        if let Some(reason) = inherited {
            child.cancel_with(reason);
        }
        child
    }

    /// Number of live children linked to this token.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Unlink every child so that cancelling this token no longer reaches
    /// them. The children stay cancellable on their own.
    ///
    /// Returns the number of children detached.
    pub fn detach_children(&self) -> usize {
        let children = std::mem::take(&mut self.inner.lock().children);
        for child in &children {
            child.inner.lock().parent = None;
        }
        crate::trace!(children = children.len(), "token children detached");
        children.len()
    }

    /// Detach this token: drop all callbacks, forget all children, and
    /// unlink from the parent. Does not cancel anything.
    pub fn dispose(&self) {
        let parent = {
            let mut state = self.inner.lock();
            state.disposed = true;
            state.callbacks.clear();
            state.children.clear();
            state.parent.take()
        };

        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            let mut state = parent.lock();
            state
                .children
                .retain(|child| !Arc::ptr_eq(&child.inner, &self.inner));
        }
    }

    /// Check whether [`Self::dispose`] was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Block until cancelled or until `timeout` elapses.
    ///
    /// Returns `true` if the token is cancelled on return.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while state.reason.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        true
    }

    /// Check whether two handles share the same state.
    #[must_use]
    pub fn same_token(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Handle returned by [`CancellationToken::on_cancel`].
///
/// Dropping it leaves the callback registered; call
/// [`CancelRegistration::unregister`] to remove it.
#[derive(Debug)]
pub struct CancelRegistration {
    token: Weak<TokenInner>,
    id: Option<u64>,
}

impl CancelRegistration {
    fn inert() -> Self {
        Self {
            token: Weak::new(),
            id: None,
        }
    }

    /// Check whether the callback is still waiting to run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let (Some(id), Some(inner)) = (self.id, self.token.upgrade()) else {
            return false;
        };
        inner.lock().callbacks.iter().any(|(cb_id, _)| *cb_id == id)
    }

    /// Remove the callback if it has not run yet.
    ///
    /// Returns `true` if a pending callback was removed.
    pub fn unregister(self) -> bool {
        let (Some(id), Some(inner)) = (self.id, self.token.upgrade()) else {
            return false;
        };
        let mut state = inner.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id);
        state.callbacks.len() != before
    }
}

impl fmt::Debug for TokenInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInner")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
