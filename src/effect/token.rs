//! Cooperative cancellation tokens.
//!
//! A [`Token`] is the shared cancellation handle of a run. The interpreter
//! checks it at the top of every loop iteration; cancellation is therefore
//! cooperative and takes effect at the next instruction boundary or, for a
//! run parked on an asynchronous instruction, through a finalizer pushed by
//! the async boundary that wakes the waiter.
//!
//! Tokens are monotonic: once [`Token::cancel`] has run, [`Token::is_canceled`]
//! stays `true` forever. Canceling drains the finalizer stack in LIFO order;
//! each finalizer is an [`Effect<()>`](super::Effect) executed on a
//! non-cancelable token with its result discarded.
//!
//! A distinguished *non-cancelable* token exists for runs that must not be
//! interrupted: it never reports cancellation and ignores finalizers.
//!
//! # Examples
//!
//! ```rust
//! use eddy::effect::Token;
//!
//! let token = Token::cancelable();
//! assert!(!token.is_canceled());
//!
//! token.cancel();
//! assert!(token.is_canceled());
//!
//! // Idempotent: a second cancel changes nothing.
//! token.cancel();
//! assert!(token.is_canceled());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::Effect;
use super::run_loop::run_finalizer;

/// Shared state of a cancelable token.
struct TokenState {
    canceled: AtomicBool,
    finalizers: Mutex<Vec<Effect<()>>>,
}

/// A shared, monotonically cancelable flag with a finalizer stack.
///
/// Cloning a `Token` yields another handle onto the same underlying state;
/// canceling any clone cancels them all. The non-cancelable token carries no
/// state at all, so every clone of it is equally inert.
#[derive(Clone)]
pub struct Token {
    state: Option<Arc<TokenState>>,
}

impl Token {
    /// Creates a fresh cancelable token.
    #[must_use]
    pub fn cancelable() -> Self {
        Self {
            state: Some(Arc::new(TokenState {
                canceled: AtomicBool::new(false),
                finalizers: Mutex::new(Vec::new()),
            })),
        }
    }

    /// The distinguished non-cancelable token.
    ///
    /// `is_canceled` is always `false`; `push` and `pop` are no-ops.
    #[must_use]
    pub fn non_cancelable() -> Self {
        Self { state: None }
    }

    /// Whether this token can ever report cancellation.
    #[must_use]
    pub fn is_cancelable(&self) -> bool {
        self.state.is_some()
    }

    /// Whether cancellation has been requested.
    ///
    /// Monotonic: once `true`, stays `true`.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.canceled.load(Ordering::Acquire))
    }

    /// Requests cancellation and drains the finalizer stack.
    ///
    /// Finalizers run in LIFO order, each on a non-cancelable token with its
    /// result discarded. Idempotent: only the first call drains; later calls
    /// return immediately.
    pub fn cancel(&self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        if state.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let finalizer = state
                .finalizers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();
            match finalizer {
                Some(finalizer) => run_finalizer(finalizer),
                None => break,
            }
        }
    }

    /// Pushes a finalizer to run on cancellation.
    ///
    /// Finalizers are popped in LIFO order. Pushing onto an already-canceled
    /// token runs the finalizer immediately, so a waiter registered after a
    /// racing cancel is still woken. On the non-cancelable token this is a
    /// no-op and the finalizer is dropped.
    pub fn push(&self, finalizer: Effect<()>) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        if state.canceled.load(Ordering::Acquire) {
            run_finalizer(finalizer);
            return;
        }
        state
            .finalizers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(finalizer);
        // A cancel may have started draining between the check and the push;
        // sweep anything it left behind.
        if state.canceled.load(Ordering::Acquire) {
            loop {
                let leftover = state
                    .finalizers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop();
                match leftover {
                    Some(leftover) => run_finalizer(leftover),
                    None => break,
                }
            }
        }
    }

    /// Removes and returns the most recently pushed finalizer.
    ///
    /// Used to retract a scoped finalizer once its scope completed normally.
    /// Returns `None` on the non-cancelable token or when the stack is empty.
    pub fn pop(&self) -> Option<Effect<()>> {
        self.state.as_ref().and_then(|state| {
            state
                .finalizers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop()
        })
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.as_ref() {
            None => formatter.write_str("Token::NonCancelable"),
            Some(state) => formatter
                .debug_struct("Token")
                .field("canceled", &state.canceled.load(Ordering::Acquire))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_is_monotonic() {
        let token = Token::cancelable();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn test_clones_share_state() {
        let token = Token::cancelable();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn test_non_cancelable_ignores_everything() {
        let token = Token::non_cancelable();
        token.push(Effect::pure(()));
        token.cancel();
        assert!(!token.is_canceled());
        assert!(token.pop().is_none());
    }

    #[test]
    fn test_finalizers_drain_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let token = Token::cancelable();
        for index in 0..3u32 {
            let order = Arc::clone(&order);
            token.push(Effect::new(move || {
                order.lock().unwrap().push(index);
            }));
        }

        token.cancel();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_pop_retracts_most_recent_finalizer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let token = Token::cancelable();
        let tracked = Arc::clone(&counter);
        token.push(Effect::new(move || {
            tracked.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(token.pop().is_some());
        token.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_push_after_cancel_runs_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let token = Token::cancelable();
        token.cancel();

        let observed = Arc::clone(&ran);
        token.push(Effect::new(move || {
            observed.store(true, Ordering::SeqCst);
        }));
        assert!(ran.load(Ordering::SeqCst));
    }
}
