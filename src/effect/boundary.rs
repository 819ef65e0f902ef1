//! The async boundary: re-entry adapter between the run-loop and the
//! asynchronous world.
//!
//! When the run-loop reaches a suspending instruction it parks the run here:
//! the continuation stack, token, and ambient context are saved, control
//! returns to the caller, and the boundary waits to be resumed - by a user
//! callback (`Async`), a completed future (`Single`), a scheduled hop
//! (`AsyncContinueOn` / `AsyncContextSwitch`), or a cancellation finalizer.
//! On resumption it restores the saved state and re-enters the loop.
//!
//! One boundary is allocated lazily per top-level run and reused across all
//! of that run's suspensions. Two guards keep resumption single-shot:
//!
//! - `can_call`, an atomic flag claimed by compare-and-swap: exactly one
//!   resumption per suspension re-enters the loop.
//! - a start *epoch*: every suspension bumps it, and a resume handle minted
//!   for an earlier suspension no longer matches, so a callback invoked
//!   twice cannot steal a later suspension's slot.
//!
//! The boundary also counts re-entries; at
//! [`MAX_STACK_DEPTH`](super::platform::MAX_STACK_DEPTH) the next re-entry
//! is bounced through the platform trampoline so tight synchronous callback
//! chains cannot grow the host stack without bound.

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;

use super::context::Context;
use super::failure::Failure;
use super::platform;
use super::program::{
    AnyValue, Effect, ModifyContextFn, Node, RegisterFn, RestoreContextFn, SuspendFn, erase_value,
};
use super::run_loop::{Callback, run_loop};
use super::stack::{CallStack, Frame};
use super::token::Token;

/// State saved while a run is parked, guarded by a mutex taken only at
/// suspension edges.
struct BoundaryState {
    epoch: u64,
    token: Token,
    context: Context,
    stack: CallStack,
    pending: Option<Node>,
    finalizer_pushed: bool,
}

/// The per-run re-entry adapter.
pub(crate) struct AsyncBoundary {
    callback: Arc<Callback>,
    can_call: AtomicBool,
    reentries: AtomicU32,
    state: Mutex<BoundaryState>,
}

impl AsyncBoundary {
    pub(crate) fn new(callback: Arc<Callback>) -> Arc<Self> {
        Arc::new(Self {
            callback,
            can_call: AtomicBool::new(false),
            reentries: AtomicU32::new(0),
            state: Mutex::new(BoundaryState {
                epoch: 0,
                token: Token::non_cancelable(),
                context: Context::new(),
                stack: CallStack::new(),
                pending: None,
                finalizer_pushed: false,
            }),
        })
    }

    /// Opens a new suspension: saves the run state, arms `can_call`, bumps
    /// the epoch and the re-entry counter. Returns the new epoch.
    fn begin(
        &self,
        token: Token,
        context: Context,
        stack: CallStack,
        pending: Option<Node>,
        finalizer_pushed: bool,
    ) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.epoch = state.epoch.wrapping_add(1);
        state.token = token;
        state.context = context;
        state.stack = stack;
        state.pending = pending;
        state.finalizer_pushed = finalizer_pushed;
        self.reentries.fetch_add(1, Ordering::Relaxed);
        self.can_call.store(true, Ordering::Release);
        state.epoch
    }

    /// Parks the run on a user registration.
    ///
    /// A finalizer is pushed into a cancelable token first, so a cancel
    /// arriving mid-wait resumes the boundary with the cancellation
    /// sentinel. The registration body runs under `catch_unwind`; a panic in
    /// it is delivered as an in-band failure.
    pub(crate) fn start_async(
        self: &Arc<Self>,
        register: RegisterFn,
        token: Token,
        context: Context,
        stack: CallStack,
    ) {
        let cancelable = token.is_cancelable();
        let epoch = self.begin(token.clone(), context, stack, None, cancelable);
        let handle = ResumeHandle {
            boundary: Arc::clone(self),
            epoch,
        };

        if cancelable {
            let waker = handle.clone();
            token.push(Effect::new(move || {
                waker.resume(Err(Failure::canceled()));
            }));
        }
        // A cancel may have fired the finalizer during the push; the slot is
        // then spent and the registration must not run.
        if !self.can_call.load(Ordering::Acquire) {
            return;
        }

        let registration = handle.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || register(token, registration)))
        {
            handle.resume(Err(Failure::from_panic(payload)));
        }
    }

    /// Parks the run on a one-shot suspension, driving its future on the
    /// ambient tokio runtime.
    pub(crate) fn start_single(
        self: &Arc<Self>,
        suspend: SuspendFn,
        token: Token,
        context: Context,
        stack: CallStack,
    ) {
        let epoch = self.begin(token, context.clone(), stack, None, false);
        let handle = ResumeHandle {
            boundary: Arc::clone(self),
            epoch,
        };

        let future = match catch_unwind(AssertUnwindSafe(move || suspend(context))) {
            Ok(future) => future,
            Err(payload) => {
                handle.resume(Err(Failure::from_panic(payload)));
                return;
            }
        };

        let resumer = handle.clone();
        let task = async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => {
                    resumer.resume(result);
                }
                Err(payload) => {
                    resumer.resume(Err(Failure::from_panic(payload)));
                }
            }
        };
        if catch_unwind(AssertUnwindSafe(move || {
            tokio::spawn(task);
        }))
        .is_err()
        {
            handle.resume(Err(Failure::message(
                "no tokio runtime available to drive the suspension",
            )));
        }
    }

    /// Parks the run and resumes it with `context` installed as the ambient
    /// context.
    pub(crate) fn start_continue_on(
        self: &Arc<Self>,
        source: Node,
        context: Context,
        token: Token,
        stack: CallStack,
    ) {
        self.begin(token, context, stack, Some(source), false);
        self.hop();
    }

    /// Parks the run and resumes it under `modify(current)`; when `restore`
    /// is present, a restoration frame re-establishes the previous context
    /// after `source` finishes, on both exit paths.
    pub(crate) fn start_context_switch(
        self: &Arc<Self>,
        source: Node,
        modify: ModifyContextFn,
        restore: Option<RestoreContextFn>,
        token: Token,
        context: Context,
        mut stack: CallStack,
    ) {
        let previous = context.clone();
        match catch_unwind(AssertUnwindSafe(move || modify(context))) {
            Ok(switched) => {
                if let Some(restore) = restore {
                    stack.push(Frame::restore_context(previous, restore));
                }
                self.begin(token, switched, stack, Some(source), false);
            }
            Err(payload) => {
                // The switch never happened; resume under the old context
                // with the failure in the error channel.
                self.begin(
                    token,
                    previous,
                    stack,
                    Some(Node::RaiseError(Failure::from_panic(payload))),
                    false,
                );
            }
        }
        self.hop();
    }

    /// Accepts a resumption for the suspension identified by `epoch`.
    ///
    /// Returns whether this invocation took effect; stale or duplicate
    /// invocations return `false` and have no effect.
    fn resume(self: &Arc<Self>, epoch: u64, result: Result<AnyValue, Failure>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.epoch != epoch {
                return false;
            }
            if !self.can_call.load(Ordering::Acquire) {
                return false;
            }
            if state.pending.is_none() {
                state.pending = Some(match result {
                    Ok(value) => Node::Pure(value),
                    Err(failure) => Node::RaiseError(failure),
                });
            }
        }
        self.fire();
        true
    }

    /// Schedules the pending re-entry: through the trampoline once the
    /// re-entry budget is spent, directly otherwise.
    fn fire(self: &Arc<Self>) {
        if self.reentries.load(Ordering::Relaxed) >= platform::MAX_STACK_DEPTH {
            self.reentries.store(0, Ordering::Relaxed);
            let boundary = Arc::clone(self);
            platform::trampoline(move || boundary.reenter());
        } else {
            self.reenter();
        }
    }

    /// Always-scheduled variant of [`fire`](Self::fire), used by context
    /// switches to yield before continuing under the new context.
    fn hop(self: &Arc<Self>) {
        let boundary = Arc::clone(self);
        platform::trampoline(move || boundary.reenter());
    }

    /// The actual loop re-entry: claims the single-shot guard, retracts the
    /// cancellation finalizer, moves the saved state into locals, and calls
    /// back into the run-loop.
    fn reenter(self: &Arc<Self>) {
        if self
            .can_call
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let (pending, token, context, stack) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.finalizer_pushed {
                state.token.pop();
                state.finalizer_pushed = false;
            }
            (
                state.pending.take(),
                state.token.clone(),
                state.context.clone(),
                std::mem::take(&mut state.stack),
            )
        };
        let Some(node) = pending else {
            return;
        };
        run_loop(
            node,
            token,
            context,
            Arc::clone(&self.callback),
            Some(Arc::clone(self)),
            stack,
        );
    }
}

/// An internal, clonable handle resuming one specific suspension.
#[derive(Clone)]
pub(crate) struct ResumeHandle {
    boundary: Arc<AsyncBoundary>,
    epoch: u64,
}

impl ResumeHandle {
    /// Delivers the suspension's outcome. Returns whether it took effect.
    pub(crate) fn resume(&self, result: Result<AnyValue, Failure>) -> bool {
        self.boundary.resume(self.epoch, result)
    }

    /// The ambient context saved at the suspension point.
    pub(crate) fn context(&self) -> Context {
        self.boundary
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .context
            .clone()
    }
}

/// The one-shot callback handed to an
/// [`Effect::from_async`](super::Effect::from_async) registration.
///
/// May be cloned and sent to another thread; whichever invocation arrives
/// first wins, every later one is dropped. This is the single-shot guarantee
/// of the async boundary, surfaced as a typed API.
///
/// # Examples
///
/// ```rust
/// use eddy::effect::{Context, Effect};
///
/// let effect = Effect::from_async(|_token, callback| {
///     assert!(callback.resume(Ok(1)));
///     // The second invocation is dropped.
///     assert!(!callback.resume(Ok(2)));
/// });
/// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 1);
/// ```
pub struct AsyncCallback<A> {
    handle: ResumeHandle,
    marker: PhantomData<fn(A)>,
}

impl<A> Clone for AsyncCallback<A> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            marker: PhantomData,
        }
    }
}

impl<A: Send + 'static> AsyncCallback<A> {
    pub(crate) fn new(handle: ResumeHandle) -> Self {
        Self {
            handle,
            marker: PhantomData,
        }
    }

    /// Delivers the computation's outcome.
    ///
    /// Returns `true` when this invocation resumed the run, `false` when a
    /// previous invocation (or a cancellation) already did.
    pub fn resume(&self, result: Result<A, Failure>) -> bool {
        self.handle.resume(result.map(erase_value))
    }

    /// Shorthand for `resume(Ok(value))`.
    pub fn succeed(&self, value: A) -> bool {
        self.resume(Ok(value))
    }

    /// Shorthand for `resume(Err(failure))`.
    pub fn fail(&self, failure: Failure) -> bool {
        self.resume(Err(failure))
    }
}
