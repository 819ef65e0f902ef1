//! The trampolined run-loop and the public entry points.
//!
//! The loop interprets one instruction per iteration, consuming the current
//! [`Node`] by value and holding pending continuations on an explicit
//! [`CallStack`] - host-stack depth stays constant no matter how deep the
//! bind chain. Each iteration:
//!
//! 1. checks the cancellation token (cancellation always wins, and is
//!    delivered straight to the final callback, never to recovery frames);
//! 2. dispatches on the instruction tag, pushing continuations on
//!    sequencing instructions and popping them when a value or failure
//!    arrives;
//! 3. on a suspending instruction, parks the run in the
//!    [`AsyncBoundary`](super::boundary::AsyncBoundary) and returns.
//!
//! Every invocation of user code goes through [`execute_safe`], which
//! converts unwinding panics into in-band failures. Aborting errors are
//! never caught.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::control::Either;

use super::boundary::AsyncBoundary;
use super::context::Context;
use super::failure::Failure;
use super::program::{AnyValue, Effect, Node, downcast_value};
use super::stack::{CallStack, Frame};
use super::token::Token;

// =============================================================================
// Final callback cell
// =============================================================================

/// The exactly-once latch around a run's final callback.
pub(crate) struct Callback {
    completed: AtomicBool,
    delivery: Mutex<Option<Box<dyn FnOnce(Result<AnyValue, Failure>) + Send>>>,
}

impl Callback {
    pub(crate) fn from_fn<F>(deliver: F) -> Arc<Self>
    where
        F: FnOnce(Result<AnyValue, Failure>) + Send + 'static,
    {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            delivery: Mutex::new(Some(Box::new(deliver))),
        })
    }

    /// Delivers the run's outcome. Only the first call takes effect.
    pub(crate) fn complete(&self, result: Result<AnyValue, Failure>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let deliver = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match deliver {
            Some(deliver) => {
                deliver(result);
                true
            }
            None => false,
        }
    }
}

/// Runs a user-code invocation, converting an unwinding panic into an
/// in-band failure. This is the sole mechanism by which synchronous panics
/// become `RaiseError`.
pub(crate) fn execute_safe<F>(action: F) -> Node
where
    F: FnOnce() -> Node,
{
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(node) => node,
        Err(payload) => Node::RaiseError(Failure::from_panic(payload)),
    }
}

// =============================================================================
// The loop
// =============================================================================

/// Interprets `node` until the run completes or parks on a suspension.
///
/// `boundary` is `Some` on re-entry from a suspension, so one boundary is
/// reused for all suspensions of a run; on the first suspension of a run it
/// is allocated here.
pub(crate) fn run_loop(
    node: Node,
    mut token: Token,
    context: Context,
    callback: Arc<Callback>,
    mut boundary: Option<Arc<AsyncBoundary>>,
    mut stack: CallStack,
) {
    let mut current = node;

    loop {
        if token.is_canceled() {
            callback.complete(Err(Failure::canceled()));
            return;
        }

        current = match current {
            Node::Pure(value) => match stack.pop_for_value() {
                Some(frame) => execute_safe(|| frame.apply(value)),
                None => {
                    callback.complete(Ok(value));
                    return;
                }
            },
            Node::RaiseError(failure) => match stack.pop_for_error() {
                Some(frame) => execute_safe(|| frame.recover(failure)),
                None => {
                    callback.complete(Err(failure));
                    return;
                }
            },
            Node::Lazy(thunk) => execute_safe(|| Node::Pure(thunk())),
            Node::Defer(thunk) => execute_safe(thunk),
            Node::Map { source, map } => {
                stack.push(Frame::Map(map));
                *source
            }
            Node::FlatMap { source, frame } => {
                stack.push(frame);
                *source
            }
            Node::ContinueOn { source, context } => Node::rewrite_continue_on(source, context),
            Node::UpdateContext { source, modify } => {
                Node::rewrite_update_context(source, modify)
            }
            Node::ConnectionSwitch {
                source,
                modify,
                restore,
            } => {
                let previous = token.clone();
                let handoff = previous.clone();
                match catch_unwind(AssertUnwindSafe(move || modify(handoff))) {
                    Ok(switched) => {
                        token = switched;
                        if let Some(restore) = restore {
                            stack.push(Frame::restore_connection(previous, restore));
                        }
                        *source
                    }
                    Err(payload) => Node::RaiseError(Failure::from_panic(payload)),
                }
            }
            Node::Async(register) => {
                let parked = ensure_boundary(&mut boundary, &callback);
                parked.start_async(register, token, context, stack);
                return;
            }
            Node::Single(suspend) => {
                let parked = ensure_boundary(&mut boundary, &callback);
                parked.start_single(suspend, token, context, stack);
                return;
            }
            Node::AsyncContinueOn {
                source,
                context: target,
            } => {
                let parked = ensure_boundary(&mut boundary, &callback);
                parked.start_continue_on(*source, target, token, stack);
                return;
            }
            Node::AsyncContextSwitch {
                source,
                modify,
                restore,
            } => {
                let parked = ensure_boundary(&mut boundary, &callback);
                parked.start_context_switch(*source, modify, restore, token, context, stack);
                return;
            }
        };
    }
}

/// The boundary for this run, allocated on first suspension.
fn ensure_boundary(
    boundary: &mut Option<Arc<AsyncBoundary>>,
    callback: &Arc<Callback>,
) -> Arc<AsyncBoundary> {
    match boundary.take() {
        Some(existing) => existing,
        None => AsyncBoundary::new(Arc::clone(callback)),
    }
}

/// Runs a cancellation finalizer: non-cancelable token, empty context,
/// result discarded.
pub(crate) fn run_finalizer(finalizer: Effect<()>) {
    run_loop(
        finalizer.into_node(),
        Token::non_cancelable(),
        Context::new(),
        Callback::from_fn(|_result| {}),
        None,
        CallStack::new(),
    );
}

// =============================================================================
// Entry points
// =============================================================================

impl<A: Send + 'static> Effect<A> {
    /// Starts the run with a non-cancelable token.
    ///
    /// The callback is invoked exactly once, with the run's value or
    /// [`Failure`]. For effects with no asynchronous instructions it is
    /// invoked before `start` returns.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    /// use std::sync::mpsc;
    ///
    /// let (sender, receiver) = mpsc::channel();
    /// Effect::pure(42).start(Context::new(), move |result| {
    ///     sender.send(result).unwrap();
    /// });
    /// assert_eq!(receiver.recv().unwrap().unwrap(), 42);
    /// ```
    pub fn start<F>(self, context: Context, callback: F)
    where
        F: FnOnce(Result<A, Failure>) + Send + 'static,
    {
        self.start_cancelable(Token::non_cancelable(), context, callback);
    }

    /// Starts the run with a caller-provided cancellation token.
    ///
    /// If the token is canceled, the callback receives
    /// [`Failure::canceled`] - exactly once, like every other outcome.
    pub fn start_cancelable<F>(self, token: Token, context: Context, callback: F)
    where
        F: FnOnce(Result<A, Failure>) + Send + 'static,
    {
        let delivery =
            Callback::from_fn(move |result| callback(result.and_then(downcast_value::<A>)));
        run_loop(self.node, token, context, delivery, None, CallStack::new());
    }

    /// Runs the effect and blocks the calling thread until it delivers.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// let effect = Effect::pure(2).fmap(|value| value + 40);
    /// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
    /// ```
    pub fn run_blocking(self, context: Context) -> Result<A, Failure> {
        let (sender, receiver) = std::sync::mpsc::channel();
        self.start(context, move |result| {
            let _ = sender.send(result);
        });
        receiver
            .recv()
            .unwrap_or_else(|_| Err(Failure::message("run ended without delivering a result")))
    }

    /// Evaluates the synchronous prefix of this effect.
    ///
    /// Returns `Right(value)` when the prefix runs to completion with a
    /// value, and `Left(tail)` otherwise - the tail being either the first
    /// suspending instruction (re-wrapped with the saved continuation stack
    /// when one exists) or a terminal failure. Running the tail produces the
    /// same outcome a direct run would have.
    ///
    /// The one-shot evaluator is non-cancelable; token-switching
    /// instructions are treated as suspension points.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::control::Either;
    /// use eddy::effect::Effect;
    ///
    /// let pure = Effect::pure(1).fmap(|value| value + 1);
    /// assert!(matches!(pure.step(), Either::Right(2)));
    ///
    /// let suspended = Effect::from_async(|_token, callback| {
    ///     callback.resume(Ok(3));
    /// })
    /// .fmap(|value: i32| value * 10);
    /// match suspended.step() {
    ///     Either::Left(tail) => {
    ///         assert_eq!(tail.run_blocking(eddy::effect::Context::new()).unwrap(), 30);
    ///     }
    ///     Either::Right(_) => unreachable!("async prefix cannot finish synchronously"),
    /// }
    /// ```
    pub fn step(self) -> Either<Self, A> {
        let mut current = self.node;
        let mut stack = CallStack::new();

        loop {
            current = match current {
                Node::Pure(value) => match stack.pop_for_value() {
                    Some(frame) => execute_safe(|| frame.apply(value)),
                    None => {
                        return match downcast_value::<A>(value) {
                            Ok(value) => Either::Right(value),
                            Err(failure) => {
                                Either::Left(Self::from_node(Node::RaiseError(failure)))
                            }
                        };
                    }
                },
                Node::RaiseError(failure) => match stack.pop_for_error() {
                    Some(frame) => execute_safe(|| frame.recover(failure)),
                    None => return Either::Left(Self::from_node(Node::RaiseError(failure))),
                },
                Node::Lazy(thunk) => execute_safe(|| Node::Pure(thunk())),
                Node::Defer(thunk) => execute_safe(thunk),
                Node::Map { source, map } => {
                    stack.push(Frame::Map(map));
                    *source
                }
                Node::FlatMap { source, frame } => {
                    stack.push(frame);
                    *source
                }
                Node::ContinueOn { source, context } => {
                    Node::rewrite_continue_on(source, context)
                }
                Node::UpdateContext { source, modify } => {
                    Node::rewrite_update_context(source, modify)
                }
                suspended @ (Node::Single(_)
                | Node::Async(_)
                | Node::AsyncContinueOn { .. }
                | Node::AsyncContextSwitch { .. }
                | Node::ConnectionSwitch { .. }) => {
                    return Either::Left(rebuild_tail(suspended, stack));
                }
            };
        }
    }
}

/// Re-wraps a suspended instruction and its saved continuation stack as a
/// single `Async` that re-enters the loop when started.
fn rebuild_tail<A: Send + 'static>(node: Node, stack: CallStack) -> Effect<A> {
    if stack.is_empty() {
        return Effect::from_node(node);
    }
    Effect::from_node(Node::Async(Box::new(move |token, handle| {
        let context = handle.context();
        let forward = handle.clone();
        let delivery = Callback::from_fn(move |result| {
            forward.resume(result);
        });
        run_loop(node, token, context, delivery, None, stack);
    })))
}

/// Runs an effect from a suspended caller, returning its outcome directly.
///
/// The bridge is a oneshot channel: the run is started with a callback that
/// completes the channel, and the caller awaits it. Must be called on a
/// tokio runtime.
///
/// # Examples
///
/// ```rust,ignore
/// use eddy::effect::{Effect, suspend_run};
///
/// #[tokio::main]
/// async fn main() {
///     let value = suspend_run(Effect::pure(42)).await.unwrap();
///     assert_eq!(value, 42);
/// }
/// ```
pub async fn suspend_run<A: Send + 'static>(effect: Effect<A>) -> Result<A, Failure> {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    effect.start(Context::new(), move |result| {
        let _ = sender.send(result);
    });
    receiver
        .await
        .unwrap_or_else(|_| Err(Failure::message("run ended without delivering a result")))
}
