//! The effect instruction set.
//!
//! An [`Effect<A>`] is a *description* of a computation that eventually
//! produces an `A` or a [`Failure`]. Nothing runs until one of the entry
//! points is invoked (`start`, `start_cancelable`, `run_blocking`,
//! [`suspend_run`](super::suspend_run), `step`); until then an effect is an
//! inert instruction tree that can be composed, stored, and passed around.
//!
//! Internally the tree is type-erased: values cross the interpreter as
//! `Box<dyn Any + Send>` and continuations as boxed closures over erased
//! values, so a single interpreter loop can walk chains whose intermediate
//! types all differ. The typed `Effect<A>` façade boxes values on the way in
//! and downcasts on the way out; a mismatch (impossible through the public
//! constructors) surfaces as an in-band failure rather than a crash.
//!
//! # Examples
//!
//! ```rust
//! use eddy::effect::{Context, Effect};
//!
//! let effect = Effect::pure(20)
//!     .fmap(|value| value * 2)
//!     .flat_map(|value| Effect::pure(value + 2));
//!
//! assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::boundary::{AsyncCallback, ResumeHandle};
use super::context::Context;
use super::failure::Failure;
use super::stack::Frame;
use super::token::Token;

// =============================================================================
// Erased payload types
// =============================================================================

/// A value crossing the interpreter, type-erased.
pub(crate) type AnyValue = Box<dyn Any + Send>;
/// Thunk of a `Lazy` instruction.
pub(crate) type LazyThunk = Box<dyn FnOnce() -> AnyValue + Send>;
/// Thunk of a `Defer` instruction.
pub(crate) type DeferThunk = Box<dyn FnOnce() -> Node + Send>;
/// Pure continuation of a `Map` instruction or frame.
pub(crate) type MapFn = Box<dyn FnOnce(AnyValue) -> Result<AnyValue, Failure> + Send>;
/// Monadic continuation of a `FlatMap` frame.
pub(crate) type BindFn = Box<dyn FnOnce(AnyValue) -> Node + Send>;
/// Error-recovery continuation.
pub(crate) type RecoverFn = Box<dyn FnOnce(Failure) -> Node + Send>;
/// User registration body of an `Async` instruction.
pub(crate) type RegisterFn = Box<dyn FnOnce(Token, ResumeHandle) + Send>;
/// Context-aware future factory of a `Single` instruction.
pub(crate) type SuspendFn =
    Box<dyn FnOnce(Context) -> BoxFuture<'static, Result<AnyValue, Failure>> + Send>;
/// Ambient-context rewrite.
pub(crate) type ModifyContextFn = Box<dyn FnOnce(Context) -> Context + Send>;
/// Ambient-context restoration: `(previous, current) -> restored`.
pub(crate) type RestoreContextFn = Arc<dyn Fn(Context, Context) -> Context + Send + Sync>;
/// Cancellation-token rewrite.
pub(crate) type ModifyTokenFn = Box<dyn FnOnce(Token) -> Token + Send>;
/// Cancellation-token restoration: `(previous, current) -> restored`.
pub(crate) type RestoreTokenFn = Arc<dyn Fn(Token, Token) -> Token + Send + Sync>;

/// Recovers a typed value from the erased representation.
pub(crate) fn downcast_value<A: Any>(value: AnyValue) -> Result<A, Failure> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| Failure::message("type mismatch in continuation application"))
}

/// Boxes a typed value into the erased representation.
pub(crate) fn erase_value<A: Send + 'static>(value: A) -> AnyValue {
    Box::new(value)
}

// =============================================================================
// Instruction tree
// =============================================================================

/// The closed instruction sum walked by the run-loop.
///
/// Dispatch is a single `match`; the enum being closed is what lets the loop
/// rely on exhaustiveness instead of virtual dispatch.
pub(crate) enum Node {
    /// An already-evaluated value.
    Pure(AnyValue),
    /// A failure to propagate.
    RaiseError(Failure),
    /// A synchronous thunk; panics become `RaiseError`.
    Lazy(LazyThunk),
    /// A thunk producing the next instruction.
    Defer(DeferThunk),
    /// Apply a pure function to the result of `source`.
    Map {
        source: Box<Node>,
        map: MapFn,
    },
    /// Sequence `source` into the continuation carried by `frame`.
    FlatMap {
        source: Box<Node>,
        frame: Frame,
    },
    /// A one-shot suspension driven by the host's native async primitive.
    Single(SuspendFn),
    /// A user registration that will eventually invoke its callback once.
    Async(RegisterFn),
    /// Evaluate `source` with `context` as the ambient context.
    AsyncContinueOn {
        source: Box<Node>,
        context: Context,
    },
    /// Evaluate `source` under `modify(current)`, optionally restoring.
    AsyncContextSwitch {
        source: Box<Node>,
        modify: ModifyContextFn,
        restore: Option<RestoreContextFn>,
    },
    /// Rewrite the ambient context at the next safe point.
    UpdateContext {
        source: Box<Node>,
        modify: ModifyContextFn,
    },
    /// Continue on `context` after `source` completes.
    ContinueOn {
        source: Box<Node>,
        context: Context,
    },
    /// Replace the cancellation token for the duration of `source`.
    ConnectionSwitch {
        source: Box<Node>,
        modify: ModifyTokenFn,
        restore: Option<RestoreTokenFn>,
    },
}

impl Node {
    /// The instruction's tag name, for diagnostics.
    pub(crate) const fn tag(&self) -> &'static str {
        match self {
            Self::Pure(_) => "Pure",
            Self::RaiseError(_) => "RaiseError",
            Self::Lazy(_) => "Lazy",
            Self::Defer(_) => "Defer",
            Self::Map { .. } => "Map",
            Self::FlatMap { .. } => "FlatMap",
            Self::Single(_) => "Single",
            Self::Async(_) => "Async",
            Self::AsyncContinueOn { .. } => "AsyncContinueOn",
            Self::AsyncContextSwitch { .. } => "AsyncContextSwitch",
            Self::UpdateContext { .. } => "UpdateContext",
            Self::ContinueOn { .. } => "ContinueOn",
            Self::ConnectionSwitch { .. } => "ConnectionSwitch",
        }
    }

    /// Rewrites `ContinueOn(source, context)` into
    /// `FlatMap(source, a -> AsyncContinueOn(Pure(a), context))`.
    pub(crate) fn rewrite_continue_on(source: Box<Self>, context: Context) -> Self {
        Self::FlatMap {
            source,
            frame: Frame::Bind(Box::new(move |value| Self::AsyncContinueOn {
                source: Box::new(Self::Pure(value)),
                context,
            })),
        }
    }

    /// Rewrites `UpdateContext(source, modify)` into
    /// `FlatMap(source, a -> AsyncContextSwitch(Pure(a), modify, none))`.
    pub(crate) fn rewrite_update_context(source: Box<Self>, modify: ModifyContextFn) -> Self {
        Self::FlatMap {
            source,
            frame: Frame::Bind(Box::new(move |value| Self::AsyncContextSwitch {
                source: Box::new(Self::Pure(value)),
                modify,
                restore: None,
            })),
        }
    }
}

// =============================================================================
// Typed façade
// =============================================================================

/// A description of a computation producing an `A` or a [`Failure`].
///
/// `Effect` values are inert: constructing or combining them performs no
/// work. Execution happens through the entry points, which interpret the
/// instruction tree on an explicit continuation stack - arbitrarily deep
/// `flat_map` chains run in constant host-stack space.
///
/// # Monad laws
///
/// With runs compared by outcome:
///
/// 1. **Left identity**: `Effect::pure(a).flat_map(f)` ≡ `f(a)`
/// 2. **Right identity**: `effect.flat_map(Effect::pure)` ≡ `effect`
/// 3. **Associativity**: `effect.flat_map(f).flat_map(g)` ≡
///    `effect.flat_map(|x| f(x).flat_map(g))`
///
/// # Examples
///
/// ```rust
/// use eddy::effect::{Context, Effect};
///
/// let effect = Effect::new(|| 21).fmap(|value| value * 2);
/// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
/// ```
pub struct Effect<A> {
    pub(crate) node: Node,
    marker: PhantomData<fn() -> A>,
}

impl<A> Effect<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }
}

impl<A: Send + 'static> Effect<A> {
    /// Lifts an already-evaluated value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// assert_eq!(Effect::pure(42).run_blocking(Context::new()).unwrap(), 42);
    /// ```
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(erase_value(value)))
    }

    /// An effect that fails with the given [`Failure`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect, Failure};
    ///
    /// let effect: Effect<i32> = Effect::raise_error(Failure::message("boom"));
    /// assert_eq!(
    ///     effect.run_blocking(Context::new()).unwrap_err().to_string(),
    ///     "boom",
    /// );
    /// ```
    pub fn raise_error(failure: Failure) -> Self {
        Self::from_node(Node::RaiseError(failure))
    }

    /// Suspends a synchronous computation.
    ///
    /// The thunk runs when the effect is interpreted; a panic inside it is
    /// captured and becomes an in-band failure.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// let effect = Effect::new(|| 10 + 20);
    /// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 30);
    /// ```
    pub fn new<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Lazy(Box::new(move || erase_value(thunk()))))
    }

    /// Suspends the *construction* of an effect.
    ///
    /// Useful for recursive definitions: the thunk is not invoked until the
    /// interpreter reaches it, so the recursion unfolds one step at a time.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// let effect = Effect::defer(|| Effect::pure("built on demand"));
    /// assert_eq!(
    ///     effect.run_blocking(Context::new()).unwrap(),
    ///     "built on demand",
    /// );
    /// ```
    pub fn defer<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Self::from_node(Node::Defer(Box::new(move || thunk().node)))
    }

    /// Bridges an external callback world.
    ///
    /// `register` receives the run's cancellation [`Token`] and a one-shot
    /// [`AsyncCallback`]; it must eventually invoke the callback exactly
    /// once. Extra invocations are dropped ([`AsyncCallback::resume`]
    /// returns `false` for them). A panic inside `register` becomes an
    /// in-band failure.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// let effect = Effect::from_async(|_token, callback| {
    ///     callback.resume(Ok(42));
    /// });
    /// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
    /// ```
    pub fn from_async<F>(register: F) -> Self
    where
        F: FnOnce(Token, AsyncCallback<A>) + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |token, handle| {
            register(token, AsyncCallback::new(handle));
        })))
    }

    /// An effect that never completes.
    ///
    /// Only cancellation can end a run parked on it.
    #[must_use]
    pub fn never() -> Self {
        Self::from_async(|_token, _callback| {})
    }

    /// Lifts a future.
    ///
    /// The future is driven on the ambient tokio runtime when the
    /// interpreter reaches this instruction; running it outside a runtime
    /// reports an in-band failure.
    pub fn from_future<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = A> + Send + 'static,
    {
        Self::from_node(Node::Single(Box::new(move |_context| {
            async move { Ok(erase_value(future.await)) }.boxed()
        })))
    }

    /// Lifts a fallible, context-aware future factory.
    ///
    /// The factory receives the ambient [`Context`] current at the
    /// suspension point - the same context a host continuation would carry.
    pub fn from_future_with_context<F, Fut>(suspend: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, Failure>> + Send + 'static,
    {
        Self::from_node(Node::Single(Box::new(move |context| {
            async move { suspend(context).await.map(erase_value) }.boxed()
        })))
    }

    // =========================================================================
    // Sequencing
    // =========================================================================

    /// Applies a pure function to the result.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// let effect = Effect::pure(21).fmap(|value| value * 2);
    /// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
    /// ```
    pub fn fmap<B, F>(self, function: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_node(Node::Map {
            source: Box::new(self.node),
            map: Box::new(move |value| downcast_value::<A>(value).map(|a| erase_value(function(a)))),
        })
    }

    /// Sequences this effect into a continuation.
    ///
    /// The continuation runs only after this effect - including all of its
    /// asynchronous boundaries - has completed with a value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect};
    ///
    /// let effect = Effect::pure(10).flat_map(|value| Effect::pure(value * 2));
    /// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 20);
    /// ```
    pub fn flat_map<B, F>(self, function: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B> + Send + 'static,
    {
        Effect::from_node(Node::FlatMap {
            source: Box::new(self.node),
            frame: Frame::Bind(Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => function(a).node,
                Err(failure) => Node::RaiseError(failure),
            })),
        })
    }

    /// Alias for [`flat_map`](Self::flat_map).
    pub fn and_then<B, F>(self, function: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B> + Send + 'static,
    {
        self.flat_map(function)
    }

    /// Sequences two effects, discarding this one's result.
    #[must_use]
    pub fn then<B>(self, next: Effect<B>) -> Effect<B>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| next)
    }

    /// Combines two effects with a function, running them in order.
    pub fn map2<B, C, F>(self, other: Effect<B>, function: F) -> Effect<C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.flat_map(move |a| other.fmap(move |b| function(a, b)))
    }

    /// Combines two effects into a tuple, running them in order.
    #[must_use]
    pub fn product<B>(self, other: Effect<B>) -> Effect<(A, B)>
    where
        B: Send + 'static,
    {
        self.map2(other, |a, b| (a, b))
    }

    // =========================================================================
    // Error handling
    // =========================================================================

    /// Recovers from a failure with a new effect.
    ///
    /// The handler is consulted only on the error path; on success it is
    /// skipped without running any code.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect, Failure};
    ///
    /// let effect = Effect::<i32>::raise_error(Failure::message("x"))
    ///     .handle_error_with(|_failure| Effect::pure(7));
    /// assert_eq!(effect.run_blocking(Context::new()).unwrap(), 7);
    /// ```
    pub fn handle_error_with<F>(self, recover: F) -> Self
    where
        F: FnOnce(Failure) -> Self + Send + 'static,
    {
        Self::from_node(Node::FlatMap {
            source: Box::new(self.node),
            frame: Frame::Recover(Box::new(move |failure| recover(failure).node)),
        })
    }

    /// Sequences with separate continuations for the value and error paths.
    ///
    /// Exactly one of `bind` and `recover` runs, depending on how this
    /// effect finishes.
    pub fn redeem_with<B, FB, FR>(self, bind: FB, recover: FR) -> Effect<B>
    where
        B: Send + 'static,
        FB: FnOnce(A) -> Effect<B> + Send + 'static,
        FR: FnOnce(Failure) -> Effect<B> + Send + 'static,
    {
        Effect::from_node(Node::FlatMap {
            source: Box::new(self.node),
            frame: Frame::Transform {
                bind: Box::new(move |value| match downcast_value::<A>(value) {
                    Ok(a) => bind(a).node,
                    Err(failure) => Node::RaiseError(failure),
                }),
                recover: Box::new(move |failure| recover(failure).node),
            },
        })
    }

    /// Materializes the outcome, turning failures into values.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::{Context, Effect, Failure};
    ///
    /// let effect = Effect::<i32>::raise_error(Failure::message("x")).attempt();
    /// let outcome = effect.run_blocking(Context::new()).unwrap();
    /// assert_eq!(outcome.unwrap_err().to_string(), "x");
    /// ```
    pub fn attempt(self) -> Effect<Result<A, Failure>> {
        self.redeem_with(
            |value| Effect::pure(Ok(value)),
            |failure| Effect::pure(Err(failure)),
        )
    }

    // =========================================================================
    // Ambient context
    // =========================================================================

    /// Continues on the given ambient context once this effect completes.
    ///
    /// This effect itself still runs under the context current at its start;
    /// only the continuation observes `context`. The switch is permanent for
    /// the remainder of the enclosing scope.
    #[must_use]
    pub fn continue_on(self, context: Context) -> Self {
        Self::from_node(Node::ContinueOn {
            source: Box::new(self.node),
            context,
        })
    }

    /// Rewrites the ambient context at the next safe point after this
    /// effect completes. The rewrite is permanent for the remainder of the
    /// enclosing scope.
    pub fn update_context<F>(self, modify: F) -> Self
    where
        F: FnOnce(Context) -> Context + Send + 'static,
    {
        Self::from_node(Node::UpdateContext {
            source: Box::new(self.node),
            modify: Box::new(modify),
        })
    }

    /// Evaluates this effect under a modified ambient context, restoring the
    /// entry context afterwards on both the success and the error path.
    pub fn scoped_context<F>(self, modify: F) -> Self
    where
        F: FnOnce(Context) -> Context + Send + 'static,
    {
        Self::from_node(Node::AsyncContextSwitch {
            source: Box::new(self.node),
            modify: Box::new(modify),
            restore: Some(Arc::new(|previous, _current| previous)),
        })
    }

    // =========================================================================
    // Cancellation scope
    // =========================================================================

    /// Shields this effect from cancellation.
    ///
    /// The run proceeds on the non-cancelable token for the duration of this
    /// effect; the original token is re-installed on exit (success or
    /// failure), at which point a cancellation requested in the meantime
    /// takes effect.
    #[must_use]
    pub fn uncancelable(self) -> Self {
        Self::from_node(Node::ConnectionSwitch {
            source: Box::new(self.node),
            modify: Box::new(|_current| Token::non_cancelable()),
            restore: Some(Arc::new(|previous, _current| previous)),
        })
    }
}

impl Effect<()> {
    /// The already-completed unit effect.
    #[must_use]
    pub fn unit() -> Self {
        Self::pure(())
    }
}

impl Effect<Context> {
    /// Reads the ambient context current at this point of the run.
    ///
    /// Implemented as a one-shot suspension: the interpreter hands the
    /// context it is carrying to the suspension's thunk, so switches made by
    /// enclosing instructions are visible and restorations are observable.
    #[must_use]
    pub fn read_context() -> Self {
        Self::from_future_with_context(|context| async move { Ok(context) })
    }
}

impl<A> fmt::Display for Effect<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "<{}>", self.node.tag())
    }
}

impl<A> fmt::Debug for Effect<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("Effect")
            .field(&self.node.tag())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_shows_instruction_tag() {
        assert_eq!(format!("{}", Effect::pure(1)), "<Pure>");
        assert_eq!(
            format!("{}", Effect::pure(1).fmap(|value| value + 1)),
            "<Map>"
        );
        assert_eq!(
            format!("{}", Effect::pure(1).flat_map(Effect::pure)),
            "<FlatMap>"
        );
        assert_eq!(format!("{}", Effect::<i32>::never()), "<Async>");
    }

    #[test]
    fn test_debug_shows_instruction_tag() {
        let rendered = format!("{:?}", Effect::pure(1).uncancelable());
        assert!(rendered.contains("ConnectionSwitch"));
    }

    #[test]
    fn test_construction_is_inert() {
        // Building an effect must not run the thunk.
        let effect: Effect<i32> = Effect::new(|| unreachable!("constructed, not run"));
        drop(effect);
    }

    #[test]
    fn test_downcast_value_round_trip() {
        let erased = erase_value(42i32);
        assert_eq!(downcast_value::<i32>(erased).unwrap(), 42);
    }

    #[test]
    fn test_downcast_value_mismatch_is_failure() {
        let erased = erase_value(42i32);
        let failure = downcast_value::<String>(erased).unwrap_err();
        assert!(failure.to_string().contains("type mismatch"));
    }
}
