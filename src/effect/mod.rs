//! The effect type and its trampolined interpreter.
//!
//! An [`Effect<A>`] *describes* a computation - possibly failing, possibly
//! asynchronous - without running it. The interpreter walks the description
//! on an explicit continuation stack, so arbitrarily deep `flat_map` chains
//! execute in constant host-stack space, and bridges into the asynchronous
//! world through a re-entrant async boundary that preserves the in-flight
//! continuation across callbacks.
//!
//! The moving parts:
//!
//! - [`Effect`]: the instruction tree and its combinators.
//! - [`Failure`]: the error channel (raised errors, captured panics, the
//!   cancellation sentinel).
//! - [`Token`]: the cooperative cancellation handle, with a LIFO finalizer
//!   stack drained on cancel.
//! - [`Context`]: the immutable ambient property bag threaded through a run
//!   and swappable via the context-switch combinators.
//! - [`AsyncCallback`]: the one-shot callback handed to
//!   [`Effect::from_async`] registrations.
//! - Entry points: [`Effect::start`], [`Effect::start_cancelable`],
//!   [`Effect::run_blocking`], [`Effect::step`], and the suspendable
//!   [`suspend_run`].
//!
//! # Examples
//!
//! ```rust
//! use eddy::effect::{Context, Effect, Failure};
//!
//! let effect = Effect::new(|| 6)
//!     .flat_map(|value| Effect::pure(value * 7))
//!     .handle_error_with(|_failure| Effect::pure(0));
//!
//! assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
//! ```
//!
//! # Execution model
//!
//! A run is single-threaded and cooperative: the loop never races with
//! itself, and only `Single`, `Async`, and the context-switch instructions
//! yield control. The async boundary is the sole synchronization surface;
//! its callbacks may arrive from any thread and are made single-shot by an
//! atomic compare-and-swap. Cancellation is checked at the top of every
//! loop iteration and delivered straight to the final callback.

mod boundary;
mod context;
mod failure;
mod platform;
mod program;
mod run_loop;
mod stack;
mod token;

pub use boundary::AsyncCallback;
pub use context::Context;
pub use failure::Failure;
pub use program::Effect;
pub use run_loop::suspend_run;
pub use token::Token;
