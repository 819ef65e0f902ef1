//! Failure - the interpreter's error channel.
//!
//! Every run of an [`Effect`](super::Effect) terminates in exactly one of
//! three ways: a value, a [`Failure`], or not at all. `Failure` carries the
//! non-value outcomes:
//!
//! - **Cancellation**: the distinguished sentinel produced when a run's
//!   [`Token`](super::Token) is canceled.
//! - **Raised errors**: ordinary errors raised in-band, either explicitly via
//!   [`Effect::raise_error`](super::Effect::raise_error) or by a fallible
//!   suspension.
//! - **Captured panics**: unwinding panics from user-supplied closures are
//!   caught at the interpreter's boundaries and converted into failures.
//!   Aborting errors (out-of-memory, double panics) are never caught.
//!
//! `Failure` is cheap to clone; the payload is shared behind an `Arc` so a
//! single failure can flow through recovery combinators and finalizers
//! without copying the underlying error.
//!
//! # Examples
//!
//! ```rust
//! use eddy::effect::Failure;
//!
//! let failure = Failure::message("disk on fire");
//! assert_eq!(failure.to_string(), "disk on fire");
//! assert!(!failure.is_canceled());
//!
//! let canceled = Failure::canceled();
//! assert!(canceled.is_canceled());
//! ```

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A plain-text error used by [`Failure::message`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct MessageError(String);

/// The three outcomes a failure can describe.
#[derive(Debug)]
enum FailureKind {
    /// The run's cancellation token was canceled.
    Canceled,
    /// An error raised in-band by user code.
    Raised(Box<dyn Error + Send + Sync>),
    /// A panic captured from a user-supplied closure.
    Panic(String),
}

/// The error channel of the effect interpreter.
///
/// A `Failure` is delivered to the final callback of a run when the effect
/// raises an error, panics in user code, or is canceled. Recovery
/// combinators such as
/// [`Effect::handle_error_with`](super::Effect::handle_error_with) receive
/// the same type.
///
/// # Examples
///
/// ```rust
/// use eddy::effect::{Context, Effect, Failure};
///
/// let effect: Effect<i32> = Effect::raise_error(Failure::message("boom"));
/// let recovered = effect.handle_error_with(|failure| {
///     assert_eq!(failure.to_string(), "boom");
///     Effect::pure(7)
/// });
/// assert_eq!(recovered.run_blocking(Context::new()).unwrap(), 7);
/// ```
#[derive(Clone)]
pub struct Failure {
    kind: Arc<FailureKind>,
}

impl Failure {
    fn from_kind(kind: FailureKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    /// The cancellation sentinel.
    ///
    /// Produced by the interpreter when a run observes its canceled token;
    /// it can also be raised manually to imitate cancellation in tests.
    #[must_use]
    pub fn canceled() -> Self {
        Self::from_kind(FailureKind::Canceled)
    }

    /// Wraps an arbitrary error value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::Failure;
    ///
    /// let failure = Failure::from_error(std::io::Error::new(
    ///     std::io::ErrorKind::NotFound,
    ///     "missing",
    /// ));
    /// assert_eq!(failure.to_string(), "missing");
    /// ```
    pub fn from_error<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::from_kind(FailureKind::Raised(Box::new(error)))
    }

    /// Wraps a plain message as a raised error.
    pub fn message(message: impl Into<String>) -> Self {
        Self::from_kind(FailureKind::Raised(Box::new(MessageError(message.into()))))
    }

    /// Converts a captured unwind payload into a failure.
    ///
    /// Extracts the panic message when the payload is a `&str` or `String`,
    /// mirroring the usual `catch_unwind` downcast dance.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::from_kind(FailureKind::Panic(message))
    }

    /// Whether this failure is the cancellation sentinel.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(*self.kind, FailureKind::Canceled)
    }

    /// Whether this failure was produced by capturing a panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(*self.kind, FailureKind::Panic(_))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind {
            FailureKind::Canceled => write!(formatter, "effect canceled"),
            FailureKind::Raised(error) => write!(formatter, "{error}"),
            FailureKind::Panic(message) => write!(formatter, "effect panicked: {message}"),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind {
            FailureKind::Canceled => formatter.debug_tuple("Canceled").finish(),
            FailureKind::Raised(error) => formatter.debug_tuple("Raised").field(error).finish(),
            FailureKind::Panic(message) => formatter.debug_tuple("Panic").field(message).finish(),
        }
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &*self.kind {
            FailureKind::Raised(error) => Some(error.as_ref() as &(dyn Error + 'static)),
            FailureKind::Canceled | FailureKind::Panic(_) => None,
        }
    }
}
