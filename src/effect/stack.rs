//! The interpreter's explicit continuation stack.
//!
//! Pending continuations live on a [`CallStack`] instead of the host stack.
//! The hot slot `first` holds the most recent frame; older frames overflow
//! into a small-vector `rest`. Most bind chains are shallow, so the scalar
//! slot plus a few inline slots cover the common case without touching the
//! heap.
//!
//! Frames come in four shapes:
//!
//! - [`Frame::Map`] - a pure continuation (`value -> value`).
//! - [`Frame::Bind`] - a monadic continuation (`value -> effect`).
//! - [`Frame::Recover`] - an error handler with an identity success path;
//!   skipped and dropped when a value is popped.
//! - [`Frame::Transform`] - both paths populated (`redeem_with`, context and
//!   connection restoration); runs on success *and* on error.

use smallvec::SmallVec;

use super::context::Context;
use super::failure::Failure;
use super::program::{AnyValue, BindFn, MapFn, Node, RecoverFn, RestoreContextFn, RestoreTokenFn};
use super::token::Token;

/// Inline capacity of the overflow stack.
const INLINE_FRAMES: usize = 8;

/// A pending continuation awaiting the current instruction's outcome.
pub(crate) enum Frame {
    /// Pure continuation; the result feeds the next instruction as `Pure`.
    Map(MapFn),
    /// Monadic continuation producing the next instruction.
    Bind(BindFn),
    /// Error handler; identity on the success path.
    Recover(RecoverFn),
    /// Continuation with both a success and an error path.
    Transform {
        /// Applied when the instruction produced a value.
        bind: BindFn,
        /// Applied when the instruction raised a failure.
        recover: RecoverFn,
    },
}

impl Frame {
    /// Whether this frame only matters on the error path.
    fn is_recover_only(&self) -> bool {
        matches!(self, Self::Recover(_))
    }

    /// Whether this frame can receive a failure.
    fn handles_errors(&self) -> bool {
        matches!(self, Self::Recover(_) | Self::Transform { .. })
    }

    /// Feeds a value into the frame, producing the next instruction.
    pub(crate) fn apply(self, value: AnyValue) -> Node {
        match self {
            Self::Map(map) => match map(value) {
                Ok(mapped) => Node::Pure(mapped),
                Err(failure) => Node::RaiseError(failure),
            },
            Self::Bind(bind) | Self::Transform { bind, .. } => bind(value),
            // Identity success path; normally skipped by `pop_for_value`.
            Self::Recover(_) => Node::Pure(value),
        }
    }

    /// Feeds a failure into the frame, producing the recovery instruction.
    pub(crate) fn recover(self, failure: Failure) -> Node {
        match self {
            Self::Recover(recover) | Self::Transform { recover, .. } => recover(failure),
            // Not selected by error lookup; re-raise untouched.
            Self::Map(_) | Self::Bind(_) => Node::RaiseError(failure),
        }
    }

    /// A frame that re-establishes `previous` as the ambient context after
    /// the instruction below it finishes, on both exit paths.
    pub(crate) fn restore_context(previous: Context, restore: RestoreContextFn) -> Self {
        let bind_previous = previous.clone();
        let bind_restore = restore.clone();
        Self::Transform {
            bind: Box::new(move |value| Node::AsyncContextSwitch {
                source: Box::new(Node::Pure(value)),
                modify: Box::new(move |current| (*bind_restore)(bind_previous, current)),
                restore: None,
            }),
            recover: Box::new(move |failure| Node::AsyncContextSwitch {
                source: Box::new(Node::RaiseError(failure)),
                modify: Box::new(move |current| (*restore)(previous, current)),
                restore: None,
            }),
        }
    }

    /// A frame that swaps the cancellation token back to `previous` after
    /// the instruction below it finishes, on both exit paths.
    pub(crate) fn restore_connection(previous: Token, restore: RestoreTokenFn) -> Self {
        let bind_previous = previous.clone();
        let bind_restore = restore.clone();
        Self::Transform {
            bind: Box::new(move |value| Node::ConnectionSwitch {
                source: Box::new(Node::Pure(value)),
                modify: Box::new(move |current| (*bind_restore)(bind_previous, current)),
                restore: None,
            }),
            recover: Box::new(move |failure| Node::ConnectionSwitch {
                source: Box::new(Node::RaiseError(failure)),
                modify: Box::new(move |current| (*restore)(previous, current)),
                restore: None,
            }),
        }
    }
}

/// LIFO stack of pending [`Frame`]s with a scalar fast slot.
#[derive(Default)]
pub(crate) struct CallStack {
    first: Option<Frame>,
    rest: SmallVec<[Frame; INLINE_FRAMES]>,
}

impl CallStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none() && self.rest.is_empty()
    }

    /// Pushes a frame; a frame already in the fast slot overflows into `rest`.
    pub(crate) fn push(&mut self, frame: Frame) {
        if let Some(previous) = self.first.take() {
            self.rest.push(previous);
        }
        self.first = Some(frame);
    }

    /// Pops the next frame for a successful value.
    ///
    /// `Recover` frames are skipped and dropped: no error occurred, so their
    /// identity success path has nothing to contribute.
    pub(crate) fn pop_for_value(&mut self) -> Option<Frame> {
        if let Some(frame) = self.first.take() {
            if !frame.is_recover_only() {
                return Some(frame);
            }
        }
        while let Some(frame) = self.rest.pop() {
            if !frame.is_recover_only() {
                return Some(frame);
            }
        }
        None
    }

    /// Pops the recovery site for a failure.
    ///
    /// Frames that cannot receive a failure are discarded on the way down;
    /// the first handler-bearing frame becomes the recovery site. `None`
    /// means the failure surfaces to the final callback.
    pub(crate) fn pop_for_error(&mut self) -> Option<Frame> {
        if let Some(frame) = self.first.take() {
            if frame.handles_errors() {
                return Some(frame);
            }
        }
        while let Some(frame) = self.rest.pop() {
            if frame.handles_errors() {
                return Some(frame);
            }
        }
        None
    }
}
