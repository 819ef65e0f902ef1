//! Either type - a value that is one of two alternatives.
//!
//! `Either<L, R>` holds a `Left(L)` or a `Right(R)`. In this crate it is the
//! resume type of [`Effect::step`](crate::effect::Effect::step): `Right` is
//! a finished value, `Left` is the remaining computation. It is equally
//! usable as a general-purpose two-alternative sum.
//!
//! # Examples
//!
//! ```rust
//! use eddy::control::Either;
//!
//! let left: Either<i32, &str> = Either::Left(42);
//! let right: Either<i32, &str> = Either::Right("hello");
//!
//! assert!(left.is_left());
//! assert!(right.is_right());
//!
//! let rendered = right.fold(
//!     |number| format!("number {number}"),
//!     |text| format!("text {text}"),
//! );
//! assert_eq!(rendered, "text hello");
//! ```

use std::fmt;

/// A value that is either a `Left(L)` or a `Right(R)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
    /// The left alternative.
    Left(L),
    /// The right alternative.
    Right(R),
}

impl<L, R> Either<L, R> {
    /// Whether this is a `Left`.
    #[must_use]
    pub const fn is_left(&self) -> bool {
        matches!(self, Self::Left(_))
    }

    /// Whether this is a `Right`.
    #[must_use]
    pub const fn is_right(&self) -> bool {
        matches!(self, Self::Right(_))
    }

    /// The left value, if present.
    pub fn left(self) -> Option<L> {
        match self {
            Self::Left(left) => Some(left),
            Self::Right(_) => None,
        }
    }

    /// The right value, if present.
    pub fn right(self) -> Option<R> {
        match self {
            Self::Left(_) => None,
            Self::Right(right) => Some(right),
        }
    }

    /// Collapses both alternatives into a single result.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::control::Either;
    ///
    /// let value: Either<i32, i32> = Either::Left(20);
    /// assert_eq!(value.fold(|l| l * 2, |r| r + 1), 40);
    /// ```
    pub fn fold<T, FL, FR>(self, on_left: FL, on_right: FR) -> T
    where
        FL: FnOnce(L) -> T,
        FR: FnOnce(R) -> T,
    {
        match self {
            Self::Left(left) => on_left(left),
            Self::Right(right) => on_right(right),
        }
    }

    /// Transforms the left alternative, leaving a `Right` untouched.
    pub fn map_left<T, F>(self, function: F) -> Either<T, R>
    where
        F: FnOnce(L) -> T,
    {
        match self {
            Self::Left(left) => Either::Left(function(left)),
            Self::Right(right) => Either::Right(right),
        }
    }

    /// Transforms the right alternative, leaving a `Left` untouched.
    pub fn map_right<T, F>(self, function: F) -> Either<L, T>
    where
        F: FnOnce(R) -> T,
    {
        match self {
            Self::Left(left) => Either::Left(left),
            Self::Right(right) => Either::Right(function(right)),
        }
    }

    /// Swaps the alternatives.
    pub fn swap(self) -> Either<R, L> {
        match self {
            Self::Left(left) => Either::Right(left),
            Self::Right(right) => Either::Left(right),
        }
    }

    /// Borrows the alternatives.
    pub const fn as_ref(&self) -> Either<&L, &R> {
        match self {
            Self::Left(left) => Either::Left(left),
            Self::Right(right) => Either::Right(right),
        }
    }
}

impl<L: fmt::Display, R: fmt::Display> fmt::Display for Either<L, R> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left(left) => write!(formatter, "Left({left})"),
            Self::Right(right) => write!(formatter, "Right({right})"),
        }
    }
}
