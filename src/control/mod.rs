//! General-purpose control structures.
//!
//! Currently a single citizen lives here:
//!
//! - [`Either`]: a value that is one of two alternatives, used as the resume
//!   type of [`Effect::step`](crate::effect::Effect::step).
//!
//! # Examples
//!
//! ```rust
//! use eddy::control::Either;
//!
//! let outcome: Either<&str, i32> = Either::Right(42);
//! assert_eq!(outcome.fold(|_error| 0, |value| value), 42);
//! ```

mod either;

pub use either::Either;
