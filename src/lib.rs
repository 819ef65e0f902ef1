//! # eddy
//!
//! A trampolined effect interpreter for Rust: describe computations as
//! inert values, run them stack-safely, cancel them cooperatively, and
//! carry an ambient context across asynchronous boundaries.
//!
//! ## Overview
//!
//! The crate is built around one type, [`Effect<A>`](effect::Effect), and
//! the machinery to interpret it:
//!
//! - **Stack safety**: `flat_map` chains of any depth run on an explicit
//!   continuation stack, never on the host stack.
//! - **Async bridging**: callback registrations and futures suspend the run
//!   and resume it exactly once, from any thread, through a guarded async
//!   boundary with a trampoline capping callback-chain stack depth.
//! - **Cooperative cancellation**: a shared token checked at every step,
//!   with LIFO finalizers to wake parked runs.
//! - **Ambient context**: an immutable property bag threaded through the
//!   run, swappable and restorable at well-defined switch points.
//!
//! ## Feature Flags
//!
//! - `control`: general control structures (`Either`)
//! - `effect`: the effect type and interpreter
//! - `full`: enable all features (default)
//!
//! ## Example
//!
//! ```rust
//! use eddy::prelude::*;
//!
//! let effect = Effect::pure(20)
//!     .fmap(|value| value * 2)
//!     .flat_map(|value| Effect::pure(value + 2));
//!
//! assert_eq!(effect.run_blocking(Context::new()).unwrap(), 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Prelude module for convenient imports.
///
/// Re-exports commonly used types and entry points.
///
/// # Usage
///
/// ```rust
/// use eddy::prelude::*;
/// ```
pub mod prelude {

    #[cfg(feature = "control")]
    pub use crate::control::*;

    #[cfg(feature = "effect")]
    pub use crate::effect::*;
}

#[cfg(feature = "control")]
pub mod control;

#[cfg(feature = "effect")]
pub mod effect;

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        // Basic smoke test to ensure the library compiles
        // This test just needs to successfully compile and run
    }
}
