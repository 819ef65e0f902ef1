#![cfg(feature = "effect")]
//! Integration tests for the run-loop: stack safety, trampolining, and the
//! one-shot `step` evaluator.

use eddy::control::Either;
use eddy::effect::{Context, Effect, Failure};
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn run<A: Send + 'static>(effect: Effect<A>) -> Result<A, Failure> {
    effect.run_blocking(Context::new())
}

// =============================================================================
// Stack Safety
// =============================================================================

/// Self-recursive bind loop: counts to 50_001 one flat_map at a time.
fn count_up(current: u64) -> Effect<u64> {
    if current > 50_000 {
        Effect::pure(current)
    } else {
        Effect::pure(current).flat_map(|value| count_up(value + 1))
    }
}

#[rstest]
fn test_pure_flat_map_loop_reaches_50_001() {
    assert_eq!(run(count_up(0)).unwrap(), 50_001);
}

#[rstest]
fn test_one_million_recursive_binds() {
    fn ascend(current: u64) -> Effect<u64> {
        if current >= 1_000_000 {
            Effect::pure(current)
        } else {
            Effect::pure(current).flat_map(|value| ascend(value + 1))
        }
    }

    assert_eq!(run(ascend(0)).unwrap(), 1_000_000);
}

#[rstest]
fn test_hundred_thousand_folded_binds() {
    let effect = (0..100_000u64).fold(Effect::pure(0u64), |accumulator, _| {
        accumulator.flat_map(|value| Effect::pure(value + 1))
    });
    assert_eq!(run(effect).unwrap(), 100_000);
}

#[rstest]
fn test_deep_fmap_chain() {
    let effect = (0..100_000u64).fold(Effect::pure(0u64), |accumulator, _| {
        accumulator.fmap(|value| value + 1)
    });
    assert_eq!(run(effect).unwrap(), 100_000);
}

#[rstest]
fn test_deep_defer_chain() {
    fn descend(remaining: u64) -> Effect<u64> {
        if remaining == 0 {
            Effect::pure(0)
        } else {
            Effect::defer(move || descend(remaining - 1))
        }
    }

    assert_eq!(run(descend(100_000)).unwrap(), 0);
}

// =============================================================================
// Trampoline Depth
// =============================================================================

#[rstest]
fn test_ten_thousand_synchronous_async_steps() {
    let effect = (0..10_000u64).fold(Effect::pure(0u64), |accumulator, _| {
        accumulator.flat_map(|value| {
            Effect::from_async(move |_token, callback| {
                // Resolves during registration: the worst case for host-stack
                // growth, bounded by the boundary's trampoline.
                callback.resume(Ok(value + 1));
            })
        })
    });

    assert_eq!(run(effect).unwrap(), 10_000);
}

#[rstest]
fn test_synchronous_async_steps_interleaved_with_errors() {
    let effect = (0..2_000u64).fold(Effect::pure(0u64), |accumulator, index| {
        accumulator.flat_map(move |value| {
            let failing: Effect<u64> = Effect::from_async(move |_token, callback| {
                callback.resume(Err(Failure::message(format!("step {index}"))));
            });
            failing.handle_error_with(move |_failure| Effect::pure(value + 1))
        })
    });

    assert_eq!(run(effect).unwrap(), 2_000);
}

// =============================================================================
// step: One-Shot Evaluation
// =============================================================================

#[rstest]
fn test_step_finishes_pure_prefix() {
    let effect = Effect::pure(1).fmap(|value| value + 1).flat_map(Effect::pure);
    assert!(matches!(effect.step(), Either::Right(2)));
}

#[rstest]
fn test_step_runs_lazy_prefix_synchronously() {
    let executed = Arc::new(AtomicBool::new(false));
    let tracked = Arc::clone(&executed);

    let effect = Effect::new(move || {
        tracked.store(true, Ordering::SeqCst);
        5
    });

    assert!(matches!(effect.step(), Either::Right(5)));
    assert!(executed.load(Ordering::SeqCst));
}

#[rstest]
fn test_step_returns_unhandled_error_as_tail() {
    let effect: Effect<i32> = Effect::raise_error(Failure::message("x"));
    match effect.step() {
        Either::Left(tail) => {
            assert_eq!(run(tail).unwrap_err().to_string(), "x");
        }
        Either::Right(_) => panic!("an unhandled error must not produce a value"),
    }
}

#[rstest]
fn test_step_recovers_errors_in_prefix() {
    let effect = Effect::<i32>::raise_error(Failure::message("x"))
        .handle_error_with(|_failure| Effect::pure(9));
    assert!(matches!(effect.step(), Either::Right(9)));
}

#[rstest]
fn test_step_suspends_on_async_without_stack() {
    let effect = Effect::from_async(|_token, callback| {
        callback.resume(Ok(3));
    });
    match effect.step() {
        Either::Left(tail) => assert_eq!(run(tail).unwrap(), 3),
        Either::Right(_) => panic!("an async instruction cannot finish synchronously"),
    }
}

#[rstest]
fn test_step_tail_carries_saved_continuations() {
    let prefix_ran = Arc::new(AtomicBool::new(false));
    let tracked = Arc::clone(&prefix_ran);

    let effect = Effect::new(move || {
        tracked.store(true, Ordering::SeqCst);
        10
    })
    .flat_map(|value| {
        Effect::from_async(move |_token, callback| {
            callback.resume(Ok(value));
        })
    })
    .fmap(|value: i32| value * 3);

    let tail = match effect.step() {
        Either::Left(tail) => tail,
        Either::Right(_) => panic!("must suspend at the async instruction"),
    };

    // The synchronous prefix already ran; the tail completes the rest.
    assert!(prefix_ran.load(Ordering::SeqCst));
    assert_eq!(run(tail).unwrap(), 30);
}

#[rstest]
fn test_step_treats_uncancelable_scope_as_suspension() {
    let effect = Effect::pure(4).uncancelable();
    match effect.step() {
        Either::Left(tail) => assert_eq!(run(tail).unwrap(), 4),
        Either::Right(_) => panic!("token switches suspend the one-shot evaluator"),
    }
}

// =============================================================================
// Delivery Across Threads
// =============================================================================

#[rstest]
fn test_run_blocking_waits_for_foreign_thread() {
    let effect = Effect::from_async(|_token, callback| {
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            callback.resume(Ok(77));
        });
    });
    assert_eq!(run(effect).unwrap(), 77);
}

#[rstest]
fn test_continuations_resume_after_foreign_thread() {
    let effect = Effect::from_async(|_token, callback| {
        std::thread::spawn(move || {
            callback.resume(Ok(5));
        });
    })
    .flat_map(|value: i32| Effect::pure(value * 2))
    .fmap(|value| value + 1);

    assert_eq!(run(effect).unwrap(), 11);
}

#[rstest]
fn test_start_delivers_synchronously_for_pure_effects() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let tracked = Arc::clone(&delivered);

    Effect::pure(1).start(Context::new(), move |result| {
        assert_eq!(result.unwrap(), 1);
        tracked.fetch_add(1, Ordering::SeqCst);
    });

    // Pure runs complete before start returns.
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}
