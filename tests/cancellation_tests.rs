#![cfg(feature = "effect")]
//! Integration tests for cooperative cancellation: waking parked runs,
//! suppressing post-cancel continuations, and uncancelable scopes.

use eddy::effect::{Context, Effect, Failure, Token};
use rstest::rstest;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Delivery<A> = mpsc::Receiver<Result<A, Failure>>;

fn start_with_token<A: Send + 'static>(effect: Effect<A>, token: &Token) -> Delivery<A> {
    let (sender, receiver) = mpsc::channel();
    effect.start_cancelable(token.clone(), Context::new(), move |result| {
        let _ = sender.send(result);
    });
    receiver
}

// =============================================================================
// Cancel During Async
// =============================================================================

#[rstest]
fn test_cancel_wakes_parked_run() {
    let token = Token::cancelable();
    let receiver = start_with_token(Effect::<i32>::never(), &token);

    token.cancel();

    let outcome = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("cancellation must wake the parked run");
    assert!(outcome.unwrap_err().is_canceled());
}

#[rstest]
fn test_cancel_before_start_delivers_immediately() {
    let token = Token::cancelable();
    token.cancel();

    let receiver = start_with_token(Effect::pure(1), &token);
    let outcome = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("canceled runs still deliver");
    assert!(outcome.unwrap_err().is_canceled());
}

#[rstest]
fn test_cancel_between_instructions_stops_the_run() {
    let token = Token::cancelable();
    let observed = Arc::new(AtomicBool::new(false));
    let tracked = Arc::clone(&observed);

    let gate = token.clone();
    let effect = Effect::new(move || {
        // Cancel from inside the run: the check at the next instruction
        // boundary must observe it.
        gate.cancel();
        1
    })
    .flat_map(move |value| {
        tracked.store(true, Ordering::SeqCst);
        Effect::pure(value)
    });

    let receiver = start_with_token(effect, &token);
    let outcome = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(outcome.unwrap_err().is_canceled());
    assert!(!observed.load(Ordering::SeqCst));
}

#[rstest]
fn test_no_continuation_runs_after_cancel() {
    let token = Token::cancelable();
    let resumed_late = Arc::new(AtomicBool::new(false));
    let tracked = Arc::clone(&resumed_late);

    let stash: Arc<Mutex<Option<eddy::effect::AsyncCallback<i32>>>> =
        Arc::new(Mutex::new(None));
    let stashed = Arc::clone(&stash);

    let effect = Effect::from_async(move |_token, callback| {
        *stashed.lock().unwrap() = Some(callback);
    })
    .flat_map(move |value: i32| {
        tracked.store(true, Ordering::SeqCst);
        Effect::pure(value)
    });

    let receiver = start_with_token(effect, &token);
    token.cancel();

    // A straggling resume after cancellation is dropped.
    let late = stash.lock().unwrap().take().expect("registration ran");
    assert!(!late.resume(Ok(1)));

    let outcome = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(outcome.unwrap_err().is_canceled());
    assert!(!resumed_late.load(Ordering::SeqCst));
}

#[rstest]
fn test_cancel_is_idempotent_with_single_delivery() {
    let token = Token::cancelable();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let tracked = Arc::clone(&deliveries);

    Effect::<i32>::never().start_cancelable(token.clone(), Context::new(), move |_result| {
        tracked.fetch_add(1, Ordering::SeqCst);
    });

    token.cancel();
    token.cancel();
    token.cancel();

    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[rstest]
fn test_completed_run_ignores_later_cancel() {
    let token = Token::cancelable();
    let effect = Effect::from_async(|_token, callback| {
        callback.resume(Ok(42));
    });

    let receiver = start_with_token(effect, &token);
    let outcome = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(outcome.unwrap(), 42);

    // The waker finalizer was retracted on completion; cancel is inert.
    token.cancel();
    assert!(token.is_canceled());
}

// =============================================================================
// Uncancelable Scopes
// =============================================================================

#[rstest]
fn test_uncancelable_scope_completes_before_cancellation_lands() {
    let token = Token::cancelable();
    let inner_completed = Arc::new(AtomicBool::new(false));
    let tracked = Arc::clone(&inner_completed);

    let (release_sender, release_receiver) = mpsc::channel::<()>();

    let shielded = Effect::from_async(move |_token, callback| {
        std::thread::spawn(move || {
            release_receiver
                .recv()
                .expect("the test releases the gate exactly once");
            callback.resume(Ok(5));
        });
    })
    .fmap(move |value: i32| {
        // Still inside the shield: cancellation must not stop this.
        tracked.store(true, Ordering::SeqCst);
        value
    })
    .uncancelable();

    let receiver = start_with_token(shielded, &token);

    // Cancel while the shielded region is parked, then release it.
    token.cancel();
    release_sender.send(()).unwrap();

    let outcome = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(
        outcome.unwrap_err().is_canceled(),
        "cancellation lands once the shield is exited",
    );
    assert!(
        inner_completed.load(Ordering::SeqCst),
        "the shielded region ran to completion despite the cancel",
    );
}

#[rstest]
fn test_uncancelable_without_cancel_is_transparent() {
    let token = Token::cancelable();
    let effect = Effect::pure(6).uncancelable().fmap(|value| value * 7);

    let receiver = start_with_token(effect, &token);
    let outcome = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(outcome.unwrap(), 42);
}

// =============================================================================
// Finalizers
// =============================================================================

#[rstest]
fn test_cancel_drains_finalizers_lifo() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let token = Token::cancelable();

    for index in 0..3u32 {
        let order = Arc::clone(&order);
        token.push(Effect::new(move || {
            order.lock().unwrap().push(index);
        }));
    }

    token.cancel();
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
}

#[rstest]
fn test_popped_finalizer_does_not_run() {
    let ran = Arc::new(AtomicBool::new(false));
    let token = Token::cancelable();

    let tracked = Arc::clone(&ran);
    token.push(Effect::new(move || {
        tracked.store(true, Ordering::SeqCst);
    }));

    assert!(token.pop().is_some());
    token.cancel();
    assert!(!ran.load(Ordering::SeqCst));
}

#[rstest]
fn test_cancel_from_another_thread() {
    let token = Token::cancelable();
    let receiver = start_with_token(Effect::<i32>::never(), &token);

    let remote = token.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        remote.cancel();
    });

    let outcome = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("remote cancellation must wake the run");
    assert!(outcome.unwrap_err().is_canceled());
}
