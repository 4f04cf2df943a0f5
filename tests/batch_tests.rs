//! These tests are intended to ensure that a batch function is called the
//! correct number of times for different configurations, and that every
//! caller gets the right value out of the batch.

mod common;

use agenttrace_dataloader::{BatchController, BatchRules, LoadAll, LoadError, RequestContext};
use common::{call_counter, echo, key_recorder, stringify, NoOpWaker};
use cooked_waker::IntoWaker;
use futures::{executor, future, FutureExt};
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    task::{Context, Poll},
    thread,
    time::Duration,
};

#[test]
fn simple_test() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: Duration::ZERO,
        max_keys: None,
        batcher: call_counter(&counter, stringify),
    });

    let fut1 = controller.load(10);
    let fut2 = controller.load(20);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "20");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn low_key_test() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: Duration::ZERO,
        max_keys: NonZeroUsize::new(2),
        batcher: call_counter(&counter, stringify),
    });

    let fut1 = controller.load(10);
    let fut2 = controller.load(20);
    let fut3 = controller.load(30);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);
    let res3 = executor::block_on(fut3);

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "20");
    assert_eq!(res3.unwrap(), "30");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_controller_reports_its_rules() {
    let controller = BatchController::new(BatchRules {
        window: Duration::from_millis(25),
        max_keys: NonZeroUsize::new(50),
        batcher: stringify,
    });
    assert_eq!(controller.window(), Duration::from_millis(25));
    assert_eq!(controller.max_keys(), NonZeroUsize::new(50));

    let unbounded = BatchController::new(BatchRules {
        window: Duration::ZERO,
        max_keys: None,
        batcher: stringify,
    });
    assert_eq!(unbounded.window(), Duration::ZERO);
    assert_eq!(unbounded.max_keys(), None);
}

#[test]
fn test_duplicate_keys() {
    let batches = Mutex::new(Vec::new());

    let controller = BatchController::new(BatchRules {
        window: Duration::ZERO,
        max_keys: NonZeroUsize::new(2),
        batcher: key_recorder(&batches, stringify),
    });

    let fut1 = controller.load(10);
    let fut2 = controller.load(10);
    let fut3 = controller.load(10);

    // Duplicates don't count against max_keys. The batch is launched
    // *immediately* when the second distinct key arrives, so there's no
    // opportunity to add further keys after it.
    let fut4 = controller.load(20);
    let fut5 = controller.load(10);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);
    let res3 = executor::block_on(fut3);
    let res4 = executor::block_on(fut4);
    let res5 = executor::block_on(fut5);

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "10");
    assert_eq!(res3.unwrap(), "10");
    assert_eq!(res4.unwrap(), "20");
    assert_eq!(res5.unwrap(), "10");
    assert_eq!(*batches.lock().unwrap(), [vec![10, 20], vec![10]]);
}

#[test]
fn test_window_closes_the_batch() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: Duration::from_millis(1),
        max_keys: None,
        batcher: call_counter(&counter, stringify),
    });

    assert_eq!(executor::block_on(controller.load(1)).unwrap(), "1");

    // The first batch has been dispatched, so this starts a second one.
    assert_eq!(executor::block_on(controller.load(1)).unwrap(), "1");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

/// Spawn several batch futures in different threads, and confirm that a single
/// batch call was made fulfilling all of them
#[test]
fn test_threaded() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: Duration::from_millis(10),
        max_keys: None,
        batcher: call_counter(&counter, stringify),
    });
    let controller_ref = &controller;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(i + 2));
                    let fut = controller_ref.load(i as usize);
                    let result = executor::block_on(fut);
                    result.unwrap()
                })
            })
            .collect();

        let result: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        result
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_key_limit_instant_trigger() {
    let controller = BatchController::new(BatchRules {
        batcher: stringify,
        // Long enough that only the key limit can launch the batch
        window: Duration::from_secs(3600),
        max_keys: NonZeroUsize::new(3),
    });

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = controller.load(1);
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);

    let mut fut2 = controller.load(2);
    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Pending);

    // Reusing a key means we won't yet be at the key limit
    let mut fut11 = controller.load(1);
    assert_eq!(fut11.poll_unpin(&mut ctx), Poll::Pending);

    let mut fut3 = controller.load(3);

    assert_eq!(
        fut3.poll_unpin(&mut ctx),
        Poll::Ready(Ok(String::from("3"))),
    );
    assert_eq!(
        fut1.poll_unpin(&mut ctx),
        Poll::Ready(Ok(String::from("1"))),
    );
    assert_eq!(
        fut11.poll_unpin(&mut ctx),
        Poll::Ready(Ok(String::from("1"))),
    );
    assert_eq!(
        fut2.poll_unpin(&mut ctx),
        Poll::Ready(Ok(String::from("2"))),
    );
}

#[test]
fn test_single_key_batches_dispatch_at_once() {
    let batches = Mutex::new(Vec::new());

    let controller = BatchController::new(BatchRules {
        batcher: key_recorder(&batches, echo),
        window: Duration::from_secs(3600),
        max_keys: NonZeroUsize::new(1),
    });

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = controller.load(1);
    let mut fut2 = controller.load(2);

    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Ready(Ok(2)));
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Ready(Ok(1)));
    assert_eq!(*batches.lock().unwrap(), [vec![2], vec![1]]);
}

#[test]
fn test_dispatch_pending_skips_the_window() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        batcher: call_counter(&counter, stringify),
        window: Duration::from_secs(3600),
        max_keys: None,
    });

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = controller.load(1);
    let mut fut2 = controller.load(2);
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);

    controller.dispatch_pending();

    // Loads after a flush go to a fresh batch.
    let mut fut3 = controller.load(3);

    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Ready(Ok("2".to_string())));
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Ready(Ok("1".to_string())));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert_eq!(fut3.poll_unpin(&mut ctx), Poll::Pending);
    controller.dispatch_pending();
    assert_eq!(fut3.poll_unpin(&mut ctx), Poll::Ready(Ok("3".to_string())));
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    // Flushing with nothing open is a no-op.
    controller.dispatch_pending();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_missing_keys_get_the_default() {
    let controller = BatchController::new(BatchRules {
        batcher: |keys: Vec<u32>| async move {
            let found: HashMap<u32, Option<String>> = keys
                .into_iter()
                .filter(|key| key % 2 == 0)
                .map(|key| (key, Some(format!("even {}", key))))
                .collect();
            Ok::<_, ()>(found)
        },
        window: Duration::from_millis(1),
        max_keys: None,
    });

    let (two, three) = executor::block_on(future::join(controller.load(2), controller.load(3)));

    assert_eq!(two, Ok(Some("even 2".to_string())));
    assert_eq!(three, Ok(None));
}

#[test]
fn test_batch_error_reaches_every_waiter() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        batcher: call_counter(&counter, |_keys: Vec<u32>| {
            future::ready(Err::<HashMap<u32, u32>, _>("backend down".to_string()))
        }),
        window: Duration::from_millis(1),
        max_keys: None,
    });

    let (a, b, c) = executor::block_on(future::join3(
        controller.load(1),
        controller.load(2),
        controller.load(2),
    ));

    assert_eq!(a, Err("backend down".to_string()));
    assert_eq!(b, Err("backend down".to_string()));
    assert_eq!(c, Err("backend down".to_string()));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_load_all_keeps_input_order() {
    let batches = Mutex::new(Vec::new());

    let controller = BatchController::new(BatchRules {
        batcher: key_recorder(&batches, stringify),
        window: Duration::from_millis(1),
        max_keys: NonZeroUsize::new(2),
    });

    let ctx = RequestContext::new();
    let result = executor::block_on(controller.load_all(&ctx, vec![3, 1, 2, 1, 4]));

    assert_eq!(
        result,
        LoadAll {
            values: vec![
                "3".to_string(),
                "1".to_string(),
                "2".to_string(),
                "1".to_string(),
                "4".to_string(),
            ],
            first_error: None,
        }
    );

    // All keys were registered before anything was awaited, so batches were
    // cut purely by max_keys.
    assert_eq!(*batches.lock().unwrap(), [vec![1, 3], vec![1, 2], vec![4]]);
}

#[test]
fn test_load_all_reports_the_first_error() {
    let controller = BatchController::new(BatchRules {
        batcher: |_keys: Vec<u32>| future::ready(Err::<HashMap<u32, Option<u32>>, _>(7)),
        window: Duration::from_millis(1),
        max_keys: None,
    });

    let ctx = RequestContext::new();
    let result = executor::block_on(controller.load_all(&ctx, vec![1, 2]));

    assert_eq!(result.values, [None, None]);
    assert_eq!(result.first_error, Some(LoadError::Fetch(7)));
    assert_eq!(result.into_result(), Err(LoadError::Fetch(7)));
}
