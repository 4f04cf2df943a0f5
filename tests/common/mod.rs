//! Helpers shared by the integration tests: wakers for manual polling, a
//! future that stays pending for a set number of polls, and a batch function
//! call counter.

#![allow(dead_code)]

use cooked_waker::{IntoWaker, ViaRawPointer, Wake, WakeRef};
use futures::FutureExt;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoOpWaker;

// cooked-waker 5 derives `IntoWaker` for any `Wake + Clone + ViaRawPointer`
// type instead of providing a derive macro.
unsafe impl ViaRawPointer for NoOpWaker {
    type Target = ();

    fn into_raw(self) -> *mut () {
        std::ptr::NonNull::dangling().as_ptr()
    }

    unsafe fn from_raw(_ptr: *mut ()) -> Self {
        NoOpWaker
    }
}

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default)]
pub struct BoolWaker {
    cell: Arc<AtomicBool>,
}

unsafe impl ViaRawPointer for BoolWaker {
    type Target = AtomicBool;

    fn into_raw(self) -> *mut AtomicBool {
        Arc::into_raw(self.cell) as *mut AtomicBool
    }

    unsafe fn from_raw(ptr: *mut AtomicBool) -> Self {
        BoolWaker {
            cell: Arc::from_raw(ptr as *const AtomicBool),
        }
    }
}

impl BoolWaker {
    pub fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    pub fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// A future that returns pending the first N times it is polled, then
/// returns Ready. It wakes its task every time it returns pending, so it
/// stands in for a fetch that needs a few round trips.
#[derive(Debug, Clone)]
pub struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    pub fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// A manually polled task with its own waker, so tests can see exactly
/// which tasks were signaled.
pub struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    pub fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    pub fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    pub fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}

/// Wrap a function so that every call bumps `counter`.
pub fn call_counter<'a, T, R>(
    counter: &'a AtomicUsize,
    function: impl Fn(T) -> R + 'a,
) -> impl Fn(T) -> R + 'a {
    move |argument| {
        counter.fetch_add(1, Ordering::SeqCst);
        function(argument)
    }
}

/// Wrap a batch function so that the keys of every batch are recorded,
/// sorted, in call order.
pub fn key_recorder<'a, K, R>(
    batches: &'a Mutex<Vec<Vec<K>>>,
    function: impl Fn(Vec<K>) -> R + 'a,
) -> impl Fn(Vec<K>) -> R + 'a
where
    K: Ord + Clone,
{
    move |keys: Vec<K>| {
        let mut sorted = keys.clone();
        sorted.sort();
        batches.lock().unwrap().push(sorted);
        function(keys)
    }
}

/// Batch function that echoes each key back as its value.
pub async fn echo<K: std::hash::Hash + Eq + Clone>(keys: Vec<K>) -> Result<HashMap<K, K>, ()> {
    Ok(keys.into_iter().map(|key| (key.clone(), key)).collect())
}

/// Batch function that stringifies every key.
pub async fn stringify(keys: Vec<usize>) -> Result<HashMap<usize, String>, ()> {
    Ok(keys.into_iter().map(|key| (key, key.to_string())).collect())
}
