use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{future, ready, FutureExt};
use futures_timer::Delay;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    context::RequestContext,
    data::{KeySet, Token as KeyToken, ValueSet},
    error::LoadError,
    wakerset::{Token as WakerToken, WakerSet},
};

struct AccumulatingState<Key: Eq + Hash, Batcher> {
    keys: KeySet<Key>,
    batcher: Arc<Batcher>,
    // None once the window is closed early, either because the batch is
    // full or because it was flushed.
    delay: Option<Delay>,
    wakers: WakerSet,
}

impl<Key: Debug + Hash + Eq, Batcher> Debug for AccumulatingState<Key, Batcher> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("batcher", &"<closure>")
            .field("delay", &self.delay)
            .field("wakers", &self.wakers)
            .finish()
    }
}

// Design notes:
//
// We only need one task to "drive" the batch. However, there are two cases
// we need to handle:
// - If a future is dropped, we need to arrange for a different task to
//   continue driving this batch
// - When the batch completes, we need to wake ALL the tasks
//
// The KeySet stays with the running batch so that waiters dropped while the
// fetch is in flight can withdraw their tokens before values are handed out.
struct RunningState<Key: Eq + Hash, Fut> {
    keys: KeySet<Key>,
    fut: Pin<Box<Fut>>,
    wakers: WakerSet,
}

enum State<Key: Hash + Eq, Value, Error, Fut, Batcher> {
    Accum(AccumulatingState<Key, Batcher>),
    Running(RunningState<Key, Fut>),
    Done(Result<ValueSet<Value>, Error>),
}

impl<Key: Hash + Eq, Value, Error, Fut, Batcher> State<Key, Value, Error, Fut, Batcher> {
    fn name(&self) -> &'static str {
        match self {
            State::Accum(..) => "accumulating",
            State::Running(..) => "running",
            State::Done(Ok(..)) => "done",
            State::Done(Err(..)) => "failed",
        }
    }
}

/// The behavior of a [`BatchController`].
///
/// - `batcher` is called once per batch with the unique keys of that batch.
///   It resolves to a map from key to value; keys it leaves out are handed
///   to their waiters as `Value::default()`.
/// - `window` is how long a batch stays open for more keys after its first
///   key arrives.
/// - `max_keys` optionally caps the number of distinct keys in a batch. A
///   batch that reaches the cap is dispatched at once, without waiting for
///   the window.
#[derive(Debug, Clone, Default)]
pub struct BatchRules<Batcher> {
    pub batcher: Batcher,
    pub window: Duration,
    pub max_keys: Option<NonZeroUsize>,
}

/// Coordinates the batching logic, pooling loads from many independent
/// tasks (even on different threads) into shared batches.
///
/// Each call to [`load`](BatchController::load) adds its key to the
/// currently open batch, opening one if there is none. The open batch is
/// "launched" when its window elapses or it reaches `max_keys`; it is then
/// detached from the controller, and the futures that joined it share
/// ownership of it and drive it to completion. A load that arrives after
/// that starts a new batch.
pub struct BatchController<Key: Hash + Eq, Value, Error, Fut, Batcher> {
    batcher: Arc<Batcher>,
    window: Duration,
    max_keys: Option<NonZeroUsize>,

    // Lock order: this mutex, then the state mutex.
    #[allow(clippy::type_complexity)]
    state: Mutex<Weak<Mutex<State<Key, Value, Error, Fut, Batcher>>>>,
}

impl<Key, Value, Error, Fut, Batcher> Debug for BatchController<Key, Value, Error, Fut, Batcher>
where
    Key: Hash + Eq,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let open = self.state.lock().upgrade();
        let state = open.as_ref().map(|state| state.lock().name());

        f.debug_struct("BatchController")
            .field("window", &self.window)
            .field("max_keys", &self.max_keys)
            .field("current", &state)
            .finish()
    }
}

impl<Key, Value, Error, Fut, Batcher> BatchController<Key, Value, Error, Fut, Batcher>
where
    Key: Eq + Hash + Clone,
    Value: Clone + Default,
    Error: Clone,
    Fut: Future<Output = Result<HashMap<Key, Value>, Error>>,
    Batcher: Fn(Vec<Key>) -> Fut,
{
    pub fn new(rules: BatchRules<Batcher>) -> Self {
        Self {
            batcher: Arc::new(rules.batcher),
            window: rules.window,
            max_keys: rules.max_keys,
            state: Mutex::new(Weak::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_keys(&self) -> Option<NonZeroUsize> {
        self.max_keys
    }

    /// Add `key` to the open batch and return a future for its value. The
    /// key is registered right away; the future only has to be polled to
    /// drive the batch and collect the result.
    pub fn load(&self, key: Key) -> BatchFuture<Key, Value, Error, Fut, Batcher> {
        let mut current = self.state.lock();

        // If there is an existing state, and it's still accumulating, add the
        // key to it. Note that at no point do we check the timing; if the
        // window has closed, the next poll will move the batch to Running and
        // a later load will find it there and start a new batch.
        if let Some(state_handle) = current.upgrade() {
            let mut state_guard = state_handle.lock();
            if let State::Accum(ref mut state) = *state_guard {
                let key_token = state.keys.add_key(key);

                // If we've hit the key limit, disarm the timer and wake the
                // driver so the batch is issued immediately, then detach the
                // shared state from the controller.
                let full = matches!(self.max_keys, Some(max) if state.keys.len() >= max.get());
                if full {
                    trace!(keys = state.keys.len(), "batch reached max_keys; dispatching early");
                    state.delay = None;
                    state.wakers.wake_driver();
                }

                drop(state_guard);
                if full {
                    *current = Weak::new();
                }

                return BatchFuture::new(key_token, state_handle);
            }
        }

        let mut keys = KeySet::new();
        let key_token = keys.add_key(key);

        // A batch that can only ever hold one key is dispatched as soon as
        // it's created, and is never offered to other loads.
        let immediate = matches!(self.max_keys, Some(max) if max.get() <= 1);

        let state = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            keys,
            batcher: Arc::clone(&self.batcher),
            delay: if immediate {
                None
            } else {
                Some(Delay::new(self.window))
            },
            wakers: WakerSet::default(),
        })));

        *current = if immediate {
            Weak::new()
        } else {
            trace!(window = ?self.window, "opened batch");
            Arc::downgrade(&state)
        };

        BatchFuture::new(key_token, state)
    }

    /// Load `key` on behalf of a caller. Resolves to the key's value, to
    /// [`LoadError::Fetch`] if the batch function failed, or to a
    /// cancellation error if `ctx` ended first. Only this caller is affected
    /// by its context; the batch still runs for everyone else.
    pub fn load_in<'c>(
        &self,
        ctx: &'c RequestContext,
        key: Key,
    ) -> impl Future<Output = Result<Value, LoadError<Error>>> + 'c
    where
        Key: 'c,
        Value: 'c,
        Error: 'c,
        Fut: 'c,
        Batcher: 'c,
    {
        let fut = self.load(key);
        ctx.guard(fut)
    }

    /// Load several keys and collect the results in input order. All of the
    /// keys are registered before any is awaited, so they land in as few
    /// batches as `max_keys` allows.
    pub fn load_all<'c, I>(
        &self,
        ctx: &'c RequestContext,
        keys: I,
    ) -> impl Future<Output = LoadAll<Value, LoadError<Error>>> + 'c
    where
        I: IntoIterator<Item = Key> + 'c,
        Key: 'c,
        Value: 'c,
        Error: 'c,
        Fut: 'c,
        Batcher: 'c,
    {
        let loads: Vec<_> = keys.into_iter().map(|key| self.load_in(ctx, key)).collect();
        future::join_all(loads).map(LoadAll::from_results)
    }

    /// Close the open batch now instead of waiting for its window. Its
    /// waiters dispatch it on their next poll; if none remain, it is simply
    /// dropped. Loads after this start a new batch.
    pub fn dispatch_pending(&self) {
        let mut current = self.state.lock();

        if let Some(state_handle) = current.upgrade() {
            if let State::Accum(ref mut state) = *state_handle.lock() {
                trace!(keys = state.keys.len(), "flushing open batch");
                state.delay = None;
                state.wakers.wake_driver();
            }
        }

        *current = Weak::new();
    }
}

/// The results of [`BatchController::load_all`], in the order of the keys
/// that were asked for.
///
/// Every position has a value. A position whose load failed holds
/// `Value::default()`, so callers that look at `values` when `first_error`
/// is set must tolerate defaults interleaved with real values.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadAll<Value, Error> {
    pub values: Vec<Value>,
    pub first_error: Option<Error>,
}

impl<Value: Default, Error> LoadAll<Value, Error> {
    fn from_results(results: Vec<Result<Value, Error>>) -> Self {
        let mut first_error = None;
        let values = results
            .into_iter()
            .map(|result| match result {
                Ok(value) => value,
                Err(err) => {
                    first_error.get_or_insert(err);
                    Value::default()
                }
            })
            .collect();

        LoadAll {
            values,
            first_error,
        }
    }
}

impl<Value, Error> LoadAll<Value, Error> {
    /// All the values, or the first error if any load failed.
    pub fn into_result(self) -> Result<Vec<Value>, Error> {
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(self.values),
        }
    }
}

// Invariant: in order for this future to exist, its key must have been added
// to the state.
pub struct BatchFuture<Key: Hash + Eq, Value, Error, Fut, Batcher> {
    key_token: Option<KeyToken>,
    waker_token: Option<WakerToken>,
    #[allow(clippy::type_complexity)]
    state: Arc<Mutex<State<Key, Value, Error, Fut, Batcher>>>,
}

impl<Key: Hash + Eq, Value, Error, Fut, Batcher> BatchFuture<Key, Value, Error, Fut, Batcher> {
    #[allow(clippy::type_complexity)]
    fn new(key_token: KeyToken, state: Arc<Mutex<State<Key, Value, Error, Fut, Batcher>>>) -> Self {
        Self {
            key_token: Some(key_token),
            waker_token: None,
            state,
        }
    }
}

impl<Key: Hash + Eq, Value, Error, Fut, Batcher> Debug
    for BatchFuture<Key, Value, Error, Fut, Batcher>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFuture")
            .field("key_token", &self.key_token)
            .field("waker_token", &self.waker_token)
            .field("state", &self.state.lock().name())
            .finish()
    }
}

impl<Key, Value, Error, Fut, Batcher> Future for BatchFuture<Key, Value, Error, Fut, Batcher>
where
    Key: Eq + Hash + Clone,
    Value: Clone + Default,
    Error: Clone,
    Fut: Future<Output = Result<HashMap<Key, Value>, Error>>,
    Batcher: Fn(Vec<Key>) -> Fut,
{
    type Output = Result<Value, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        // The lock is only held for the duration of a poll, never across one,
        // so it's fine to use in an async context.
        let mut guard = unpinned.state.lock();

        if let State::Accum(ref mut state) = *guard {
            // This waker is now the driving waker for the batch.
            state.wakers.upsert(&mut unpinned.waker_token, ctx.waker());

            // Check the delay
            if let Some(delay) = state.delay.as_mut() {
                ready!(delay.poll_unpin(ctx));
            }

            // Delay is complete. Transition to the Running state.
            let wakers = mem::take(&mut state.wakers);
            let keys = state.keys.take();

            debug!(keys = keys.len(), waiters = wakers.len(), "dispatching batch");
            let fut = Box::pin((*state.batcher)(keys.to_vec()));

            *guard = State::Running(RunningState { keys, fut, wakers });
        }

        if let State::Running(ref mut state) = *guard {
            state.wakers.upsert(&mut unpinned.waker_token, ctx.waker());

            let result = ready!(state.fut.as_mut().poll(ctx));

            // Waiters that lost interest while the fetch was running have
            // already withdrawn their tokens from the KeySet, so only live
            // waiters get an entry. Keys the batcher didn't return get the
            // default value.
            let keys = state.keys.take();
            let result = result.map(move |mut found| {
                keys.into_values(|key| found.remove(key).unwrap_or_default())
            });

            match &result {
                Ok(values) => debug!(keys = values.len(), "batch completed"),
                Err(..) => debug!("batch fetch failed"),
            }

            // Now that we have a result, signal all the waiting futures to
            // wake up so they can get their results.
            let mut all_wakers = mem::take(&mut state.wakers);
            if let Some(waker_token) = unpinned.waker_token.take() {
                // We're about to grab our result, so we don't need to wake
                // ourself
                all_wakers.discard_waker(waker_token);
            }

            all_wakers.wake_all();

            *guard = State::Done(result);
        }

        // The waker token belonged to a WakerSet that no longer exists.
        unpinned.waker_token = None;

        match *guard {
            State::Done(Ok(ref mut values)) => {
                let token = unpinned
                    .key_token
                    .take()
                    .expect("Can't re-poll a completed BatchFuture");

                match values.take(token) {
                    Some(value) => Poll::Ready(Ok(value)),
                    None => panic!("Unknown logic error: no value in ValueSet associated with Token"),
                }
            }
            State::Done(Err(ref err)) => {
                unpinned.key_token = None;
                Poll::Ready(Err(err.clone()))
            }
            _ => unreachable!("BatchFuture contained invalid state"),
        }
    }
}

impl<Key: Hash + Eq, Value, Error, Fut, Batcher> Drop
    for BatchFuture<Key, Value, Error, Fut, Batcher>
{
    fn drop(&mut self) {
        // An important thing to remember when dropping a BatchFuture: the
        // shared batch is only ever being driven by a single future.
        // Therefore, we have to ensure that another task is awoken to "take
        // over", in case this one was the driver.
        let mut guard = self.state.lock();

        match *guard {
            State::Accum(AccumulatingState {
                ref mut keys,
                ref mut wakers,
                ..
            })
            | State::Running(RunningState {
                ref mut keys,
                ref mut wakers,
                ..
            }) => {
                // Deregister ourselves from the KeySet, so that our key is
                // not fetched (or not handed out) on our behalf, and from the
                // WakerSet, waking someone else if we were driving.
                if let Some(key_token) = self.key_token.take() {
                    keys.discard_token(key_token);

                    if keys.is_empty() {
                        trace!("last waiter left the batch");
                    }
                }

                if let Some(waker_token) = self.waker_token.take() {
                    wakers.discard_and_wake(waker_token);
                }
            }
            State::Done(Ok(ref mut values)) => {
                // Drop our token from the ValueSet
                if let Some(key_token) = self.key_token.take() {
                    values.discard(key_token);
                }
            }
            State::Done(Err(..)) => {}
        }
    }
}
