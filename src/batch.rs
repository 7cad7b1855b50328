use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use crate::{
    data::{KeySet, Token as KeyToken, ValueSet},
    result::{LoadError, Loader, LoaderResult},
    scheduler::BatchScheduler,
    wakerset::{Token as WakerToken, WakerSet},
};

struct AccumulatingState<'a, Key: Eq + Hash, Batcher, Window> {
    keys: KeySet<Key>,
    batcher: &'a Batcher,
    window: Option<Pin<Box<Window>>>,
    wakers: WakerSet,
}

impl<'a, Key, Batcher, Window> Debug for AccumulatingState<'a, Key, Batcher, Window>
where
    Key: Debug + Hash + Eq,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("batcher", &"<closure>")
            .field("window_open", &self.window.is_some())
            .field("wakers", &self.wakers)
            .finish()
    }
}

// Only one task needs to drive the batch function. When that task's future
// is dropped, another waiting task is woken to take over; when the batch
// completes, every task is woken.
struct RunningState<Fut> {
    fut: Pin<Box<Fut>>,
    wakers: WakerSet,
    dropped_tokens: Vec<KeyToken>,
}

impl<Fut> Debug for RunningState<Fut> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningState")
            .field("fut", &"<future>")
            .field("wakers", &self.wakers)
            .field("dropped_tokens", &self.dropped_tokens)
            .finish()
    }
}

enum Stage<'a, Key: Hash + Eq, Value, Error, Fut, Batcher, Window> {
    Accum(AccumulatingState<'a, Key, Batcher, Window>),
    Running(RunningState<Fut>),
    Done(Result<ValueSet<Value, Error>, LoadError<Error>>),
}

struct State<'a, Key: Hash + Eq, Value, Error, Fut, Batcher, Window> {
    stage: Stage<'a, Key, Value, Error, Fut, Batcher, Window>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

/// The configuration of a [`BatchController`]: the batch function, the
/// window policy, and an optional cap on distinct keys per batch.
///
/// The batch function is called with the deduplicated keys of one batch and
/// the controller's cancellation token. A request-level failure should be
/// returned as `Err`, which fails every load in the batch; per-key failures
/// can be reported with [`KeySet::results_from_pairs`].
#[derive(Debug, Clone, Default)]
pub struct BatchRules<Batcher, Scheduler> {
    pub batcher: Batcher,
    pub window: Scheduler,
    pub max_keys: Option<NonZeroUsize>,
}

/// The keyed batch loader. Create one per logical request (it borrows its
/// [`BatchRules`]), share it by reference with everything resolving data for
/// that request, and call [`load`](BatchController::load) once per key.
pub struct BatchController<'a, Key, Value, Error, Fut, Batcher, Scheduler>
where
    Key: Hash + Eq,
    Scheduler: BatchScheduler,
{
    rules: &'a BatchRules<Batcher, Scheduler>,
    cancel: CancellationToken,

    // TODO: use arc_swap instead of Mutex<Weak<...>>. The inner mutex should ensure
    // that we can respect our invariants, so it seems like it's mostly a
    // matter of a retry loop?
    #[allow(clippy::type_complexity)]
    state: Mutex<Weak<Mutex<State<'a, Key, Value, Error, Fut, Batcher, Scheduler::Window>>>>,
}

impl<'a, Key, Value, Error, Fut, Batcher, Scheduler>
    BatchController<'a, Key, Value, Error, Fut, Batcher, Scheduler>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Scheduler: BatchScheduler,
    Batcher: Fn(KeySet<Key>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value, Error>, Error>>,
{
    pub fn new(rules: &'a BatchRules<Batcher, Scheduler>) -> Self {
        Self::with_cancellation(rules, CancellationToken::new())
    }

    /// Create a controller whose batches are all abandoned when `cancel` is
    /// cancelled. Cancellation is batch-wide: every load sharing a batch
    /// resolves to [`LoadError::Cancelled`].
    pub fn with_cancellation(
        rules: &'a BatchRules<Batcher, Scheduler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rules,
            cancel,
            state: Mutex::new(Weak::new()),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn load(
        &self,
        key: Key,
    ) -> BatchFuture<'a, Key, Value, Error, Fut, Batcher, Scheduler::Window> {
        let mut guard = self.state.lock().unwrap();

        // If there is an existing state, and it's still in the accum state,
        // add a new key to it. Note that at no point do we check the timing;
        // we assume that if our window has closed, a future poll will
        // advance the state to Running.
        //
        // If any of these conditions are not true, we instead create a brand
        // new state.
        if let Some(state_handle) = guard.upgrade() {
            let mut state_guard_result = state_handle.lock();
            if let Ok(ref mut state_guard) = state_guard_result {
                if let Stage::Accum(ref mut accum) = state_guard.stage {
                    let key_token = accum.keys.add_key(key);

                    // If we've hit the key limit:
                    // - Close the window
                    // - Initiate a poll
                    // - Detach the shared state from the controller
                    match self.rules.max_keys {
                        Some(max_keys) if accum.keys.len() >= max_keys.get() => {
                            accum.window = None;
                            accum.wakers.wake_driver();
                            drop(state_guard_result);
                            *guard = Weak::new();
                        }
                        _ => drop(state_guard_result),
                    }

                    return BatchFuture {
                        key_token,
                        waker_token: None,
                        state: Some(state_handle),
                    };
                }
            }
        }

        let mut keys = KeySet::new();
        let key_token = keys.add_key(key);

        let unbatched = matches!(self.rules.max_keys, Some(max_keys) if max_keys.get() <= 1);
        let window = if unbatched {
            None
        } else {
            Some(Box::pin(self.rules.window.open_window()))
        };

        let state = Arc::new(Mutex::new(State {
            stage: Stage::Accum(AccumulatingState {
                keys,
                batcher: &self.rules.batcher,
                window,
                wakers: WakerSet::default(),
            }),
            cancel: self.cancel.clone(),
            cancelled: Box::pin(self.cancel.clone().cancelled_owned()),
        }));

        if !unbatched {
            *guard = Arc::downgrade(&state);
        }

        BatchFuture {
            key_token,
            waker_token: None,
            state: Some(state),
        }
    }
}

impl<'a, Key, Value, Error, Fut, Batcher, Scheduler> Loader<Key>
    for BatchController<'a, Key, Value, Error, Fut, Batcher, Scheduler>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Scheduler: BatchScheduler,
    Batcher: Fn(KeySet<Key>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value, Error>, Error>>,
{
    type Value = Value;
    type Error = Error;
    type Future = BatchFuture<'a, Key, Value, Error, Fut, Batcher, Scheduler::Window>;

    #[inline]
    fn load(&self, key: Key) -> Self::Future {
        BatchController::load(self, key)
    }
}

/// A request for a single key, sharing a batch with every other load issued
/// during the same window. Resolves to the result for exactly its own key.
///
/// Invariant: in order for this future to exist, its key must have been added
/// to the state.
pub struct BatchFuture<'a, Key: Hash + Eq, Value, Error, Fut, Batcher, Window> {
    key_token: KeyToken,
    waker_token: Option<WakerToken>,

    // TODO: find a good way to rewrite this type so that this lint passes
    #[allow(clippy::type_complexity)]
    state: Option<Arc<Mutex<State<'a, Key, Value, Error, Fut, Batcher, Window>>>>,
}

impl<'a, Key, Value, Error, Fut, Batcher, Window> Future
    for BatchFuture<'a, Key, Value, Error, Fut, Batcher, Window>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Window: Future<Output = ()>,
    Batcher: Fn(KeySet<Key>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value, Error>, Error>>,
{
    type Output = LoaderResult<Value, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        // Note about this mutex: it is safe to use in an async context,
        // because the lock is released when poll returns (it isn't held
        // between polls).
        let mut guard = unpinned
            .state
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture")
            .lock()
            // If a *different* poll panicked while holding the lock, the
            // mutex is poisoned and this poll panics too.
            .unwrap();

        let state = &mut *guard;

        // Cancellation abandons the whole batch, whichever stage it's in.
        let settled = matches!(state.stage, Stage::Done(..));
        if !settled && state.cancelled.as_mut().poll(ctx).is_ready() {
            let cancelled = Stage::Done(Err(LoadError::Cancelled));
            let wakers = match mem::replace(&mut state.stage, cancelled) {
                Stage::Accum(accum) => accum.wakers,
                Stage::Running(running) => running.wakers,
                Stage::Done(..) => unreachable!("BatchFuture contained invalid state"),
            };

            debug!("batch cancelled before completion");
            wakers.finish(unpinned.waker_token.take());
        }

        if let Stage::Accum(ref mut accum) = state.stage {
            if let Some(window) = accum.window.as_mut() {
                // Only the driver polls the window. Other waiters are woken
                // when the batch completes, or when the driver is dropped and
                // one of them has to take over.
                let driving = accum
                    .wakers
                    .register_waiter(&mut unpinned.waker_token, ctx.waker());

                if !driving || window.as_mut().poll(ctx).is_pending() {
                    return Poll::Pending;
                }
            }

            // Window is closed. Transition to the Running state.
            let wakers = mem::take(&mut accum.wakers);
            let keyset = accum.keys.take();
            let batcher = accum.batcher;

            debug!(keys = keyset.len(), "dispatching batch");
            let fut = batcher(keyset, state.cancel.clone());

            state.stage = Stage::Running(RunningState {
                fut: Box::pin(fut),
                wakers,
                dropped_tokens: Vec::new(),
            });
        }

        if let Stage::Running(ref mut running) = state.stage {
            let result = match running.fut.as_mut().poll(ctx) {
                Poll::Pending => {
                    // This is now the driving waker for the batch function.
                    running.wakers.register(&mut unpinned.waker_token, ctx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(result) => result.map_err(LoadError::Fetch),
            };

            let mut result = result;
            match result {
                // Some futures may have lost interest while we were in the
                // Running state. Remove those tokens from the ValueSet.
                Ok(ref mut values) => running
                    .dropped_tokens
                    .iter()
                    .for_each(|&token| values.discard(token)),
                Err(..) => warn!("batch fetch failed; every load in the batch will fail"),
            }

            // Now that we have a result, signal all the waiting futures to
            // wake up so they can get their results. We're about to grab our
            // own result, so we don't need to wake ourself.
            mem::take(&mut running.wakers).finish(unpinned.waker_token.take());

            state.stage = Stage::Done(result);
        }

        let output = match state.stage {
            Stage::Done(Ok(ref mut values)) => values
                .take(unpinned.key_token)
                .transpose()
                .map_err(LoadError::Fetch),
            Stage::Done(Err(ref err)) => Err(err.clone()),
            _ => unreachable!("BatchFuture contained invalid state"),
        };

        drop(guard);
        unpinned.state = None;
        Poll::Ready(output)
    }
}

impl<'a, Key: Hash + Eq, Value, Error, Fut, Batcher, Window> Drop
    for BatchFuture<'a, Key, Value, Error, Fut, Batcher, Window>
{
    fn drop(&mut self) {
        // The shared batch is only ever driven by a single task, so if we
        // were the driver, another task has to be woken to take over. This
        // is mostly handled by the WakerSet type.
        //
        // We don't do any cleanup if the mutex is poisoned; the crate is
        // built with panic=abort, so that shouldn't be possible.
        if let Some(state) = self.state.as_ref() {
            if let Ok(mut guard) = state.lock() {
                match guard.stage {
                    Stage::Accum(ref mut accum) => {
                        if let Some(waker_token) = self.waker_token.take() {
                            accum.wakers.discard_and_wake(waker_token);
                        }

                        accum.keys.discard_token(self.key_token);
                    }
                    Stage::Running(ref mut running) => {
                        if let Some(waker_token) = self.waker_token.take() {
                            running.wakers.discard_and_wake(waker_token);
                        }

                        // The KeySet is frozen (owned by the executing
                        // future). Remember our token so that it can be
                        // discarded from the ValueSet when it's ready.
                        running.dropped_tokens.push(self.key_token);
                    }
                    Stage::Done(Ok(ref mut values)) => values.discard(self.key_token),
                    Stage::Done(Err(..)) => {}
                }
            }
        }
    }
}
