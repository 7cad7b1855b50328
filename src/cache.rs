//! Per-key memoizing loader, scoped to one logical request.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::future::{FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    cancel::Cancellable,
    result::{Loader, LoaderResult},
    subscription::SubscriptionRegistry,
};

/// A loader that fetches each key at most once for its whole lifetime.
///
/// The first `get` for a key creates a slot and starts the fetch; every later
/// or concurrent `get` for that key awaits the same slot, whether it is still
/// pending or already settled. Errors are memoized the same way values are.
/// Drop the loader when the request completes; nothing is shared across
/// loaders except an attached [`SubscriptionRegistry`].
pub struct ScopedCacheLoader<Key, Value, Error, Fut, Fetcher>
where
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    fetcher: Arc<Fetcher>,
    cancel: CancellationToken,
    slots: Mutex<HashMap<Key, Slot<Key, Fetcher, Fut>>>,
    pushed: Option<Arc<SubscriptionRegistry<Key, Value>>>,
}

type Slot<Key, Fetcher, Fut> = Shared<Cancellable<DeferredFetch<Key, Fetcher, Fut>>>;

impl<Key, Value, Error, Fut, Fetcher> Debug for ScopedCacheLoader<Key, Value, Error, Fut, Fetcher>
where
    Key: Debug,
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock().unwrap();

        f.debug_struct("ScopedCacheLoader")
            .field("fetcher", &"<closure>")
            .field("slots", &slots.keys().collect::<Vec<_>>())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("pushed", &self.pushed.is_some())
            .finish()
    }
}

impl<Key, Value, Error, Fut, Fetcher> ScopedCacheLoader<Key, Value, Error, Fut, Fetcher>
where
    Key: Clone + Eq + Hash,
    Value: Clone,
    Error: Clone,
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    pub fn new(fetcher: Fetcher) -> Self {
        Self::with_cancellation(fetcher, CancellationToken::new())
    }

    /// Create a loader whose fetches resolve to
    /// [`LoadError::Cancelled`](crate::LoadError::Cancelled) once `cancel`
    /// is cancelled. A cancelled slot stays cancelled for the rest of the
    /// scope.
    pub fn with_cancellation(fetcher: Fetcher, cancel: CancellationToken) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            cancel,
            slots: Mutex::new(HashMap::new()),
            pushed: None,
        }
    }

    /// Serve pushed values from `registry` ahead of fetching. The first `get`
    /// for each key subscribes to it, if no earlier request already did.
    pub fn with_subscriptions(mut self, registry: Arc<SubscriptionRegistry<Key, Value>>) -> Self {
        self.pushed = Some(registry);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn get(&self, key: Key) -> CacheFuture<Key, Value, Error, Fut, Fetcher> {
        if let Some(registry) = self.pushed.as_ref() {
            registry.subscribe(&key);

            if let Some(value) = registry.latest(&key) {
                trace!("serving pushed value");
                return CacheFuture {
                    inner: Inner::Pushed(Some(Value::clone(&value))),
                };
            }
        }

        // The slot is created under the lock, so concurrent first requests
        // for a key can't both start a fetch. The fetcher itself only runs
        // when the slot is first polled, after the lock is released.
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .entry(key)
            .or_insert_with_key(|key| {
                let fetch = DeferredFetch {
                    start: Some((self.fetcher.clone(), key.clone(), self.cancel.clone())),
                    fut: None,
                };

                Cancellable::new(fetch, self.cancel.clone()).shared()
            })
            .clone();

        CacheFuture {
            inner: Inner::Slot(slot),
        }
    }

    /// Check if a slot (pending or settled) exists for this key.
    pub fn is_cached(&self, key: &Key) -> bool {
        self.slots.lock().unwrap().contains_key(key)
    }

    /// Number of keys fetched (or being fetched) in this scope.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Key, Value, Error, Fut, Fetcher> Loader<Key>
    for ScopedCacheLoader<Key, Value, Error, Fut, Fetcher>
where
    Key: Clone + Eq + Hash,
    Value: Clone,
    Error: Clone,
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    type Value = Value;
    type Error = Error;
    type Future = CacheFuture<Key, Value, Error, Fut, Fetcher>;

    #[inline]
    fn load(&self, key: Key) -> Self::Future {
        self.get(key)
    }
}

/// The fetch behind a cache slot. The fetcher is called on first poll, so
/// that user code never runs while the slot map is locked.
struct DeferredFetch<Key, Fetcher, Fut> {
    start: Option<(Arc<Fetcher>, Key, CancellationToken)>,
    fut: Option<Pin<Box<Fut>>>,
}

impl<Key, Fetcher, Fut> Unpin for DeferredFetch<Key, Fetcher, Fut> {}

impl<Key, Value, Error, Fetcher, Fut> Future for DeferredFetch<Key, Fetcher, Fut>
where
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    type Output = Result<Option<Value>, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some((fetcher, key, cancel)) = this.start.take() {
            debug!("starting fetch for uncached key");
            this.fut = Some(Box::pin(fetcher(&key, cancel)));
        }

        this.fut
            .as_mut()
            .expect("Can't re-poll a completed DeferredFetch")
            .as_mut()
            .poll(ctx)
    }
}

enum Inner<Key, Value, Error, Fut, Fetcher>
where
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    Pushed(Option<Value>),
    Slot(Slot<Key, Fetcher, Fut>),
}

/// The future returned by [`ScopedCacheLoader::get`].
pub struct CacheFuture<Key, Value, Error, Fut, Fetcher>
where
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    inner: Inner<Key, Value, Error, Fut, Fetcher>,
}

// The pushed value is never pinned, and Shared is Unpin.
impl<Key, Value, Error, Fut, Fetcher> Unpin for CacheFuture<Key, Value, Error, Fut, Fetcher>
where
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
}

impl<Key, Value, Error, Fut, Fetcher> Future for CacheFuture<Key, Value, Error, Fut, Fetcher>
where
    Value: Clone,
    Error: Clone,
    Fetcher: Fn(&Key, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    type Output = LoaderResult<Value, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Pushed(value) => Poll::Ready(Ok(Some(
                value
                    .take()
                    .expect("Can't re-poll a completed CacheFuture"),
            ))),
            Inner::Slot(slot) => slot.poll_unpin(ctx),
        }
    }
}
