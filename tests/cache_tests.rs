//! Tests for the per-scope memoizing loader, and its interaction with the
//! long-lived push registry.

use futures::{executor, future, future::LocalBoxFuture, FutureExt};
use futures_timer::Delay;
use std::{
    cell::OnceCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use trendloader::{
    LoadError, Loader, LoaderResult, ScopedCacheLoader, SubscriptionRegistry, UpdateSender,
};

#[test]
fn sequential_gets_fetch_once() {
    let calls = AtomicUsize::new(0);

    let loader = ScopedCacheLoader::new(|key: &u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok::<_, String>(Some(key * 2)))
    });

    assert!(loader.is_empty());
    assert_eq!(executor::block_on(loader.get(21)), Ok(Some(42)));
    assert_eq!(executor::block_on(loader.get(21)), Ok(Some(42)));

    assert!(loader.is_cached(&21));
    assert!(!loader.is_cached(&22));
    assert_eq!(loader.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_gets_share_a_pending_fetch() {
    let calls = AtomicUsize::new(0);

    let loader = ScopedCacheLoader::new(|key: &&'static str, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        let key = *key;

        async move {
            Delay::new(Duration::from_millis(5)).await;
            Ok::<_, String>(Some(format!("series for {}", key)))
        }
    });

    let results = executor::block_on(future::join_all(vec![
        loader.get("EQ1"),
        loader.get("EQ1"),
        loader.get("EQ2"),
        loader.get("EQ1"),
    ]));

    assert_eq!(
        results,
        [
            Ok(Some("series for EQ1".to_string())),
            Ok(Some("series for EQ1".to_string())),
            Ok(Some("series for EQ2".to_string())),
            Ok(Some("series for EQ1".to_string())),
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Spawn several threads that all request the same keys at once, and confirm
/// that each key was fetched exactly once
#[test]
fn threaded_gets_fetch_once() {
    let calls = AtomicUsize::new(0);
    let barrier = Barrier::new(8);

    let loader = ScopedCacheLoader::new(|key: &u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        let key = *key;

        async move {
            Delay::new(Duration::from_millis(5)).await;
            Ok::<_, String>(Some(key * 2))
        }
    });

    let loader_ref = &loader;
    let barrier_ref = &barrier;

    let results: Vec<u32> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..8)
            .map(move |i| {
                s.spawn(move |_s| {
                    barrier_ref.wait();
                    let fut = loader_ref.get(i % 2);
                    executor::block_on(fut).unwrap().unwrap()
                })
            })
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(results, [0, 2, 0, 2, 0, 2, 0, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(loader.len(), 2);
}

type Recurse = Box<dyn Fn(u32) -> LocalBoxFuture<'static, LoaderResult<u32, ()>>>;

#[test]
fn fetcher_may_load_from_its_own_loader() {
    let recurse: &'static OnceCell<Recurse> = Box::leak(Box::new(OnceCell::new()));

    // Each key's value is built from the previous key's, fetched through the
    // same loader while this fetch is being started.
    let loader = ScopedCacheLoader::new(move |key: &u32, _cancel: CancellationToken| {
        let previous = match *key {
            0 => None,
            key => recurse.get().map(|recurse| recurse(key - 1)),
        };

        async move {
            match previous {
                None => Ok(Some(0)),
                Some(previous) => previous
                    .await
                    .map(|value| value.map(|value| value + 1))
                    .map_err(|_err| ()),
            }
        }
    });
    let loader: &'static _ = Box::leak(Box::new(loader));

    let set = recurse.set(Box::new(move |key: u32| loader.get(key).boxed_local()));
    assert!(set.is_ok());

    assert_eq!(executor::block_on(loader.get(3)), Ok(Some(3)));
    assert_eq!(loader.len(), 4);
}

#[test]
fn errors_are_memoized() {
    let calls = AtomicUsize::new(0);

    let loader = ScopedCacheLoader::new(|_key: &u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Err::<Option<u32>, _>("offline"))
    });

    assert_eq!(executor::block_on(loader.get(1)), Err(LoadError::Fetch("offline")));
    assert_eq!(executor::block_on(loader.get(1)), Err(LoadError::Fetch("offline")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn absence_is_memoized() {
    let calls = AtomicUsize::new(0);

    let loader = ScopedCacheLoader::new(|_key: &u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok::<Option<u32>, ()>(None))
    });

    assert_eq!(executor::block_on(loader.get(7)), Ok(None));
    assert_eq!(executor::block_on(loader.load(7)), Ok(None));
    assert!(loader.is_cached(&7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn separate_scopes_fetch_separately() {
    let calls = AtomicUsize::new(0);
    let fetch = |key: &u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok::<_, ()>(Some(*key)))
    };

    let first = ScopedCacheLoader::new(&fetch);
    assert_eq!(executor::block_on(first.get(1)), Ok(Some(1)));
    drop(first);

    let second = ScopedCacheLoader::new(&fetch);
    assert_eq!(executor::block_on(second.get(1)), Ok(Some(1)));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn cancellation_abandons_pending_and_future_fetches() {
    let cancel = CancellationToken::new();

    let loader = ScopedCacheLoader::with_cancellation(
        |_key: &u32, _cancel: CancellationToken| future::pending::<Result<Option<u32>, ()>>(),
        cancel.clone(),
    );

    let (result, ()) = executor::block_on(future::join(loader.get(1), async {
        Delay::new(Duration::from_millis(5)).await;
        cancel.cancel();
    }));

    assert_eq!(result, Err(LoadError::Cancelled));

    // The cancelled slot stays cancelled, and new keys are cancelled too
    assert_eq!(executor::block_on(loader.get(1)), Err(LoadError::Cancelled));
    assert_eq!(executor::block_on(loader.get(2)), Err(LoadError::Cancelled));
}

#[test]
fn fetcher_sees_the_scope_token() {
    let loader = ScopedCacheLoader::new(|_key: &u32, cancel: CancellationToken| {
        future::ready(Ok::<_, ()>(Some(cancel.is_cancelled())))
    });

    assert_eq!(executor::block_on(loader.get(1)), Ok(Some(false)));
    assert!(!loader.cancellation().is_cancelled());
}

fn counting_registry(
    subscriptions: Arc<AtomicUsize>,
    pushed: Option<u32>,
) -> Arc<SubscriptionRegistry<&'static str, u32>> {
    Arc::new(SubscriptionRegistry::new(
        move |key: &&'static str, updates: UpdateSender<&'static str, u32>| {
            subscriptions.fetch_add(1, Ordering::SeqCst);

            if let Some(value) = pushed {
                updates.publish(*key, value).unwrap();
            }
        },
    ))
}

#[test]
fn pushed_values_are_served_without_fetching() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let registry = counting_registry(subscriptions.clone(), Some(99));
    let fetches = AtomicUsize::new(0);

    let fetch = |_key: &&'static str, _cancel: CancellationToken| {
        fetches.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok::<_, ()>(Some(0)))
    };

    // Two request scopes sharing the registry
    let first = ScopedCacheLoader::new(&fetch).with_subscriptions(registry.clone());
    assert_eq!(executor::block_on(first.get("user-1")), Ok(Some(99)));

    let second = ScopedCacheLoader::new(&fetch).with_subscriptions(registry.clone());
    assert_eq!(executor::block_on(second.get("user-1")), Ok(Some(99)));

    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert!(!second.is_cached(&"user-1"));
}

#[test]
fn pushes_after_a_settled_fetch_are_seen_in_the_same_scope() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let registry = counting_registry(subscriptions.clone(), None);
    let fetches = AtomicUsize::new(0);

    let loader = ScopedCacheLoader::new(|_key: &&'static str, _cancel: CancellationToken| {
        fetches.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok::<_, ()>(Some(1)))
    })
    .with_subscriptions(registry.clone());

    assert_eq!(executor::block_on(loader.get("user-1")), Ok(Some(1)));
    assert!(loader.is_cached(&"user-1"));

    registry.sender().publish("user-1", 5).unwrap();
    assert_eq!(executor::block_on(loader.get("user-1")), Ok(Some(5)));

    registry.sender().publish("user-1", 6).unwrap();
    assert_eq!(executor::block_on(loader.get("user-1")), Ok(Some(6)));

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
}

/// Many threads racing to subscribe to the same keys still subscribe once
/// per key
#[test]
fn threaded_subscriptions_happen_once_per_key() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let registry = counting_registry(subscriptions.clone(), Some(7));
    let barrier = Barrier::new(8);

    let registry_ref = &registry;
    let barrier_ref = &barrier;

    let registered: usize = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..8)
            .map(move |i| {
                s.spawn(move |_s| {
                    let key = if i % 2 == 0 { "user-1" } else { "user-2" };
                    barrier_ref.wait();
                    registry_ref.subscribe(&key) as usize
                })
            })
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).sum()
    })
    .unwrap();

    assert_eq!(registered, 2);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
    assert_eq!(registry.latest(&"user-1").as_deref(), Some(&7));
    assert_eq!(registry.latest(&"user-2").as_deref(), Some(&7));
}

#[test]
fn keys_without_pushed_values_are_fetched() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let registry = counting_registry(subscriptions.clone(), None);

    let fetch = |_key: &&'static str, _cancel: CancellationToken| {
        future::ready(Ok::<_, ()>(Some(1)))
    };

    let first = ScopedCacheLoader::new(&fetch).with_subscriptions(registry.clone());
    assert_eq!(executor::block_on(first.get("user-1")), Ok(Some(1)));
    assert!(registry.is_subscribed(&"user-1"));

    // An update arrives between requests; the next scope sees it
    registry.sender().publish("user-1", 5).unwrap();

    let second = ScopedCacheLoader::new(&fetch).with_subscriptions(registry.clone());
    assert_eq!(executor::block_on(second.get("user-1")), Ok(Some(5)));

    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
}
