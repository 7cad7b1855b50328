//! The push-update path: a long-lived registry of values published by an
//! out-of-process event source, shared by every request's
//! [`ScopedCacheLoader`](crate::ScopedCacheLoader).

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use arc_swap::ArcSwapOption;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("the subscription registry has been dropped")]
    Closed,
}

/// Handle given to a subscriber, used to post updates for any key. Updates
/// are queued and applied by the registry the next time it is read.
pub struct UpdateSender<Key, Value> {
    sender: UnboundedSender<(Key, Value)>,
}

impl<Key, Value> UpdateSender<Key, Value> {
    pub fn publish(&self, key: Key, value: Value) -> Result<(), PublishError> {
        self.sender
            .unbounded_send((key, value))
            .map_err(|_| PublishError::Closed)
    }
}

impl<Key, Value> Clone for UpdateSender<Key, Value> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Key, Value> Debug for UpdateSender<Key, Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSender")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

#[derive(Debug)]
struct PushSlot<Value> {
    subscribed: AtomicBool,
    value: ArcSwapOption<Value>,
}

impl<Value> Default for PushSlot<Value> {
    fn default() -> Self {
        Self {
            subscribed: AtomicBool::new(false),
            value: ArcSwapOption::empty(),
        }
    }
}

type Subscriber<Key, Value> = Box<dyn Fn(&Key, UpdateSender<Key, Value>) + Send + Sync>;

/// Process-wide registry of pushed values. Unlike the loaders, this outlives
/// any single request; share it with an `Arc`.
///
/// Entries are created on first use. The subscribe function is called at
/// most once per key for the registry's lifetime, no matter how many
/// requests or threads ask for that key.
pub struct SubscriptionRegistry<Key, Value> {
    subscriber: Subscriber<Key, Value>,
    entries: Mutex<HashMap<Key, Arc<PushSlot<Value>>>>,
    sender: UnboundedSender<(Key, Value)>,
    receiver: Mutex<UnboundedReceiver<(Key, Value)>>,
}

impl<Key, Value> Debug for SubscriptionRegistry<Key, Value>
where
    Key: Debug,
    Value: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriber", &"<closure>")
            .field("entries", &self.entries)
            .finish()
    }
}

impl<Key, Value> SubscriptionRegistry<Key, Value>
where
    Key: Clone + Eq + Hash,
{
    pub fn new(
        subscriber: impl Fn(&Key, UpdateSender<Key, Value>) + Send + Sync + 'static,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded();

        Self {
            subscriber: Box::new(subscriber),
            entries: Mutex::new(HashMap::new()),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    fn slot(&self, key: &Key) -> Arc<PushSlot<Value>> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(slot) => slot.clone(),
            None => entries.entry(key.clone()).or_default().clone(),
        }
    }

    /// A sender for publishing updates, independent of any subscription.
    pub fn sender(&self) -> UpdateSender<Key, Value> {
        UpdateSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to pushed updates for `key`, unless that already happened.
    /// Returns true if this call registered the subscription.
    pub fn subscribe(&self, key: &Key) -> bool {
        let slot = self.slot(key);

        if slot.subscribed.swap(true, Ordering::AcqRel) {
            return false;
        }

        // The entries lock isn't held here, so a subscriber may publish
        // synchronously.
        debug!("registering push subscription");
        (self.subscriber)(key, self.sender());
        true
    }

    pub fn is_subscribed(&self, key: &Key) -> bool {
        let entries = self.entries.lock().unwrap();

        entries
            .get(key)
            .map_or(false, |slot| slot.subscribed.load(Ordering::Acquire))
    }

    /// Move every queued update into its slot. Later updates for the same key
    /// overwrite earlier ones. Returns the number of updates applied.
    pub fn apply_pending_updates(&self) -> usize {
        let mut receiver = self.receiver.lock().unwrap();
        let mut applied = 0;

        // The registry holds a sender, so the channel never reports closed.
        while let Ok((key, value)) = receiver.try_recv() {
            self.slot(&key).value.store(Some(Arc::new(value)));
            applied += 1;
        }

        applied
    }

    /// The most recently pushed value for `key`, if any.
    pub fn latest(&self, key: &Key) -> Option<Arc<Value>> {
        self.apply_pending_updates();

        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|slot| slot.value.load_full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribes_once_per_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let registry: SubscriptionRegistry<&str, u32> = SubscriptionRegistry::new(move |_key, _tx| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.subscribe(&"user-1"));
        assert!(!registry.subscribe(&"user-1"));
        assert!(registry.subscribe(&"user-2"));
        assert!(registry.is_subscribed(&"user-1"));
        assert!(!registry.is_subscribed(&"user-3"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn latest_value_wins() {
        let registry: SubscriptionRegistry<&str, u32> = SubscriptionRegistry::new(|_key, _tx| {});
        let sender = registry.sender();

        assert_eq!(registry.latest(&"sensor"), None);

        sender.publish("sensor", 1).unwrap();
        sender.publish("sensor", 2).unwrap();
        sender.publish("other", 7).unwrap();

        assert_eq!(registry.latest(&"sensor").as_deref(), Some(&2));
        assert_eq!(registry.latest(&"other").as_deref(), Some(&7));
        assert_eq!(registry.apply_pending_updates(), 0);
    }

    #[test]
    fn publishing_after_drop_is_an_error() {
        let registry: SubscriptionRegistry<&str, u32> = SubscriptionRegistry::new(|_key, _tx| {});
        let sender = registry.sender();
        drop(registry);

        assert_eq!(sender.publish("sensor", 1), Err(PublishError::Closed));
    }
}
