//! Per-key change observer.

use super::subscriber::{ObserverDelegate, Subscriber};
use crate::connection::{ListenerRegistration, ModifiedListener, StoreConnection};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::types::{CollectionKey, ModifiedNotification};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle of an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverState {
    /// Snapshot live, listener registered.
    Active,
    /// Torn down. Nothing further is processed or delivered.
    Disposed,
}

struct SubscriberSlot<T> {
    /// Bumped on every replacement so a stale clear cannot remove a newer subscriber.
    generation: u64,
    subscriber: Option<Subscriber<T>>,
}

/// State shared between the observer handle and its queued jobs.
///
/// The store's registry and every queued job hold only `Weak` references.
struct Shared<T, C: StoreConnection> {
    identity: CollectionKey,
    connection: Arc<C>,
    dispatcher: Dispatcher,
    /// `None` once disposed.
    snapshot: Mutex<Option<C::Snapshot>>,
    disposed: AtomicBool,
    slot: Mutex<SubscriberSlot<T>>,
    weak_self: Weak<Self>,
}

impl<T, C> Shared<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: StoreConnection,
{
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Queue a snapshot advance on the background context.
    fn schedule_refresh(&self) {
        let weak = self.weak_self.clone();
        self.dispatcher.run_in_background(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.process_changes();
            }
        }));
    }

    /// Advance the snapshot and schedule delivery if the watched key changed.
    fn process_changes(&self) {
        if self.is_disposed() {
            return;
        }

        let mut guard = self.snapshot.lock();
        let Some(snapshot) = guard.as_mut() else {
            return;
        };

        let events = match self.connection.advance_snapshot(snapshot) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(
                    collection = %self.identity.collection,
                    key = %self.identity.key,
                    error = %e,
                    "failed to advance snapshot"
                );
                return;
            }
        };

        if events.is_empty() {
            return;
        }

        let affected = self.connection.change_events_affect(
            &events,
            &self.identity.collection,
            &self.identity.key,
        );
        if !affected {
            tracing::trace!(
                collection = %self.identity.collection,
                key = %self.identity.key,
                changes = events.len(),
                "changes do not touch watched key"
            );
            return;
        }

        tracing::debug!(
            collection = %self.identity.collection,
            key = %self.identity.key,
            changes = events.len(),
            "watched key changed"
        );

        // Scheduled under the snapshot lock so deliveries keep advance order.
        let weak = self.weak_self.clone();
        self.dispatcher.deliver(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.deliver();
            }
        }));
    }

    /// Runs on the delivery context.
    fn deliver(&self) {
        if self.is_disposed() {
            return;
        }

        let (generation, subscriber) = {
            let slot = self.slot.lock();
            match &slot.subscriber {
                Some(subscriber) => (slot.generation, subscriber.clone()),
                None => return,
            }
        };

        // The slot lock is released so the subscriber may replace itself.
        let keep = subscriber.notify(|| self.current_value());

        if !keep {
            let mut slot = self.slot.lock();
            if slot.generation == generation {
                slot.subscriber = None;
                tracing::debug!(
                    collection = %self.identity.collection,
                    key = %self.identity.key,
                    "subscriber gone, slot cleared"
                );
            }
        }
    }

    fn try_current_value(&self) -> Result<Option<T>> {
        self.connection
            .read(&self.identity.collection, &self.identity.key)?
            .map(|value| value.decode::<T>())
            .transpose()
    }

    fn current_value(&self) -> Option<T> {
        match self.try_current_value() {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(
                    collection = %self.identity.collection,
                    key = %self.identity.key,
                    error = %e,
                    "unreadable value treated as absent"
                );
                None
            }
        }
    }

    fn set_subscriber(&self, subscriber: Option<Subscriber<T>>) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.subscriber = subscriber;
    }

    /// Active -> Disposed. Returns false if already disposed.
    fn dispose(&self) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let snapshot = self.snapshot.lock().take();
        drop(snapshot);
        self.set_subscriber(None);

        tracing::debug!(
            collection = %self.identity.collection,
            key = %self.identity.key,
            "observer disposed"
        );
        true
    }
}

impl<T, C> ModifiedListener for Shared<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: StoreConnection,
{
    fn on_modified(&self, notification: &ModifiedNotification) {
        if self.is_disposed() {
            return;
        }
        tracing::trace!(
            store = %notification.store,
            sequence = %notification.sequence,
            collection = %self.identity.collection,
            key = %self.identity.key,
            "store modified"
        );
        self.schedule_refresh();
    }
}

/// Watches one `(collection, key)` record and reports each change.
///
/// The observer pins a long-lived snapshot on construction. Every commit to
/// the store advances that snapshot on the background context; when the
/// advanced changes include the watched key, the subscriber is notified on
/// the delivery context with the value read after the advance. Several
/// commits picked up by one advance produce one notification.
///
/// Dropping the observer (or calling [`close`](Self::close)) unregisters it
/// from the store and releases its snapshot. Notifications already queued
/// are discarded.
///
/// # Example
///
/// ```ignore
/// let store = MemoryStore::default();
/// let dispatcher = Dispatcher::spawn(DispatchConfig::default())?;
/// let observer: KeyObserver<User, _> =
///     KeyObserver::new("users", "42", store.connection(), dispatcher)?;
///
/// observer.set_callback(|user| println!("user 42 is now {:?}", user));
/// store.connection().set("users", "42", &User { name: "ada".into() })?;
/// ```
pub struct KeyObserver<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: StoreConnection,
{
    shared: Arc<Shared<T, C>>,
    _registration: ListenerRegistration<C>,
}

impl<T, C> KeyObserver<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: StoreConnection,
{
    /// Start observing `key` in `collection`.
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        connection: Arc<C>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let identity = CollectionKey::new(collection, key);
        CollectionKey::validate(&identity.collection, &identity.key)?;

        let snapshot = connection.begin_long_lived_snapshot()?;
        let shared = Arc::new_cyclic(|weak_self| Shared {
            identity,
            connection: Arc::clone(&connection),
            dispatcher,
            snapshot: Mutex::new(Some(snapshot)),
            disposed: AtomicBool::new(false),
            slot: Mutex::new(SubscriberSlot {
                generation: 0,
                subscriber: None,
            }),
            weak_self: weak_self.clone(),
        });

        let listener = Arc::downgrade(&shared) as Weak<dyn ModifiedListener>;
        let registration = ListenerRegistration::register(connection, listener);

        tracing::debug!(
            store = %shared.connection.store_id(),
            collection = %shared.identity.collection,
            key = %shared.identity.key,
            "observer started"
        );

        // Picks up commits that landed between snapshot start and registration.
        shared.schedule_refresh();

        Ok(Self {
            shared,
            _registration: registration,
        })
    }

    pub fn collection(&self) -> &str {
        &self.shared.identity.collection
    }

    pub fn key(&self) -> &str {
        &self.shared.identity.key
    }

    pub fn state(&self) -> ObserverState {
        if self.shared.is_disposed() {
            ObserverState::Disposed
        } else {
            ObserverState::Active
        }
    }

    /// Read the record now.
    ///
    /// Absent if the key is missing or its bytes do not decode as `T`; the
    /// two cases are not distinguished. Use
    /// [`try_current_value`](Self::try_current_value) to tell them apart.
    pub fn current_value(&self) -> Option<T> {
        self.shared.current_value()
    }

    /// Read the record now, reporting decode failures as
    /// [`StoreError::Deserialization`](crate::StoreError::Deserialization).
    pub fn try_current_value(&self) -> Result<Option<T>> {
        self.shared.try_current_value()
    }

    /// Report changes to `delegate`, held weakly. Replaces any subscriber.
    pub fn set_delegate<D: ObserverDelegate + 'static>(&self, delegate: &Arc<D>) {
        let weak = Arc::downgrade(delegate) as Weak<dyn ObserverDelegate>;
        self.set_subscriber(Subscriber::Delegate(weak));
    }

    /// Report changes by calling `callback` with the fresh value. Replaces
    /// any subscriber.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        self.set_subscriber(Subscriber::Callback(Arc::new(callback)));
    }

    /// Report changes on a bounded channel. Replaces any subscriber.
    ///
    /// Updates arriving while the channel is full are dropped; dropping the
    /// receiver clears the subscription. A `buffer_size` of 0 is treated as 1.
    pub fn subscribe(&self, buffer_size: usize) -> Receiver<Option<T>> {
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.set_subscriber(Subscriber::Channel(sender));
        receiver
    }

    pub fn set_subscriber(&self, subscriber: Subscriber<T>) {
        if self.shared.is_disposed() {
            return;
        }
        self.shared.set_subscriber(Some(subscriber));
    }

    pub fn clear_subscriber(&self) {
        self.shared.set_subscriber(None);
    }

    /// Tear down now. Same as dropping.
    pub fn close(self) {
        drop(self);
    }
}

impl<T, C> Drop for KeyObserver<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: StoreConnection,
{
    fn drop(&mut self) {
        // The registration field drops after this, unsubscribing from the store.
        self.shared.dispose();
    }
}

impl<T, C> fmt::Debug for KeyObserver<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: StoreConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyObserver")
            .field("collection", &self.collection())
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::StoreError;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    fn user(name: &str) -> User {
        User {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_new_rejects_empty_identity() {
        let store = MemoryStore::default();
        let (dispatcher, _bg, _main) = Dispatcher::manual();

        let result = KeyObserver::<User, _>::new("users", "", store.connection(), dispatcher);
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_identity_and_state() {
        let store = MemoryStore::default();
        let (dispatcher, _bg, _main) = Dispatcher::manual();

        let observer =
            KeyObserver::<User, _>::new("users", "42", store.connection(), dispatcher).unwrap();
        assert_eq!(observer.collection(), "users");
        assert_eq!(observer.key(), "42");
        assert_eq!(observer.state(), ObserverState::Active);
    }

    #[test]
    fn test_dispose_is_once() {
        let store = MemoryStore::default();
        let (dispatcher, _bg, _main) = Dispatcher::manual();

        let observer =
            KeyObserver::<User, _>::new("users", "42", store.connection(), dispatcher).unwrap();
        assert!(observer.shared.dispose());
        assert!(!observer.shared.dispose());
        assert_eq!(observer.state(), ObserverState::Disposed);
    }

    #[test]
    fn test_set_subscriber_after_dispose_is_ignored() {
        let store = MemoryStore::default();
        let (dispatcher, _bg, _main) = Dispatcher::manual();

        let observer =
            KeyObserver::<User, _>::new("users", "42", store.connection(), dispatcher).unwrap();
        observer.shared.dispose();
        observer.set_callback(|_| {});
        assert!(observer.shared.slot.lock().subscriber.is_none());
    }

    #[test]
    fn test_delegate_receives_update_without_value() {
        struct Counter(AtomicUsize);
        impl ObserverDelegate for Counter {
            fn on_object_updated(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let store = MemoryStore::default();
        let conn = store.connection();
        let (dispatcher, bg, main) = Dispatcher::manual();
        let observer =
            KeyObserver::<User, _>::new("users", "42", Arc::clone(&conn), dispatcher).unwrap();

        let delegate = Arc::new(Counter(AtomicUsize::new(0)));
        observer.set_delegate(&delegate);

        conn.set("users", "42", &user("ada")).unwrap();
        bg.run_pending();
        main.run_pending();

        assert_eq!(delegate.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_delegate_clears_slot() {
        struct Noop;
        impl ObserverDelegate for Noop {
            fn on_object_updated(&self) {}
        }

        let store = MemoryStore::default();
        let conn = store.connection();
        let (dispatcher, bg, main) = Dispatcher::manual();
        let observer =
            KeyObserver::<User, _>::new("users", "42", Arc::clone(&conn), dispatcher).unwrap();

        let delegate = Arc::new(Noop);
        observer.set_delegate(&delegate);
        drop(delegate);

        conn.set("users", "42", &user("ada")).unwrap();
        bg.run_pending();
        main.run_pending();

        assert!(observer.shared.slot.lock().subscriber.is_none());
    }

    #[test]
    fn test_replacing_subscriber() {
        let store = MemoryStore::default();
        let conn = store.connection();
        let (dispatcher, bg, main) = Dispatcher::manual();
        let observer =
            KeyObserver::<User, _>::new("users", "42", Arc::clone(&conn), dispatcher).unwrap();

        let first = observer.subscribe(4);
        let second = observer.subscribe(4);

        conn.set("users", "42", &user("ada")).unwrap();
        bg.run_pending();
        main.run_pending();

        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap(), Some(user("ada")));
    }
}
