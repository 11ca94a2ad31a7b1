//! In-process key-value document store with long-lived snapshots.
//!
//! `MemoryStore` is a volatile reference implementation of
//! [`StoreConnection`]: a map of collections to keys, a commit head, a change
//! log kept only as far back as the oldest pinned snapshot, and a per-store
//! listener registry notified after every commit.

use crate::connection::{ListenerToken, ModifiedListener, StoreConnection};
use crate::error::{Result, StoreError};
use crate::listeners::ListenerRegistry;
use crate::transaction::{ReadTransaction, WriteTransaction};
use crate::types::{
    ChangeEvent, ModifiedNotification, PayloadEncoding, Sequence, StoreId, StoreStats, StoredValue,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Name used in log output.
    pub name: String,

    /// Encoding used by [`WriteTransaction::set`].
    pub default_encoding: PayloadEncoding,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            default_encoding: PayloadEncoding::Json,
        }
    }
}

/// Committed data plus the change log.
#[derive(Default)]
pub(crate) struct StoreState {
    pub(crate) head: Sequence,
    pub(crate) collections: HashMap<String, HashMap<String, StoredValue>>,
    /// Ordered by sequence, oldest first.
    pub(crate) changes: VecDeque<ChangeEvent>,
}

struct StoreInner {
    id: StoreId,
    config: StoreConfig,
    state: RwLock<StoreState>,
    /// Pinned snapshot versions and how many snapshots hold each.
    pins: Mutex<BTreeMap<Sequence, usize>>,
    /// Serializes write transactions.
    write_lock: Mutex<()>,
    listeners: ListenerRegistry,
}

impl StoreInner {
    fn pin(pins: &mut BTreeMap<Sequence, usize>, version: Sequence) {
        *pins.entry(version).or_insert(0) += 1;
    }

    fn unpin(pins: &mut BTreeMap<Sequence, usize>, version: Sequence) {
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
            }
        }
    }

    /// Drop change events no pinned snapshot can still ask for.
    fn compact(&self) {
        let mut state = self.state.write();
        let pins = self.pins.lock();
        let floor = pins.keys().next().copied().unwrap_or(state.head);
        while state
            .changes
            .front()
            .map_or(false, |event| event.sequence() <= floor)
        {
            state.changes.pop_front();
        }
    }

    /// Apply staged operations as one commit. Returns the new head, or None
    /// if there was nothing to commit.
    fn commit(&self, txn: WriteTransaction) -> Option<Sequence> {
        let ops = txn.into_ops();
        if ops.is_empty() {
            return None;
        }

        let op_count = ops.len();
        let sequence = {
            let mut state = self.state.write();
            let sequence = state.head.next();
            let mut event = ChangeEvent::new(sequence);
            for op in ops {
                op.apply(&mut state, &mut event);
            }
            state.head = sequence;
            state.changes.push_back(event);
            sequence
        };
        self.compact();

        tracing::debug!(
            store = %self.config.name,
            sequence = %sequence,
            operations = op_count,
            "committed write transaction"
        );
        Some(sequence)
    }
}

/// The in-process store.
///
/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        let inner = StoreInner {
            id: StoreId::next(),
            config,
            state: RwLock::new(StoreState::default()),
            pins: Mutex::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
            listeners: ListenerRegistry::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Open a connection. Connections are shared between observers.
    pub fn connection(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Sequence of the latest commit.
    pub fn head(&self) -> Sequence {
        self.inner.state.read().head
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.read();
        let pins = self.inner.pins.lock();
        StoreStats {
            head: state.head,
            collections: state.collections.len(),
            keys: state.collections.values().map(HashMap::len).sum(),
            retained_changes: state.changes.len(),
            pinned_snapshots: pins.values().sum(),
            listeners: self.inner.listeners.len(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// A long-lived read snapshot pinned at one commit.
///
/// Dropping it releases the pin so older change events can be discarded.
pub struct MemorySnapshot {
    store: Weak<StoreInner>,
    version: Sequence,
}

impl MemorySnapshot {
    /// The commit this snapshot currently reflects.
    pub fn version(&self) -> Sequence {
        self.version
    }
}

impl Drop for MemorySnapshot {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            StoreInner::unpin(&mut inner.pins.lock(), self.version);
            inner.compact();
        }
    }
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    inner: Arc<StoreInner>,
}

impl MemoryConnection {
    /// Run `f` against a consistent view of the latest commit.
    pub fn read_with<R>(&self, f: impl FnOnce(&ReadTransaction<'_>) -> R) -> R {
        let state = self.inner.state.read();
        f(&ReadTransaction::new(&state))
    }

    /// Run a write transaction.
    ///
    /// Staged operations are applied atomically when `f` returns `Ok`. An
    /// error discards them. Listeners are notified after the commit, outside
    /// the store's locks.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTransaction) -> Result<R>) -> Result<R> {
        self.write_committed(f).map(|(_, result)| result)
    }

    /// Write one value with the store's default encoding, returning its commit.
    pub fn set<T: serde::Serialize + ?Sized>(
        &self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<Sequence> {
        let (sequence, ()) = self.write_committed(|txn| txn.set(collection, key, value))?;
        Ok(sequence.unwrap_or_default())
    }

    /// Remove one key, returning its commit.
    pub fn remove(&self, collection: &str, key: &str) -> Result<Sequence> {
        let (sequence, ()) = self.write_committed(|txn| txn.remove(collection, key))?;
        Ok(sequence.unwrap_or_default())
    }

    fn write_committed<R>(
        &self,
        f: impl FnOnce(&mut WriteTransaction) -> Result<R>,
    ) -> Result<(Option<Sequence>, R)> {
        let (sequence, result) = {
            let _lock = self.inner.write_lock.lock();
            let mut txn = WriteTransaction::new(self.inner.config.default_encoding);
            let result = f(&mut txn)?;
            (self.inner.commit(txn), result)
        };

        if let Some(sequence) = sequence {
            let notification = ModifiedNotification {
                store: self.inner.id,
                sequence,
            };
            let notified = self.inner.listeners.notify(&notification);
            tracing::trace!(
                store = %self.inner.config.name,
                sequence = %sequence,
                listeners = notified,
                "modification delivered to listeners"
            );
        }
        Ok((sequence, result))
    }

    fn owns(&self, snapshot: &MemorySnapshot) -> bool {
        std::ptr::eq(snapshot.store.as_ptr(), Arc::as_ptr(&self.inner))
    }
}

impl StoreConnection for MemoryConnection {
    type Snapshot = MemorySnapshot;
    type ChangeEvent = ChangeEvent;

    fn store_id(&self) -> StoreId {
        self.inner.id
    }

    fn begin_long_lived_snapshot(&self) -> Result<MemorySnapshot> {
        let state = self.inner.state.read();
        StoreInner::pin(&mut self.inner.pins.lock(), state.head);
        Ok(MemorySnapshot {
            store: Arc::downgrade(&self.inner),
            version: state.head,
        })
    }

    fn advance_snapshot(&self, snapshot: &mut MemorySnapshot) -> Result<Vec<ChangeEvent>> {
        if !self.owns(snapshot) {
            return Err(StoreError::Transaction(
                "snapshot belongs to a different store".into(),
            ));
        }

        let events = {
            let state = self.inner.state.read();
            if state.head == snapshot.version {
                return Ok(Vec::new());
            }

            let events: Vec<ChangeEvent> = state
                .changes
                .iter()
                .filter(|event| event.sequence() > snapshot.version)
                .cloned()
                .collect();

            let mut pins = self.inner.pins.lock();
            StoreInner::unpin(&mut pins, snapshot.version);
            StoreInner::pin(&mut pins, state.head);
            snapshot.version = state.head;
            events
        };
        self.inner.compact();

        Ok(events)
    }

    fn change_events_affect(&self, events: &[ChangeEvent], collection: &str, key: &str) -> bool {
        events.iter().any(|event| event.touches(collection, key))
    }

    fn read(&self, collection: &str, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.read_with(|txn| txn.get(collection, key).cloned()))
    }

    fn subscribe_modified(&self, listener: Weak<dyn ModifiedListener>) -> ListenerToken {
        self.inner.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, token: ListenerToken) {
        self.inner.listeners.unsubscribe(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ListenerRegistration;
    use serde_json::json;

    #[test]
    fn test_write_and_read() {
        let store = MemoryStore::default();
        let conn = store.connection();

        let seq = conn.set("users", "42", &json!({"name": "ada"})).unwrap();
        assert_eq!(seq, Sequence(1));

        let value = conn.read("users", "42").unwrap().unwrap();
        let decoded: serde_json::Value = value.decode().unwrap();
        assert_eq!(decoded["name"], "ada");

        assert!(conn.read("users", "43").unwrap().is_none());
    }

    #[test]
    fn test_write_transaction_is_atomic() {
        let store = MemoryStore::default();
        let conn = store.connection();

        let result: Result<()> = conn.write(|txn| {
            txn.set("users", "1", &1)?;
            txn.set("users", "2", &2)?;
            Err(StoreError::Transaction("abort".into()))
        });
        assert!(matches!(result, Err(StoreError::Transaction(_))));

        assert_eq!(store.head(), Sequence(0));
        assert!(conn.read("users", "1").unwrap().is_none());
    }

    #[test]
    fn test_empty_write_commits_nothing() {
        let store = MemoryStore::default();
        let conn = store.connection();

        conn.write(|_| Ok(())).unwrap();
        assert_eq!(store.head(), Sequence(0));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let store = MemoryStore::default();
        let conn = store.connection();

        assert!(matches!(
            conn.set("users", "", &1),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            conn.set("", "42", &1),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_snapshot_advance_returns_changes_since() {
        let store = MemoryStore::default();
        let conn = store.connection();

        let mut snapshot = conn.begin_long_lived_snapshot().unwrap();
        assert!(conn.advance_snapshot(&mut snapshot).unwrap().is_empty());

        conn.set("users", "42", &1).unwrap();
        conn.set("users", "43", &2).unwrap();

        let events = conn.advance_snapshot(&mut snapshot).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence(), Sequence(1));
        assert_eq!(events[1].sequence(), Sequence(2));
        assert_eq!(snapshot.version(), Sequence(2));

        assert!(conn.change_events_affect(&events, "users", "42"));
        assert!(conn.change_events_affect(&events, "users", "43"));
        assert!(!conn.change_events_affect(&events, "users", "44"));

        // Nothing new since the last advance.
        assert!(conn.advance_snapshot(&mut snapshot).unwrap().is_empty());
    }

    #[test]
    fn test_change_log_compaction_follows_pins() {
        let store = MemoryStore::default();
        let conn = store.connection();

        // No snapshots: nothing retained.
        conn.set("users", "1", &1).unwrap();
        assert_eq!(store.stats().retained_changes, 0);

        let mut old = conn.begin_long_lived_snapshot().unwrap();
        let mut recent = conn.begin_long_lived_snapshot().unwrap();
        assert_eq!(store.stats().pinned_snapshots, 2);

        conn.set("users", "2", &2).unwrap();
        conn.set("users", "3", &3).unwrap();
        assert_eq!(store.stats().retained_changes, 2);

        assert_eq!(conn.advance_snapshot(&mut recent).unwrap().len(), 2);
        // `old` still needs both events.
        assert_eq!(store.stats().retained_changes, 2);

        assert_eq!(conn.advance_snapshot(&mut old).unwrap().len(), 2);
        assert_eq!(store.stats().retained_changes, 0);

        drop(old);
        drop(recent);
        assert_eq!(store.stats().pinned_snapshots, 0);
    }

    #[test]
    fn test_snapshot_from_other_store_rejected() {
        let a = MemoryStore::default();
        let b = MemoryStore::default();
        let mut snapshot = a.connection().begin_long_lived_snapshot().unwrap();

        let result = b.connection().advance_snapshot(&mut snapshot);
        assert!(matches!(result, Err(StoreError::Transaction(_))));
    }

    #[test]
    fn test_remove_all_in_collection() {
        let store = MemoryStore::default();
        let conn = store.connection();
        conn.write(|txn| {
            txn.set("users", "1", &1)?;
            txn.set("users", "2", &2)?;
            txn.set("groups", "1", &1)
        })
        .unwrap();

        let mut snapshot = conn.begin_long_lived_snapshot().unwrap();
        conn.write(|txn| txn.remove_all_in_collection("users")).unwrap();

        let events = conn.advance_snapshot(&mut snapshot).unwrap();
        assert!(conn.change_events_affect(&events, "users", "2"));
        assert!(conn.change_events_affect(&events, "users", "never-written"));
        assert!(!conn.change_events_affect(&events, "groups", "1"));

        conn.read_with(|txn| {
            assert!(txn.keys_in_collection("users").is_empty());
            assert_eq!(txn.collections(), vec!["groups".to_string()]);
        });
    }

    #[test]
    fn test_stats() {
        let store = MemoryStore::default();
        let conn = store.connection();
        conn.write(|txn| {
            txn.set("users", "1", &1)?;
            txn.set_with("users", "2", &2, PayloadEncoding::MessagePack)?;
            txn.set_bytes("blobs", "a", vec![1, 2, 3])
        })
        .unwrap();

        let stats = store.stats();
        assert_eq!(stats.head, Sequence(1));
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.keys, 3);
        assert_eq!(stats.listeners, 0);
    }

    #[test]
    fn test_read_transaction_typed_access() {
        let store = MemoryStore::default();
        let conn = store.connection();
        conn.write(|txn| {
            assert!(txn.is_empty());
            txn.set("users", "42", &json!({"name": "ada"}))?;
            txn.set("users", "43", &7u32)?;
            assert_eq!(txn.len(), 2);
            Ok(())
        })
        .unwrap();

        conn.read_with(|txn| {
            assert!(txn.contains("users", "42"));
            assert!(!txn.contains("users", "44"));
            assert_eq!(txn.get_as::<u32>("users", "43").unwrap(), Some(7));
            assert_eq!(txn.get_as::<u32>("users", "44").unwrap(), None);
            assert!(matches!(
                txn.get_as::<u32>("users", "42"),
                Err(StoreError::Deserialization(_))
            ));
        });
    }

    #[test]
    fn test_store_identity_and_config() {
        let a = MemoryStore::new(StoreConfig {
            name: "primary".into(),
            default_encoding: PayloadEncoding::MessagePack,
        });
        let b = MemoryStore::default();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.connection().store_id(), a.id());
        assert_eq!(a.config().name, "primary");
        assert_eq!(b.config().default_encoding, PayloadEncoding::Json);

        let conn = a.connection();
        conn.set("users", "1", &1u32).unwrap();
        let value = conn.read("users", "1").unwrap().unwrap();
        assert_eq!(value.encoding, PayloadEncoding::MessagePack);
    }

    struct Noop;

    impl ModifiedListener for Noop {
        fn on_modified(&self, _notification: &ModifiedNotification) {}
    }

    #[test]
    fn test_registration_unsubscribes_on_drop() {
        let store = MemoryStore::default();
        let conn = store.connection();
        let listener: Arc<dyn ModifiedListener> = Arc::new(Noop);

        let first = ListenerRegistration::register(Arc::clone(&conn), Arc::downgrade(&listener));
        let second = ListenerRegistration::register(Arc::clone(&conn), Arc::downgrade(&listener));
        assert_ne!(first.token(), second.token());
        assert_eq!(store.stats().listeners, 2);

        drop(first);
        assert_eq!(store.stats().listeners, 1);
        drop(second);
        assert_eq!(store.stats().listeners, 0);
    }
}
