//! The contract a store must offer for its keys to be observed.

use crate::error::Result;
use crate::types::{ModifiedNotification, StoreId, StoredValue};
use std::sync::{Arc, Weak};

/// Receives a store's "modified" notification after every commit.
///
/// Called on the committing thread. Implementations must hand real work off
/// elsewhere and return quickly.
pub trait ModifiedListener: Send + Sync {
    fn on_modified(&self, notification: &ModifiedNotification);
}

/// Identifies one listener registration within a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub u64);

/// A shared connection to a key-value document store.
///
/// The store owns transactions, snapshots and change tracking; observers
/// only consume this interface.
pub trait StoreConnection: Send + Sync + 'static {
    /// A long-lived read snapshot. Dropping it releases it.
    type Snapshot: Send + 'static;

    /// Opaque record of one committed write.
    type ChangeEvent: Send + 'static;

    /// The store instance behind this connection.
    fn store_id(&self) -> StoreId;

    /// Pin a consistent view of the store at its current head.
    fn begin_long_lived_snapshot(&self) -> Result<Self::Snapshot>;

    /// Move `snapshot` to the current head, returning every change committed
    /// since its previous position, oldest first. May be empty.
    fn advance_snapshot(&self, snapshot: &mut Self::Snapshot) -> Result<Vec<Self::ChangeEvent>>;

    /// Whether any of `events` changed `key` in `collection`.
    fn change_events_affect(&self, events: &[Self::ChangeEvent], collection: &str, key: &str)
        -> bool;

    /// Read the latest committed value in a short-lived transaction.
    fn read(&self, collection: &str, key: &str) -> Result<Option<StoredValue>>;

    /// Register for modification notifications on this connection's store.
    ///
    /// The store keeps only the weak handle; a listener whose owner is gone
    /// is skipped and pruned.
    fn subscribe_modified(&self, listener: Weak<dyn ModifiedListener>) -> ListenerToken;

    /// Remove a registration. Unknown tokens are ignored.
    fn unsubscribe(&self, token: ListenerToken);
}

/// Scoped listener registration: unsubscribes when dropped.
pub struct ListenerRegistration<C: StoreConnection> {
    connection: Arc<C>,
    token: ListenerToken,
}

impl<C: StoreConnection> ListenerRegistration<C> {
    pub fn register(connection: Arc<C>, listener: Weak<dyn ModifiedListener>) -> Self {
        let token = connection.subscribe_modified(listener);
        Self { connection, token }
    }

    pub fn token(&self) -> ListenerToken {
        self.token
    }
}

impl<C: StoreConnection> Drop for ListenerRegistration<C> {
    fn drop(&mut self) {
        self.connection.unsubscribe(self.token);
    }
}
