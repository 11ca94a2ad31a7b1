//! # keywatch
//!
//! Snapshot-consistent change observation for single records in a
//! key-value document store.
//!
//! ## Core Concepts
//!
//! - **Store connection**: any store offering long-lived snapshots, change
//!   events and modification listeners ([`StoreConnection`])
//! - **Key observer**: watches one `(collection, key)` and reports changes
//!   ([`KeyObserver`])
//! - **Dispatch**: background context for filtering, serial delivery context
//!   for subscribers ([`Dispatcher`])
//! - **Memory store**: an in-process store implementing the connection
//!   contract ([`MemoryStore`])
//!
//! ## Example
//!
//! ```ignore
//! use keywatch::{DispatchConfig, Dispatcher, KeyObserver, MemoryStore};
//!
//! let store = MemoryStore::default();
//! let connection = store.connection();
//! let dispatcher = Dispatcher::spawn(DispatchConfig::default())?;
//!
//! let observer: KeyObserver<serde_json::Value, _> =
//!     KeyObserver::new("users", "42", connection.clone(), dispatcher)?;
//! let updates = observer.subscribe(16);
//!
//! connection.set("users", "42", &json!({"name": "ada"}))?;
//! assert_eq!(updates.recv()?.unwrap()["name"], "ada");
//! ```

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod listeners;
pub mod observer;
pub mod store;
pub mod transaction;
pub mod types;

// Re-exports
pub use connection::{ListenerRegistration, ListenerToken, ModifiedListener, StoreConnection};
pub use dispatch::{DispatchConfig, Dispatcher, Executor, Job, QueuePump, TaskQueue};
pub use error::{Result, StoreError};
pub use listeners::ListenerRegistry;
pub use observer::{Callback, KeyObserver, ObserverDelegate, ObserverState, Subscriber};
pub use store::{MemoryConnection, MemorySnapshot, MemoryStore, StoreConfig};
pub use transaction::{ReadTransaction, WriteTransaction};
pub use types::*;
