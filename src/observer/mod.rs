//! Observation of a single record.
//!
//! A [`KeyObserver`] watches one `(collection, key)` pair through any
//! [`StoreConnection`](crate::StoreConnection) and reports changes to a single
//! [`Subscriber`]: a weakly held [`ObserverDelegate`], a callback, or a
//! bounded channel.

mod key_observer;
mod subscriber;

pub use key_observer::{KeyObserver, ObserverState};
pub use subscriber::{Callback, ObserverDelegate, Subscriber};
