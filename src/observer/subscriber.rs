//! The single subscription slot of an observer.

use crossbeam_channel::{Sender, TrySendError};
use std::fmt;
use std::sync::{Arc, Weak};

/// Told that the observed record changed. Carries no value; read it with
/// [`KeyObserver::current_value`](crate::KeyObserver::current_value).
pub trait ObserverDelegate: Send + Sync {
    fn on_object_updated(&self);
}

/// Callback invoked with the fresh value.
pub type Callback<T> = Arc<dyn Fn(Option<T>) + Send + Sync>;

/// Who an observer reports to. An observer holds at most one.
pub enum Subscriber<T> {
    /// Weakly held; skipped once its owner drops it.
    Delegate(Weak<dyn ObserverDelegate>),
    Callback(Callback<T>),
    Channel(Sender<Option<T>>),
}

impl<T> Subscriber<T> {
    /// Hand one update to the subscriber. `value` is only read for callback
    /// and channel subscribers. Returns false if the subscriber is gone for
    /// good and should be cleared.
    pub(crate) fn notify(&self, value: impl FnOnce() -> Option<T>) -> bool {
        match self {
            Subscriber::Delegate(weak) => match weak.upgrade() {
                Some(delegate) => {
                    delegate.on_object_updated();
                    true
                }
                None => false,
            },
            Subscriber::Callback(callback) => {
                callback(value());
                true
            }
            Subscriber::Channel(sender) => match sender.try_send(value()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("subscriber channel full, update dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        match self {
            Subscriber::Delegate(weak) => Subscriber::Delegate(weak.clone()),
            Subscriber::Callback(callback) => Subscriber::Callback(Arc::clone(callback)),
            Subscriber::Channel(sender) => Subscriber::Channel(sender.clone()),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Delegate(_) => f.write_str("Subscriber::Delegate"),
            Subscriber::Callback(_) => f.write_str("Subscriber::Callback"),
            Subscriber::Channel(_) => f.write_str("Subscriber::Channel"),
        }
    }
}
