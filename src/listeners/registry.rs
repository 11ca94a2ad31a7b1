//! Registry of weak modification listeners for one store.

use crate::connection::{ListenerToken, ModifiedListener};
use crate::types::ModifiedNotification;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Holds the listeners registered against a single store instance.
pub struct ListenerRegistry {
    /// Registered listeners by token.
    listeners: RwLock<HashMap<ListenerToken, Weak<dyn ModifiedListener>>>,
    /// Counter for generating tokens.
    next_id: AtomicU64,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. The registry never keeps it alive.
    pub fn subscribe(&self, listener: Weak<dyn ModifiedListener>) -> ListenerToken {
        let token = ListenerToken(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().insert(token, listener);
        token
    }

    /// Remove a registration. Returns false if the token was unknown.
    pub fn unsubscribe(&self, token: ListenerToken) -> bool {
        self.listeners.write().remove(&token).is_some()
    }

    /// Number of registrations, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a notification to every live listener.
    ///
    /// Listeners run after the registry lock is released, so they may
    /// subscribe or unsubscribe from inside `on_modified`. Returns the number
    /// of listeners invoked.
    pub fn notify(&self, notification: &ModifiedNotification) -> usize {
        let mut live: Vec<Arc<dyn ModifiedListener>> = Vec::new();
        let mut dead = Vec::new();

        {
            let listeners = self.listeners.read();
            for (token, weak) in listeners.iter() {
                match weak.upgrade() {
                    Some(listener) => live.push(listener),
                    None => dead.push(*token),
                }
            }
        }

        if !dead.is_empty() {
            tracing::trace!(
                store = %notification.store,
                pruned = dead.len(),
                "pruning listeners whose owner is gone"
            );
            let mut listeners = self.listeners.write();
            for token in dead {
                listeners.remove(&token);
            }
        }

        for listener in &live {
            listener.on_modified(notification);
        }

        live.len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
