//! Read and write transactions against a [`MemoryStore`](crate::MemoryStore).

use crate::error::{Result, StoreError};
use crate::store::StoreState;
use crate::types::{ChangeEvent, CollectionKey, PayloadEncoding, StoredValue};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A consistent, read-only view of the store for the duration of one closure.
pub struct ReadTransaction<'a> {
    state: &'a StoreState,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(state: &'a StoreState) -> Self {
        Self { state }
    }

    /// Get the stored value for a key.
    pub fn get(&self, collection: &str, key: &str) -> Option<&'a StoredValue> {
        self.state.collections.get(collection)?.get(key)
    }

    /// Get and decode a value. `Ok(None)` if the key is missing.
    pub fn get_as<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        self.get(collection, key).map(|value| value.decode::<T>()).transpose()
    }

    pub fn contains(&self, collection: &str, key: &str) -> bool {
        self.get(collection, key).is_some()
    }

    /// Keys in a collection, sorted.
    pub fn keys_in_collection(&self, collection: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .collections
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Non-empty collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.collections.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A staged write operation.
#[derive(Clone, Debug)]
pub(crate) enum WriteOp {
    Put {
        collection: String,
        key: String,
        value: StoredValue,
    },
    Remove {
        collection: String,
        key: String,
    },
    Clear {
        collection: String,
    },
}

impl WriteOp {
    /// Apply to the store state, recording what changed in `event`.
    pub(crate) fn apply(self, state: &mut StoreState, event: &mut ChangeEvent) {
        match self {
            WriteOp::Put {
                collection,
                key,
                value,
            } => {
                event.record_key(&collection, &key);
                state
                    .collections
                    .entry(collection)
                    .or_default()
                    .insert(key, value);
            }
            WriteOp::Remove { collection, key } => {
                event.record_key(&collection, &key);
                if let Some(entries) = state.collections.get_mut(&collection) {
                    entries.remove(&key);
                    if entries.is_empty() {
                        state.collections.remove(&collection);
                    }
                }
            }
            WriteOp::Clear { collection } => {
                event.record_cleared(&collection);
                state.collections.remove(&collection);
            }
        }
    }
}

/// Staged writes, applied atomically when the write closure returns `Ok`.
pub struct WriteTransaction {
    ops: Vec<WriteOp>,
    default_encoding: PayloadEncoding,
}

impl WriteTransaction {
    pub(crate) fn new(default_encoding: PayloadEncoding) -> Self {
        Self {
            ops: Vec::new(),
            default_encoding,
        }
    }

    /// Store a value using the store's default encoding.
    pub fn set<T: Serialize + ?Sized>(&mut self, collection: &str, key: &str, value: &T) -> Result<()> {
        let encoding = self.default_encoding;
        self.set_with(collection, key, value, encoding)
    }

    /// Store a value with an explicit encoding.
    pub fn set_with<T: Serialize + ?Sized>(
        &mut self,
        collection: &str,
        key: &str,
        value: &T,
        encoding: PayloadEncoding,
    ) -> Result<()> {
        let value = StoredValue::encode(value, encoding)?;
        self.set_value(collection, key, value)
    }

    /// Store uninterpreted bytes.
    pub fn set_bytes(&mut self, collection: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.set_value(collection, key, StoredValue::raw(bytes))
    }

    /// Store an already-encoded value.
    pub fn set_value(&mut self, collection: &str, key: &str, value: StoredValue) -> Result<()> {
        CollectionKey::validate(collection, key)?;
        self.ops.push(WriteOp::Put {
            collection: collection.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Remove a key. Removing a missing key still counts as a change to it.
    pub fn remove(&mut self, collection: &str, key: &str) -> Result<()> {
        CollectionKey::validate(collection, key)?;
        self.ops.push(WriteOp::Remove {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    /// Remove every key in a collection.
    pub fn remove_all_in_collection(&mut self, collection: &str) -> Result<()> {
        if collection.is_empty() {
            return Err(StoreError::InvalidKey("collection must not be empty".into()));
        }
        self.ops.push(WriteOp::Clear {
            collection: collection.to_string(),
        });
        Ok(())
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
