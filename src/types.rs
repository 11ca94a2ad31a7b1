//! Core types for key observation.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one store instance within the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(pub u64);

impl StoreId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StoreId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit position in a store. Every committed write transaction gets the next one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// A key qualified by its collection.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionKey {
    pub collection: String,
    pub key: String,
}

impl CollectionKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Reject empty collection names and keys.
    pub fn validate(collection: &str, key: &str) -> Result<()> {
        if collection.is_empty() {
            return Err(StoreError::InvalidKey("collection must not be empty".into()));
        }
        if key.is_empty() {
            return Err(StoreError::InvalidKey(format!(
                "key in collection {:?} must not be empty",
                collection
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PayloadEncoding {
    #[default]
    Json,
    MessagePack,
    Raw,
}

/// Bytes stored under a key, tagged with how they were encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
}

impl StoredValue {
    /// Encode a value with the given encoding.
    pub fn encode<T: Serialize + ?Sized>(value: &T, encoding: PayloadEncoding) -> Result<Self> {
        let payload = match encoding {
            PayloadEncoding::Json => serde_json::to_vec(value)?,
            PayloadEncoding::MessagePack => rmp_serde::to_vec_named(value)?,
            PayloadEncoding::Raw => {
                return Err(StoreError::Serialization(
                    "raw encoding takes bytes, not typed values".into(),
                ))
            }
        };
        Ok(Self { payload, encoding })
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::encode(value, PayloadEncoding::Json)
    }

    pub fn msgpack<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::encode(value, PayloadEncoding::MessagePack)
    }

    pub fn raw(payload: Vec<u8>) -> Self {
        Self {
            payload,
            encoding: PayloadEncoding::Raw,
        }
    }

    /// Interpret the payload as `T`.
    ///
    /// Fails with [`StoreError::Deserialization`] when the bytes do not decode
    /// as `T`. Raw payloads never decode.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.encoding {
            PayloadEncoding::Json => serde_json::from_slice(&self.payload)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            PayloadEncoding::MessagePack => Ok(rmp_serde::from_slice(&self.payload)?),
            PayloadEncoding::Raw => Err(StoreError::Deserialization(format!(
                "raw payload of {} bytes has no typed encoding",
                self.payload.len()
            ))),
        }
    }
}

/// One committed write transaction, as seen by change filtering.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    sequence: Sequence,
    /// Touched keys, grouped by collection.
    changed: HashMap<String, HashSet<String>>,
    cleared_collections: HashSet<String>,
}

impl ChangeEvent {
    pub(crate) fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            changed: HashMap::new(),
            cleared_collections: HashSet::new(),
        }
    }

    pub(crate) fn record_key(&mut self, collection: &str, key: &str) {
        self.changed
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub(crate) fn record_cleared(&mut self, collection: &str) {
        self.cleared_collections.insert(collection.to_string());
    }

    /// Whether this commit wrote, removed, or cleared `(collection, key)`.
    pub fn touches(&self, collection: &str, key: &str) -> bool {
        if self.cleared_collections.contains(collection) {
            return true;
        }
        self.changed
            .get(collection)
            .map_or(false, |keys| keys.contains(key))
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }
}

/// Passed to modification listeners after each commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModifiedNotification {
    pub store: StoreId,
    pub sequence: Sequence,
}

/// Point-in-time counters for a store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub head: Sequence,
    pub collections: usize,
    pub keys: usize,
    /// Change events kept for pinned snapshots.
    pub retained_changes: usize,
    pub pinned_snapshots: usize,
    pub listeners: usize,
}
