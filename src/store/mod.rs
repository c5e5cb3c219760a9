//! Record store adapters.
//!
//! A [`DataStore`] wraps a key-value store holding one entry per service. Each
//! value is a self-describing [`KeyValueEntry`] (key, payload and change type
//! together) so that reads and watch notifications can be decoded without
//! context.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use crate::error::{ConnectError, StoreError};

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::{MemoryBackend, MemoryStore};

/// Kind of change a notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeType {
    /// Key was created or replaced.
    #[default]
    Put,
    /// Key was removed.
    Delete,
}

impl ChangeType {
    /// Wire tag stored in the `T` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Put => "PUT",
            ChangeType::Delete => "DELETE",
        }
    }

    /// Parse a wire tag. An absent tag means put.
    fn from_tag(tag: &[u8]) -> Option<Self> {
        if tag.is_empty() || tag.eq_ignore_ascii_case(b"PUT") {
            Some(ChangeType::Put)
        } else if tag.eq_ignore_ascii_case(b"DELETE") {
            Some(ChangeType::Delete)
        } else {
            None
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key, its opaque payload and the change that produced it.
///
/// Stored as `{"K": <base64>, "V": <base64>, "T": <base64>}`, the JSON shape a
/// Go `[]byte` struct produces, so existing stores remain readable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValueEntry {
    /// Full store key, `<prefix><service>` by convention.
    pub key: Vec<u8>,
    /// Serialized record set.
    pub value: Vec<u8>,
    /// Put or delete.
    pub change_type: ChangeType,
}

impl KeyValueEntry {
    /// Build a put entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            change_type: ChangeType::Put,
        }
    }

    /// Build a delete entry carrying only the key.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            change_type: ChangeType::Delete,
        }
    }

    /// Key as UTF-8, replacing invalid sequences.
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    /// Encode to the stored JSON representation.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a stored value. `key` wins over any key embedded in the payload.
    pub fn decode(key: &[u8], stored: &[u8]) -> Result<Self, StoreError> {
        let mut entry: KeyValueEntry = serde_json::from_slice(stored)?;
        entry.key = key.to_vec();
        Ok(entry)
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "K", with = "b64", default)]
    key: Vec<u8>,
    #[serde(rename = "V", with = "b64", default)]
    value: Vec<u8>,
    #[serde(rename = "T", with = "b64", default)]
    change_type: Vec<u8>,
}

impl Serialize for KeyValueEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            change_type: self.change_type.as_str().as_bytes().to_vec(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyValueEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEntry::deserialize(deserializer)?;
        let change_type = ChangeType::from_tag(&wire.change_type).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "unknown change type {:?}",
                String::from_utf8_lossy(&wire.change_type)
            ))
        })?;
        Ok(Self {
            key: wire.key,
            value: wire.value,
            change_type,
        })
    }
}

/// `[]byte`-compatible base64 encoding; JSON `null` decodes to empty.
mod b64 {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Result of a get or prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreResult {
    /// Number of entries found; zero is not an error.
    pub count: usize,
    /// Entries found, in key order.
    pub entries: Vec<KeyValueEntry>,
}

impl StoreResult {
    /// Build a result from entries.
    pub fn from_entries(entries: Vec<KeyValueEntry>) -> Self {
        Self {
            count: entries.len(),
            entries,
        }
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Callback receiving `(new_entries, old_entries)` for each store transaction.
///
/// `old_entries` holds the previous value of each changed key when the store
/// can provide it.
pub type WatchCallback = Arc<dyn Fn(Vec<KeyValueEntry>, Vec<KeyValueEntry>) + Send + Sync>;

/// Invoked when a watch may have missed notifications, after a lagging
/// consumer or a re-established subscription. The receiver must rescan.
pub type ResyncCallback = Arc<dyn Fn() + Send + Sync>;

/// What [`DataStore::update`] should do with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Leave the key as it is.
    Keep,
    /// Store this payload under the key.
    Put(Vec<u8>),
    /// Remove the key.
    Delete,
}

/// Computes an [`Update`] from the current entry. May run more than once.
pub type UpdateFn<'a> = &'a (dyn Fn(Option<&KeyValueEntry>) -> Update + Send + Sync);

/// A key-value store holding service record sets.
///
/// Every request is bounded by the adapter's request timeout. Failures are
/// returned to the caller; nothing here panics on connectivity loss.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Establish a session with the backing store.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Upsert `entry`, replacing any previous value under its key.
    async fn put(&self, entry: KeyValueEntry) -> Result<(), StoreError>;

    /// Read one key.
    async fn get(&self, key: &[u8]) -> Result<StoreResult, StoreError>;

    /// Read every key starting with `prefix`.
    async fn get_by_prefix(&self, prefix: &[u8]) -> Result<StoreResult, StoreError>;

    /// Remove one key. Removing a missing key is not an error.
    async fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Atomic read-modify-write of one key.
    ///
    /// `apply` sees the current entry and decides the new state. No write to
    /// the key by another caller can land between that read and this write;
    /// adapters retry `apply` against the fresh value when one does.
    async fn update(&self, key: &[u8], apply: UpdateFn<'_>) -> Result<(), StoreError>;

    /// Start delivering notifications for keys under `prefix` to the
    /// installed callback. A second call replaces the first subscription.
    fn watch(&self, prefix: &[u8]);

    /// Install the single callback invoked for every notification batch.
    fn set_on_watch(&self, callback: WatchCallback);

    /// Install the callback invoked when the watch may have lost changes.
    fn set_on_resync(&self, callback: ResyncCallback);

    /// Best-effort release of the session and any watch task.
    async fn close(&self);
}
