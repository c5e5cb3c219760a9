//! In-process data store.
//!
//! Mirrors the behaviour of a networked store without any I/O: values are
//! kept in a shared [`MemoryBackend`] and every mutation is broadcast to
//! watchers in commit order. Several [`MemoryStore`] handles may share one
//! backend, which is how the component registry keeps registrations alive
//! across manifest reloads.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    ChangeType, DataStore, KeyValueEntry, ResyncCallback, StoreResult, Update, UpdateFn,
    WatchCallback,
};
use crate::error::{ConnectError, StoreError};
use crate::metrics::{self, ResyncReason};

/// Notifications buffered per watcher before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// One committed mutation.
#[derive(Debug, Clone)]
struct Notification {
    new: Vec<KeyValueEntry>,
    old: Vec<KeyValueEntry>,
}

/// Shared key space of the in-memory store.
#[derive(Debug)]
pub struct MemoryBackend {
    /// key -> encoded entry
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    events: broadcast::Sender<Notification>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            data: RwLock::new(BTreeMap::new()),
            events,
        })
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn decode_stored(key: &[u8], stored: &[u8]) -> Option<KeyValueEntry> {
        match KeyValueEntry::decode(key, stored) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %String::from_utf8_lossy(key), error = %e, "undecodable stored entry");
                None
            }
        }
    }

    // Callers hold the write lock so watchers observe commit order.
    fn commit(
        &self,
        data: &mut BTreeMap<Vec<u8>, Vec<u8>>,
        entry: KeyValueEntry,
    ) -> Result<(), StoreError> {
        let previous = match entry.change_type {
            ChangeType::Put => data.insert(entry.key.clone(), entry.encode()?),
            ChangeType::Delete => data.remove(&entry.key),
        };
        if previous.is_none() && entry.change_type == ChangeType::Delete {
            return Ok(());
        }
        let old = previous
            .and_then(|stored| Self::decode_stored(&entry.key, &stored))
            .into_iter()
            .collect();
        let _ = self.events.send(Notification {
            new: vec![entry],
            old,
        });
        Ok(())
    }

    fn put(&self, entry: KeyValueEntry) -> Result<(), StoreError> {
        let mut data = self.data.write();
        self.commit(&mut data, entry)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write();
        self.commit(&mut data, KeyValueEntry::delete(key))
    }

    fn update(&self, key: &[u8], apply: UpdateFn<'_>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let current = data
            .get(key)
            .map(|stored| KeyValueEntry::decode(key, stored))
            .transpose()?;
        match apply(current.as_ref()) {
            Update::Keep => Ok(()),
            Update::Put(value) => self.commit(&mut data, KeyValueEntry::put(key, value)),
            Update::Delete => self.commit(&mut data, KeyValueEntry::delete(key)),
        }
    }

    fn get(&self, key: &[u8]) -> Result<StoreResult, StoreError> {
        let data = self.data.read();
        match data.get(key) {
            Some(stored) => Ok(StoreResult::from_entries(vec![KeyValueEntry::decode(
                key, stored,
            )?])),
            None => Ok(StoreResult::default()),
        }
    }

    fn get_by_prefix(&self, prefix: &[u8]) -> Result<StoreResult, StoreError> {
        let data = self.data.read();
        let entries = data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValueEntry::decode(key, stored))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreResult::from_entries(entries))
    }
}

/// Handle onto a [`MemoryBackend`] implementing [`DataStore`].
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    connected: AtomicBool,
    callback: Arc<RwLock<Option<WatchCallback>>>,
    on_resync: Arc<RwLock<Option<ResyncCallback>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store with its own private backend.
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    /// Create a store sharing `backend` with other handles.
    pub fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connected: AtomicBool::new(false),
            callback: Arc::new(RwLock::new(None)),
            on_resync: Arc::new(RwLock::new(None)),
            watch_task: Mutex::new(None),
        }
    }

    /// The shared backend.
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.watch_task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn connect(&self) -> Result<(), ConnectError> {
        self.connected.store(true, Ordering::Release);
        debug!(keys = self.backend.len(), "memory store connected");
        Ok(())
    }

    async fn put(&self, entry: KeyValueEntry) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.backend.put(entry)
    }

    async fn get(&self, key: &[u8]) -> Result<StoreResult, StoreError> {
        self.ensure_connected()?;
        self.backend.get(key)
    }

    async fn get_by_prefix(&self, prefix: &[u8]) -> Result<StoreResult, StoreError> {
        self.ensure_connected()?;
        self.backend.get_by_prefix(prefix)
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.backend.delete(key)
    }

    async fn update(&self, key: &[u8], apply: UpdateFn<'_>) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.backend.update(key, apply)
    }

    fn watch(&self, prefix: &[u8]) {
        if self.ensure_connected().is_err() {
            warn!("memory store watch requested before connect, ignoring");
            return;
        }

        // Subscribe before spawning so no commit after this call is missed.
        let mut rx = self.backend.events.subscribe();
        let prefix = prefix.to_vec();
        let callback = self.callback.clone();
        let on_resync = self.on_resync.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        let new: Vec<KeyValueEntry> = notification
                            .new
                            .into_iter()
                            .filter(|e| e.key.starts_with(&prefix))
                            .collect();
                        if new.is_empty() {
                            continue;
                        }
                        let old: Vec<KeyValueEntry> = notification
                            .old
                            .into_iter()
                            .filter(|e| e.key.starts_with(&prefix))
                            .collect();

                        let current = callback.read().clone();
                        if let Some(on_watch) = current {
                            on_watch(new, old);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory store watcher lagged, requesting full resync");
                        metrics::record_watch_lag(skipped);
                        metrics::record_watch_resync(ResyncReason::Lagged);
                        let current = on_resync.read().clone();
                        if let Some(resync) = current {
                            resync();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("memory store event channel closed");
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.watch_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn set_on_watch(&self, callback: WatchCallback) {
        *self.callback.write() = Some(callback);
    }

    fn set_on_resync(&self, callback: ResyncCallback) {
        *self.on_resync.write() = Some(callback);
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(handle) = self.watch_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connected_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get(b"anything").await,
            Err(StoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = connected_store().await;
        store
            .put(KeyValueEntry::put("service.discover.alpha", "payload"))
            .await
            .unwrap();

        let result = store.get(b"service.discover.alpha").await.unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.entries[0].value, b"payload");
        assert_eq!(result.entries[0].key, b"service.discover.alpha");
    }

    #[tokio::test]
    async fn test_get_missing_is_empty_not_error() {
        let store = connected_store().await;
        let result = store.get(b"missing").await.unwrap();
        assert_eq!(result.count, 0);
        assert!(result.entries.is_empty());
    }

    #[tokio::test]
    async fn test_get_by_prefix_only_matches_prefix() {
        let store = connected_store().await;
        for key in ["service.discover.a", "service.discover.b", "service.other", "zzz"] {
            store.put(KeyValueEntry::put(key, "v")).await.unwrap();
        }

        let result = store.get_by_prefix(b"service.discover.").await.unwrap();
        let keys: Vec<String> = result.entries.iter().map(|e| e.key_str().into_owned()).collect();
        assert_eq!(keys, vec!["service.discover.a", "service.discover.b"]);
        assert_eq!(result.count, 2);
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let store = connected_store().await;
        store.put(KeyValueEntry::put("k", "v")).await.unwrap();
        store.delete(b"k").await.unwrap();
        store.delete(b"k").await.unwrap();
        assert!(store.get(b"k").await.unwrap().is_empty());
    }

    type Batch = (Vec<KeyValueEntry>, Vec<KeyValueEntry>);

    async fn next_batch(rx: &mut mpsc::UnboundedReceiver<Batch>) -> Batch {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("watch notification timed out")
            .expect("watch channel closed")
    }

    #[tokio::test]
    async fn test_watch_delivers_puts_and_deletes_with_old_values() {
        let store = connected_store().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_on_watch(Arc::new(move |new, old| {
            let _ = tx.send((new, old));
        }));
        store.watch(b"service.discover.");

        store.put(KeyValueEntry::put("service.discover.a", "one")).await.unwrap();
        store.put(KeyValueEntry::put("unwatched", "x")).await.unwrap();
        store.put(KeyValueEntry::put("service.discover.a", "two")).await.unwrap();
        store.delete(b"service.discover.a").await.unwrap();

        let (new, old) = next_batch(&mut rx).await;
        assert_eq!(new[0].value, b"one");
        assert!(old.is_empty());

        let (new, old) = next_batch(&mut rx).await;
        assert_eq!(new[0].value, b"two");
        assert_eq!(old[0].value, b"one");

        let (new, old) = next_batch(&mut rx).await;
        assert_eq!(new[0].change_type, ChangeType::Delete);
        assert_eq!(old[0].value, b"two");
    }

    #[tokio::test]
    async fn test_set_on_watch_replaces_callback() {
        let store = connected_store().await;
        let (first_tx, mut first_rx) = mpsc::unbounded_channel::<usize>();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel::<usize>();

        store.set_on_watch(Arc::new(move |new, _| {
            let _ = first_tx.send(new.len());
        }));
        store.set_on_watch(Arc::new(move |new, _| {
            let _ = second_tx.send(new.len());
        }));
        store.watch(b"");

        store.put(KeyValueEntry::put("k", "v")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), second_rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(1));
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_sees_current_value() {
        let store = connected_store().await;
        store.put(KeyValueEntry::put("k", "1")).await.unwrap();

        store
            .update(b"k", &|current| {
                let n: u32 = std::str::from_utf8(&current.unwrap().value).unwrap().parse().unwrap();
                Update::Put((n + 1).to_string().into_bytes())
            })
            .await
            .unwrap();
        assert_eq!(store.get(b"k").await.unwrap().entries[0].value, b"2");

        store.update(b"k", &|_| Update::Delete).await.unwrap();
        assert!(store.get(b"k").await.unwrap().is_empty());
        store.update(b"missing", &|_| Update::Keep).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(connected_store().await);
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update(b"counter", &|current| {
                            let n: u32 = current
                                .map(|e| std::str::from_utf8(&e.value).unwrap().parse().unwrap())
                                .unwrap_or(0);
                            Update::Put((n + 1).to_string().into_bytes())
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get(b"counter").await.unwrap().entries[0].value, b"64");
    }

    #[tokio::test]
    async fn test_lagged_watcher_requests_resync() {
        let store = connected_store().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_on_watch(Arc::new(|_, _| {}));
        store.set_on_resync(Arc::new(move || {
            let _ = tx.send(());
        }));
        store.watch(b"service.discover.");

        // The watch task cannot run until this test yields, so the channel overflows.
        for i in 0..EVENT_CAPACITY + 10 {
            store
                .put(KeyValueEntry::put(format!("service.discover.svc{i}"), "v"))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("lagging watcher never asked for a resync")
            .unwrap();
    }

    #[tokio::test]
    async fn test_handles_share_backend() {
        let backend = MemoryBackend::new();
        let first = MemoryStore::with_backend(backend.clone());
        first.connect().await.unwrap();
        first.put(KeyValueEntry::put("k", "v")).await.unwrap();
        first.close().await;

        let second = MemoryStore::with_backend(backend);
        second.connect().await.unwrap();
        assert_eq!(second.get(b"k").await.unwrap().count, 1);
    }
}
