//! etcd-backed data store.
//!
//! Every key is namespaced under `<keyPrefix>/` so several deployments can
//! share one etcd cluster; the namespace is invisible to callers.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, KeyValue, Txn, TxnOp,
    WatchOptions, WatchResponse,
};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    ChangeType, DataStore, KeyValueEntry, ResyncCallback, StoreResult, Update, UpdateFn,
    WatchCallback,
};
use crate::config::DataStoreConfig;
use crate::error::{ConnectError, StoreError};
use crate::metrics::{self, ResyncReason};

/// Compare-and-swap attempts before an update gives up.
const UPDATE_ATTEMPTS: usize = 16;

const MIN_WATCH_BACKOFF: Duration = Duration::from_millis(500);
const MAX_WATCH_BACKOFF: Duration = Duration::from_secs(30);

/// Data store adapter over an etcd v3 cluster.
pub struct EtcdStore {
    config: DataStoreConfig,
    namespace: Vec<u8>,
    client: RwLock<Option<Client>>,
    callback: Arc<RwLock<Option<WatchCallback>>>,
    on_resync: Arc<RwLock<Option<ResyncCallback>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdStore {
    /// Create an adapter; nothing is contacted until [`DataStore::connect`].
    pub fn new(config: DataStoreConfig) -> Self {
        let namespace = format!("{}/", config.key_prefix.trim_end_matches('/')).into_bytes();
        Self {
            config,
            namespace,
            client: RwLock::new(None),
            callback: Arc::new(RwLock::new(None)),
            on_resync: Arc::new(RwLock::new(None)),
            watch_task: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<Client, StoreError> {
        self.client.read().clone().ok_or(StoreError::NotConnected)
    }

    fn physical_key(&self, key: &[u8]) -> Vec<u8> {
        let mut physical = self.namespace.clone();
        physical.extend_from_slice(key);
        physical
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| StoreError::Backend(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.config.request_timeout)),
        }
    }

    fn decode_kvs(namespace: &[u8], kvs: &[KeyValue]) -> Result<Vec<KeyValueEntry>, StoreError> {
        kvs.iter()
            .map(|kv| {
                let key = kv.key().strip_prefix(namespace).unwrap_or(kv.key());
                KeyValueEntry::decode(key, kv.value())
            })
            .collect()
    }

    /// Split one watch response into `(new, old)` entries with the namespace stripped.
    fn translate(namespace: &[u8], resp: &WatchResponse) -> (Vec<KeyValueEntry>, Vec<KeyValueEntry>) {
        let mut new = Vec::with_capacity(resp.events().len());
        let mut old = Vec::new();
        for event in resp.events() {
            let Some(kv) = event.kv() else { continue };
            let key = kv.key().strip_prefix(namespace).unwrap_or(kv.key());

            match event.event_type() {
                EventType::Delete => new.push(KeyValueEntry::delete(key)),
                EventType::Put => match KeyValueEntry::decode(key, kv.value()) {
                    Ok(mut entry) => {
                        entry.change_type = ChangeType::Put;
                        new.push(entry);
                    }
                    Err(e) => {
                        warn!(key = %String::from_utf8_lossy(key), error = %e, "undecodable etcd value");
                    }
                },
            }

            if let Some(prev) = event.prev_kv() {
                if let Ok(entry) = KeyValueEntry::decode(key, prev.value()) {
                    old.push(entry);
                }
            }
        }
        (new, old)
    }
}

#[async_trait]
impl DataStore for EtcdStore {
    async fn connect(&self) -> Result<(), ConnectError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(self.config.dial_timeout)
            .with_timeout(self.config.request_timeout);

        let dial = self.config.dial_timeout;
        let mut client = match tokio::time::timeout(
            dial,
            Client::connect(self.config.host_list.clone(), Some(options)),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return Err(ConnectError::Backend(e.to_string())),
            Err(_) => return Err(ConnectError::DialTimeout(dial)),
        };

        // Channels are established lazily; prove one endpoint answers.
        match tokio::time::timeout(dial, client.status()).await {
            Ok(Ok(status)) => {
                info!(
                    hosts = ?self.config.host_list,
                    version = %status.version(),
                    "connected to etcd"
                );
            }
            Ok(Err(e)) => return Err(ConnectError::Backend(e.to_string())),
            Err(_) => return Err(ConnectError::DialTimeout(dial)),
        }

        *self.client.write() = Some(client);
        Ok(())
    }

    async fn put(&self, entry: KeyValueEntry) -> Result<(), StoreError> {
        let mut client = self.client()?;
        let stored = entry.encode()?;
        let key = self.physical_key(&entry.key);
        self.bounded(client.put(key, stored, None)).await?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<StoreResult, StoreError> {
        let mut client = self.client()?;
        let resp = self.bounded(client.get(self.physical_key(key), None)).await?;
        let entries = Self::decode_kvs(&self.namespace, resp.kvs())?;
        Ok(StoreResult::from_entries(entries))
    }

    async fn get_by_prefix(&self, prefix: &[u8]) -> Result<StoreResult, StoreError> {
        let mut client = self.client()?;
        let resp = self
            .bounded(client.get(
                self.physical_key(prefix),
                Some(GetOptions::new().with_prefix()),
            ))
            .await?;
        let entries = Self::decode_kvs(&self.namespace, resp.kvs())?;
        Ok(StoreResult::from_entries(entries))
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut client = self.client()?;
        self.bounded(client.delete(self.physical_key(key), None))
            .await?;
        Ok(())
    }

    async fn update(&self, key: &[u8], apply: UpdateFn<'_>) -> Result<(), StoreError> {
        let mut client = self.client()?;
        let physical = self.physical_key(key);

        for attempt in 1..=UPDATE_ATTEMPTS {
            let resp = self.bounded(client.get(physical.clone(), None)).await?;
            let (current, guard) = match resp.kvs().first() {
                Some(kv) => (
                    Some(KeyValueEntry::decode(key, kv.value())?),
                    Compare::mod_revision(physical.clone(), CompareOp::Equal, kv.mod_revision()),
                ),
                None => (
                    None,
                    Compare::create_revision(physical.clone(), CompareOp::Equal, 0),
                ),
            };

            let op = match apply(current.as_ref()) {
                Update::Keep => return Ok(()),
                Update::Delete if current.is_none() => return Ok(()),
                Update::Delete => TxnOp::delete(physical.clone(), None),
                Update::Put(value) => {
                    TxnOp::put(physical.clone(), KeyValueEntry::put(key, value).encode()?, None)
                }
            };

            let txn = Txn::new().when([guard]).and_then([op]);
            if self.bounded(client.txn(txn)).await?.succeeded() {
                return Ok(());
            }
            debug!(key = %String::from_utf8_lossy(key), attempt, "concurrent write, retrying update");
        }

        Err(StoreError::Backend(format!(
            "update of {} lost {UPDATE_ATTEMPTS} races to concurrent writers",
            String::from_utf8_lossy(key)
        )))
    }

    fn watch(&self, prefix: &[u8]) {
        let mut client = match self.client() {
            Ok(client) => client,
            Err(_) => {
                warn!("etcd watch requested before connect, ignoring");
                return;
            }
        };
        let key = self.physical_key(prefix);
        let namespace = self.namespace.clone();
        let callback = self.callback.clone();
        let on_resync = self.on_resync.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = MIN_WATCH_BACKOFF;
            // Set once the subscription has broken; the next one must be followed by a rescan.
            let mut lost_continuity = false;

            loop {
                let options = WatchOptions::new().with_prefix().with_prev_key();
                let (_watcher, mut stream) = match client.watch(key.clone(), Some(options)).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, retry_in = ?backoff, "failed to start etcd watch");
                        metrics::record_watch_resync(ResyncReason::Error);
                        lost_continuity = true;
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_WATCH_BACKOFF);
                        continue;
                    }
                };
                backoff = MIN_WATCH_BACKOFF;

                if lost_continuity {
                    info!("etcd watch re-established, requesting full resync");
                    let current = on_resync.read().clone();
                    if let Some(resync) = current {
                        resync();
                    }
                }

                let reason = loop {
                    let resp = match stream.message().await {
                        Ok(Some(resp)) => resp,
                        Ok(None) => {
                            debug!("etcd watch stream ended");
                            break ResyncReason::StreamEnded;
                        }
                        Err(e) => {
                            warn!(error = %e, "etcd watch stream failed");
                            break ResyncReason::Error;
                        }
                    };

                    let (new, old) = Self::translate(&namespace, &resp);
                    if new.is_empty() {
                        continue;
                    }
                    let current = callback.read().clone();
                    if let Some(on_watch) = current {
                        on_watch(new, old);
                    }
                };

                metrics::record_watch_resync(reason);
                lost_continuity = true;
                sleep(backoff).await;
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
        if let Some(handle) = self.watch_task.lock().take() {
            handle.abort();
        }
        self.client.write().take();
    }
}
