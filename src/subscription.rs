//! Mirrors store notifications into the active zone.
//!
//! A reseed scans the whole prefix while the watch keeps delivering. Batches
//! that arrive during the scan are held back and replayed, in order, on top
//! of the snapshot, so a stale scan never overwrites a newer change.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::metrics::{self, WatchEventType};
use crate::record::ServiceRecordSet;
use crate::state::Zone;
use crate::store::{ChangeType, DataStore, KeyValueEntry, ResyncCallback, WatchCallback};

/// The zone currently served, if a DNS responder is active.
///
/// Swapped by the orchestrator when the responder is replaced, so a store
/// subscription outlives any single responder.
pub type ZoneSlot = Arc<RwLock<Option<Zone>>>;

/// Applies store entries under one key prefix to whatever zone is in the slot.
pub struct ZoneSync {
    prefix: String,
    zone: ZoneSlot,
    /// `Some` while a seed is scanning; holds the batches delivered meanwhile.
    held: Mutex<Option<Vec<Vec<KeyValueEntry>>>>,
    seeding: tokio::sync::Mutex<()>,
    resync: Arc<Notify>,
}

/// What a single entry means for the zone.
#[derive(Debug, PartialEq)]
enum EntryChange {
    Set(String, ServiceRecordSet),
    Delete(String),
}

impl ZoneSync {
    /// Create a sync for keys starting with `prefix`.
    pub fn new(prefix: impl Into<String>, zone: ZoneSlot) -> Self {
        Self {
            prefix: prefix.into(),
            zone,
            held: Mutex::new(None),
            seeding: tokio::sync::Mutex::new(()),
            resync: Arc::new(Notify::new()),
        }
    }

    /// Key prefix this sync consumes.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Service name for `key`, or `None` when the key is outside the prefix.
    pub fn service_name(&self, key: &[u8]) -> Option<String> {
        let key = std::str::from_utf8(key).ok()?;
        let name = key.strip_prefix(self.prefix.as_str())?;
        if name.is_empty() {
            return None;
        }
        Some(name.to_string())
    }

    fn classify(&self, entry: &KeyValueEntry) -> Option<EntryChange> {
        let Some(name) = self.service_name(&entry.key) else {
            debug!(key = %entry.key_str(), "ignoring key outside service prefix");
            metrics::record_watch_event(WatchEventType::Skipped);
            return None;
        };

        if entry.change_type == ChangeType::Delete || entry.value.is_empty() {
            return Some(EntryChange::Delete(name));
        }

        match ServiceRecordSet::from_payload(&entry.value) {
            Ok(set) if set.is_empty() => Some(EntryChange::Delete(name)),
            Ok(set) => Some(EntryChange::Set(name, set)),
            Err(e) => {
                warn!(service = %name, error = %e, "undecodable record set, leaving zone unchanged");
                metrics::record_watch_event(WatchEventType::Undecodable);
                None
            }
        }
    }

    /// Apply one notification batch, or hold it back while a seed is scanning.
    /// `old` is accepted for symmetry with the watch callback; only the new
    /// state of each key matters.
    pub fn apply(&self, new: &[KeyValueEntry], _old: &[KeyValueEntry]) {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(batches) => batches.push(new.to_vec()),
            None => self.apply_now(new),
        }
    }

    fn apply_now(&self, new: &[KeyValueEntry]) {
        let Some(zone) = self.zone.read().clone() else {
            debug!(entries = new.len(), "no zone active, dropping notification");
            return;
        };

        for entry in new {
            match self.classify(entry) {
                Some(EntryChange::Set(name, set)) => {
                    zone.set_service(&name, set);
                    metrics::record_watch_event(WatchEventType::Put);
                }
                Some(EntryChange::Delete(name)) => {
                    zone.delete_service(&name);
                    metrics::record_watch_event(WatchEventType::Delete);
                }
                None => {}
            }
        }
        zone.emit_metrics();
    }

    /// Replace the zone contents with a full prefix scan of `store`.
    ///
    /// Returns the number of services the scan loaded, or `None` when no zone
    /// is active. Seeds run one at a time.
    pub async fn seed(&self, store: &dyn DataStore) -> Result<Option<usize>, StoreError> {
        let _one_at_a_time = self.seeding.lock().await;
        *self.held.lock() = Some(Vec::new());
        let release = HeldBatches(self);

        let scanned = store.get_by_prefix(self.prefix.as_bytes()).await;

        let mut held = self.held.lock();
        let batches = held.take().unwrap_or_default();
        let loaded = match scanned {
            Ok(result) => Ok(self.replace_from(&result.entries)),
            Err(e) => Err(e),
        };
        if !batches.is_empty() {
            debug!(batches = batches.len(), "replaying notifications received during seed");
        }
        for batch in &batches {
            self.apply_now(batch);
        }
        drop(held);
        drop(release);
        loaded
    }

    fn replace_from(&self, entries: &[KeyValueEntry]) -> Option<usize> {
        let zone = self.zone.read().clone()?;

        let services: HashMap<String, ServiceRecordSet> = entries
            .iter()
            .filter_map(|entry| match self.classify(entry) {
                Some(EntryChange::Set(name, set)) => Some((name, set)),
                Some(EntryChange::Delete(_)) | None => None,
            })
            .collect();
        let count = services.len();

        zone.replace_all(services);
        zone.emit_metrics();
        Some(count)
    }

    /// Watch callback applying every batch to the slot's zone.
    pub fn callback(self: Arc<Self>) -> WatchCallback {
        Arc::new(move |new, old| self.apply(&new, &old))
    }

    /// Resync callback for the store; wakes [`ZoneSync::resync_requested`].
    pub fn resync_callback(&self) -> ResyncCallback {
        let resync = self.resync.clone();
        Arc::new(move || resync.notify_one())
    }

    /// Resolves once the store has reported a gap in its watch.
    pub async fn resync_requested(&self) {
        self.resync.notified().await;
    }
}

/// Replays held batches if a seed is dropped before it finishes.
struct HeldBatches<'a>(&'a ZoneSync);

impl Drop for HeldBatches<'_> {
    fn drop(&mut self) {
        let mut held = self.0.held.lock();
        if let Some(batches) = held.take() {
            for batch in &batches {
                self.0.apply_now(batch);
            }
        }
    }
}
