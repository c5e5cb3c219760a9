//! In-memory DNS zone mirrored from the record store.
//!
//! Service names are stored relative to the zone origin and lowercased, so
//! `alpha` is served as `alpha.<origin>`. A name may itself contain dots
//! (`dns.service.discover`).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::metrics;
use crate::record::{ServiceRecord, ServiceRecordSet};

/// Thread-safe in-memory zone.
///
/// Clones share the same underlying state. Every mutation takes the write lock
/// once, so readers observe either the state before or after a call.
#[derive(Debug, Clone)]
pub struct Zone {
    inner: Arc<RwLock<ZoneInner>>,
}

#[derive(Debug, Default)]
struct ZoneInner {
    /// service name -> record set (never empty)
    services: HashMap<String, ServiceRecordSet>,

    /// Serial number for SOA (incremented on changes)
    serial: u32,

    /// True after the first seeding pass
    ready: bool,
}

impl Default for Zone {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl Zone {
    /// Create an empty, not-ready zone with serial zero.
    pub fn new() -> Self {
        Self::with_serial(0)
    }

    /// Create an empty zone whose SOA serial starts at `serial`.
    pub fn with_serial(serial: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ZoneInner {
                serial,
                ..Default::default()
            })),
        }
    }

    /// Replace the whole zone. Empty sets in `services` are dropped.
    pub fn replace_all(&self, services: HashMap<String, ServiceRecordSet>) {
        let mut inner = self.inner.write();
        inner.services = services
            .into_iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(name, set)| (normalize(&name), set))
            .collect();
        inner.serial = inner.serial.wrapping_add(1);
        debug!(services = inner.services.len(), "replaced zone contents");
    }

    /// Replace the records of one service; an empty set deletes it.
    pub fn set_service(&self, name: &str, records: ServiceRecordSet) {
        if records.is_empty() {
            self.delete_service(name);
            return;
        }

        let name = normalize(name);
        let mut inner = self.inner.write();
        debug!(service = %name, records = records.len(), "setting service");
        inner.services.insert(name, records);
        inner.serial = inner.serial.wrapping_add(1);
    }

    /// Append one record unless the same `(target, port)` is already served.
    ///
    /// Returns `true` when the zone changed.
    pub fn append_record(&self, name: &str, record: ServiceRecord) -> bool {
        let name = normalize(name);
        let mut inner = self.inner.write();
        let changed = inner.services.entry(name.clone()).or_default().append(record);
        if changed {
            debug!(service = %name, "appended record");
            inner.serial = inner.serial.wrapping_add(1);
        }
        changed
    }

    /// Remove the first record matching `(target, port)`. Removing the last
    /// record removes the service.
    ///
    /// Returns `true` when the zone changed.
    pub fn remove_record(&self, name: &str, record: &ServiceRecord) -> bool {
        let name = normalize(name);
        let mut inner = self.inner.write();
        let Some(set) = inner.services.get_mut(&name) else {
            return false;
        };
        if !set.remove(record) {
            return false;
        }
        if set.is_empty() {
            inner.services.remove(&name);
            debug!(service = %name, "removed last record, service deleted");
        } else {
            debug!(service = %name, "removed record");
        }
        inner.serial = inner.serial.wrapping_add(1);
        true
    }

    /// Remove a service and all of its records.
    pub fn delete_service(&self, name: &str) {
        let name = normalize(name);
        let mut inner = self.inner.write();
        if inner.services.remove(&name).is_some() {
            debug!(service = %name, "deleted service");
            inner.serial = inner.serial.wrapping_add(1);
        }
    }

    /// Records currently served for `name`, or `None` when absent.
    pub fn lookup(&self, name: &str) -> Option<ServiceRecordSet> {
        self.inner.read().services.get(&normalize(name)).cloned()
    }

    /// Snapshot of every service.
    pub fn services(&self) -> HashMap<String, ServiceRecordSet> {
        self.inner.read().services.clone()
    }

    /// Number of services served.
    pub fn service_count(&self) -> usize {
        self.inner.read().services.len()
    }

    /// Get current SOA serial.
    pub fn serial(&self) -> u32 {
        self.inner.read().serial
    }

    /// Check if the zone has been seeded and may answer queries.
    pub fn is_ready(&self) -> bool {
        self.inner.read().ready
    }

    /// Mark the zone as seeded.
    pub fn mark_ready(&self) {
        let mut inner = self.inner.write();
        inner.ready = true;
        debug!(services = inner.services.len(), "zone ready");
    }

    /// Emit current zone metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        let records = inner.services.values().map(ServiceRecordSet::len).sum();

        metrics::record_zone_counts(inner.services.len(), records);
        metrics::record_ready_state(inner.ready);
        metrics::record_serial(inner.serial);
    }
}
