//! Metrics instrumentation for discover-dns.
//!
//! All metrics are prefixed with `discover_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::NotReady => "not_ready",
        QueryResult::Error => "error",
    };

    counter!("discover_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("discover_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Query returned records successfully.
    Success,
    /// Name not found.
    NxDomain,
    /// Zone not seeded yet.
    NotReady,
    /// Query failed with an error.
    Error,
}

/// Record one applied watch notification entry.
pub fn record_watch_event(event: WatchEventType) {
    let event_str = match event {
        WatchEventType::Put => "put",
        WatchEventType::Delete => "delete",
        WatchEventType::Skipped => "skipped",
        WatchEventType::Undecodable => "undecodable",
    };

    counter!("discover_dns.watch.event.count", "event" => event_str).increment(1);
}

/// Watch entry outcomes.
#[derive(Debug, Clone, Copy)]
pub enum WatchEventType {
    /// Record set replaced.
    Put,
    /// Service removed.
    Delete,
    /// Key outside the service prefix.
    Skipped,
    /// Value could not be decoded.
    Undecodable,
}

/// Record notifications dropped by a slow in-memory watcher.
pub fn record_watch_lag(skipped: u64) {
    counter!("discover_dns.watch.lagged.count").increment(skipped);
}

/// Record a watch that asked its consumer to rescan.
pub fn record_watch_resync(reason: ResyncReason) {
    let reason_str = match reason {
        ResyncReason::Lagged => "lagged",
        ResyncReason::Error => "error",
        ResyncReason::StreamEnded => "stream_ended",
    };

    counter!("discover_dns.watch.resync.count", "reason" => reason_str).increment(1);
}

/// Why a watch lost continuity.
#[derive(Debug, Clone, Copy)]
pub enum ResyncReason {
    /// Consumer fell behind and notifications were dropped.
    Lagged,
    /// Subscription failed and was re-established.
    Error,
    /// Subscription closed by the store and was re-established.
    StreamEnded,
}

/// Record a full zone reseed from a prefix scan.
pub fn record_zone_reseed(trigger: ReseedTrigger) {
    counter!("discover_dns.zone.reseed.count", "trigger" => trigger.as_str()).increment(1);
}

/// What started a reseed.
#[derive(Debug, Clone, Copy)]
pub enum ReseedTrigger {
    /// Components were (re)wired after a manifest load.
    ManifestLoad,
    /// The store reported a gap in its watch.
    WatchResync,
    /// The periodic reseed timer fired.
    Periodic,
}

impl ReseedTrigger {
    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReseedTrigger::ManifestLoad => "manifest_load",
            ReseedTrigger::WatchResync => "watch_resync",
            ReseedTrigger::Periodic => "periodic",
        }
    }
}

/// Record the zone size (call on change).
pub fn record_zone_counts(services: usize, records: usize) {
    gauge!("discover_dns.zone.services.count").set(services as f64);
    gauge!("discover_dns.zone.records.count").set(records as f64);
}

/// Record readiness state.
pub fn record_ready_state(ready: bool) {
    gauge!("discover_dns.zone.ready").set(if ready { 1.0 } else { 0.0 });
}

/// Record the SOA serial number.
pub fn record_serial(serial: u32) {
    gauge!("discover_dns.zone.serial").set(serial as f64);
}

/// Record a manifest reload.
pub fn record_manifest_reload(result: ReloadResult) {
    let result_str = match result {
        ReloadResult::Applied => "applied",
        ReloadResult::Invalid => "invalid",
    };

    counter!("discover_dns.manifest.reload.count", "result" => result_str).increment(1);
}

/// Manifest reload outcomes.
#[derive(Debug, Clone, Copy)]
pub enum ReloadResult {
    /// Manifest parsed and reconciled.
    Applied,
    /// Manifest unreadable; running components kept.
    Invalid,
}

/// Record a component load attempt.
pub fn record_component_load(role: &str, locator: &str, ok: bool) {
    counter!(
        "discover_dns.component.load.count",
        "role" => role.to_string(),
        "locator" => locator.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a registration API call.
pub fn record_registration(method: &str, status: u16, duration: std::time::Duration) {
    counter!(
        "discover_dns.registration.count",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("discover_dns.registration.duration.seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record SRV answers returned for a successful lookup.
pub fn record_srv_records_returned(count: usize) {
    histogram!("discover_dns.query.srv.records_returned").record(count as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
