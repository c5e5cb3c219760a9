//! Manifest-driven lifecycle of the daemon's components.
//!
//! Each time the manifest's modification time changes the orchestrator
//! reloads it in role order (startup hooks, data store, DNS responder, HTTP
//! registrar), retiring the previous instance of every role the manifest
//! names, then wires the survivors together:
//!
//! 1. the registrar writes into the data store,
//! 2. the store's watch feeds the responder's zone,
//! 3. the responder's port is registered as `dns.service.discover`,
//! 4. a full prefix scan seeds the zone and marks it ready.
//!
//! Between reloads the zone is reseeded from a full scan whenever the store
//! reports a gap in its watch, and on a fixed interval.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::{locator_key, ComponentRegistry, DnsResponder, HttpRegistrar, Role};
use crate::config::DaemonConfig;
use crate::error::{ConnectError, DiscoverError};
use crate::manifest::{Manifest, ManifestEntry, ManifestWatcher};
use crate::metrics::{self, ReloadResult, ReseedTrigger};
use crate::state::Zone;
use crate::store::{DataStore, KeyValueEntry};
use crate::subscription::{ZoneSlot, ZoneSync};

/// Service name under which the DNS responder announces itself.
pub const DNS_SELF_SERVICE: &str = "dns.service.discover";

/// Key written and read back to prove a freshly connected store works.
pub const LIVENESS_KEY: &str = "discover-dns.liveness";

/// Where the orchestrator is in its reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No manifest applied yet.
    Idle,
    /// Manifest parsed, components being replaced.
    ManifestLoaded,
    /// Components loaded, being wired together.
    ComponentsWired,
    /// Steady state.
    Running,
}

struct Active<T: ?Sized> {
    instance: Arc<T>,
    locator: String,
    generation: u64,
}

/// Components currently serving, at most one per role.
#[derive(Default)]
pub struct ActiveRoles {
    store: Option<Active<dyn DataStore>>,
    dns: Option<Active<dyn DnsResponder>>,
    http: Option<Active<dyn HttpRegistrar>>,
}

impl ActiveRoles {
    /// Active data store.
    pub fn store(&self) -> Option<Arc<dyn DataStore>> {
        self.store.as_ref().map(|a| a.instance.clone())
    }

    /// Active DNS responder.
    pub fn dns(&self) -> Option<Arc<dyn DnsResponder>> {
        self.dns.as_ref().map(|a| a.instance.clone())
    }

    /// Active HTTP registrar.
    pub fn http(&self) -> Option<Arc<dyn HttpRegistrar>> {
        self.http.as_ref().map(|a| a.instance.clone())
    }

    /// Locator of the component filling `role`, if any.
    pub fn locator(&self, role: Role) -> Option<&str> {
        match role {
            Role::StartupHook => None,
            Role::DataStore => self.store.as_ref().map(|a| a.locator.as_str()),
            Role::DnsResponder => self.dns.as_ref().map(|a| a.locator.as_str()),
            Role::HttpRegistrar => self.http.as_ref().map(|a| a.locator.as_str()),
        }
    }
}

/// Store generation and prefix the current watch was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchBinding {
    store_generation: u64,
    prefix: String,
}

/// Loads the manifest and keeps the component graph consistent with it.
pub struct Orchestrator {
    registry: ComponentRegistry,
    watcher: ManifestWatcher,
    poll_interval: Duration,
    reseed_interval: Option<Duration>,
    shutdown: CancellationToken,
    roles: ActiveRoles,
    phase: Phase,
    generation: u64,
    zone_slot: ZoneSlot,
    sync: Option<Arc<ZoneSync>>,
    watch: Option<WatchBinding>,
}

impl Orchestrator {
    /// Create an orchestrator; nothing is loaded until the first poll.
    ///
    /// Components are stopped when `shutdown` is cancelled.
    pub fn new(config: &DaemonConfig, registry: ComponentRegistry, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            watcher: ManifestWatcher::new(config.manifest_path.clone()),
            poll_interval: config.poll_interval(),
            reseed_interval: config.reseed_interval(),
            shutdown,
            roles: ActiveRoles::default(),
            phase: Phase::Idle,
            generation: 0,
            zone_slot: Arc::new(RwLock::new(None)),
            sync: None,
            watch: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Components currently serving.
    pub fn roles(&self) -> &ActiveRoles {
        &self.roles
    }

    /// Zone of the active DNS responder.
    pub fn zone(&self) -> Option<Zone> {
        self.zone_slot.read().clone()
    }

    /// Reload if the manifest changed. Returns `true` when a manifest was applied.
    pub async fn poll_once(&mut self) -> bool {
        match self.watcher.poll() {
            None => false,
            Some(Err(e)) => {
                error!(
                    path = %self.watcher.path().display(),
                    error = %e,
                    "manifest rejected, keeping running components"
                );
                metrics::record_manifest_reload(ReloadResult::Invalid);
                false
            }
            Some(Ok(manifest)) => {
                self.apply(manifest).await;
                true
            }
        }
    }

    /// Poll the manifest until `shutdown` is cancelled, then stop every component.
    ///
    /// Also reseeds the zone when the store reports a watch gap and, if
    /// configured, on every reseed interval.
    pub async fn run(mut self) {
        info!(
            path = %self.watcher.path().display(),
            interval = ?self.poll_interval,
            reseed_interval = ?self.reseed_interval,
            "watching manifest"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reseed_timer = self.reseed_interval.map(|period| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            let sync = self.sync.clone();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("orchestrator shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                _ = resync_requested(sync) => {
                    self.reseed(ReseedTrigger::WatchResync).await;
                }
                _ = next_tick(reseed_timer.as_mut()) => {
                    self.reseed(ReseedTrigger::Periodic).await;
                }
            }
        }

        self.close_all().await;
    }

    /// Reconcile the running components with `manifest`.
    pub async fn apply(&mut self, manifest: Manifest) {
        self.generation += 1;
        self.phase = Phase::ManifestLoaded;
        info!(
            generation = self.generation,
            entries = manifest.entries.len(),
            "applying manifest"
        );

        for entry in manifest.entries_for(Role::StartupHook) {
            self.run_hook(entry);
        }
        for entry in manifest.entries_for(Role::DataStore) {
            self.load_store(entry).await;
        }
        for entry in manifest.entries_for(Role::DnsResponder) {
            self.load_dns(entry).await;
        }
        for entry in manifest.entries_for(Role::HttpRegistrar) {
            self.load_http(entry).await;
        }

        self.phase = Phase::ComponentsWired;
        self.wire().await;

        self.phase = Phase::Running;
        metrics::record_manifest_reload(ReloadResult::Applied);
        info!(
            generation = self.generation,
            store = self.roles.locator(Role::DataStore).unwrap_or("-"),
            dns = self.roles.locator(Role::DnsResponder).unwrap_or("-"),
            http = self.roles.locator(Role::HttpRegistrar).unwrap_or("-"),
            "manifest applied"
        );
    }

    /// Run the manifest's startup hooks once, outside any reload.
    ///
    /// Meant to be called before the async runtime starts its worker threads,
    /// so hooks that write the process environment do so single-threaded.
    /// Returns how many hooks ran.
    pub fn run_startup_hooks(&self) -> Result<usize, DiscoverError> {
        let manifest = Manifest::load(self.watcher.path())?;
        let mut ran = 0;
        for entry in manifest.entries_for(Role::StartupHook) {
            self.run_hook(entry);
            ran += 1;
        }
        Ok(ran)
    }

    fn run_hook(&self, entry: &ManifestEntry) {
        let locator = locator_key(&entry.path);
        let result = entry
            .resolve_conf()
            .and_then(|conf| self.registry.build_startup_hook(&entry.path, &conf))
            .and_then(|hook| hook.run());

        metrics::record_component_load(Role::StartupHook.as_str(), &locator, result.is_ok());
        match result {
            Ok(()) => info!(%locator, "startup hook ran"),
            Err(e) => warn!(%locator, error = %e, "startup hook failed"),
        }
    }

    async fn load_store(&mut self, entry: &ManifestEntry) {
        if let Some(previous) = self.roles.store.take() {
            debug!(locator = %previous.locator, "retiring data store");
            previous.instance.close().await;
        }
        self.watch = None;

        let locator = locator_key(&entry.path);
        let result = match entry
            .resolve_conf()
            .and_then(|conf| self.registry.build_data_store(&entry.path, &conf))
        {
            Ok(store) => connect_store(store).await,
            Err(e) => Err(e),
        };

        metrics::record_component_load(Role::DataStore.as_str(), &locator, result.is_ok());
        match result {
            Ok(store) => {
                info!(%locator, "data store connected");
                self.roles.store = Some(Active {
                    instance: store,
                    locator,
                    generation: self.generation,
                });
            }
            Err(e) => warn!(%locator, error = %e, "data store unavailable"),
        }
    }

    async fn load_dns(&mut self, entry: &ManifestEntry) {
        if let Some(previous) = self.roles.dns.take() {
            debug!(locator = %previous.locator, "retiring DNS responder");
            *self.zone_slot.write() = None;
            previous.instance.close().await;
        }

        let locator = locator_key(&entry.path);
        let result = match entry
            .resolve_conf()
            .and_then(|conf| self.registry.build_dns_responder(&entry.path, &conf))
        {
            Ok(dns) => match dns.connect(self.shutdown.clone()).await {
                Ok(()) => Ok(dns),
                Err(e) => Err(DiscoverError::from(e)),
            },
            Err(e) => Err(e),
        };

        metrics::record_component_load(Role::DnsResponder.as_str(), &locator, result.is_ok());
        match result {
            Ok(dns) => {
                info!(%locator, port = ?dns.listening_port(), "DNS responder serving");
                *self.zone_slot.write() = Some(dns.zone());
                self.roles.dns = Some(Active {
                    instance: dns,
                    locator,
                    generation: self.generation,
                });
            }
            Err(e) => warn!(%locator, error = %e, "DNS responder unavailable"),
        }
    }

    async fn load_http(&mut self, entry: &ManifestEntry) {
        if let Some(previous) = self.roles.http.take() {
            debug!(locator = %previous.locator, "retiring registration API");
            previous.instance.close().await;
        }

        let locator = locator_key(&entry.path);
        let result = match entry
            .resolve_conf()
            .and_then(|conf| self.registry.build_http_registrar(&entry.path, &conf))
        {
            Ok(http) => {
                http.attach_store(self.roles.store());
                match http.connect(self.shutdown.clone()).await {
                    Ok(()) => Ok(http),
                    Err(e) => Err(DiscoverError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        metrics::record_component_load(Role::HttpRegistrar.as_str(), &locator, result.is_ok());
        match result {
            Ok(http) => {
                info!(%locator, prefix = %http.service_prefix(), "registration API serving");
                self.roles.http = Some(Active {
                    instance: http,
                    locator,
                    generation: self.generation,
                });
            }
            Err(e) => warn!(%locator, error = %e, "registration API unavailable"),
        }
    }

    async fn wire(&mut self) {
        let store = self.roles.store();
        let http = self.roles.http();
        let dns = self.roles.dns();

        if let Some(http) = &http {
            http.attach_store(store.clone());
        }

        let (Some(store), Some(http)) = (store, http) else {
            debug!("store or registrar missing, skipping zone wiring");
            return;
        };
        let prefix = http.service_prefix().to_string();

        let binding = WatchBinding {
            store_generation: self.roles.store.as_ref().map_or(0, |a| a.generation),
            prefix: prefix.clone(),
        };
        if self.watch.as_ref() != Some(&binding) {
            let sync = Arc::new(ZoneSync::new(prefix.clone(), self.zone_slot.clone()));
            store.set_on_watch(sync.clone().callback());
            store.set_on_resync(sync.resync_callback());
            store.watch(prefix.as_bytes());
            info!(%prefix, "watching store for service changes");
            self.sync = Some(sync);
            self.watch = Some(binding);
        }

        let Some(dns) = dns else {
            debug!("no DNS responder, skipping seeding");
            return;
        };

        match dns.listening_port() {
            Some(port) => match http.register(DNS_SELF_SERVICE, "", port).await {
                Ok(records) => info!(port, records = records.len(), "registered DNS responder"),
                Err(e) => warn!(error = %e, "failed to register DNS responder"),
            },
            None => warn!("DNS responder has no bound port, not registering it"),
        }

        self.reseed(ReseedTrigger::ManifestLoad).await;
    }

    /// Rebuild the active zone from a full scan of the wired store.
    ///
    /// The zone is marked ready only after a scan actually landed in it.
    pub async fn reseed(&self, trigger: ReseedTrigger) {
        let (Some(sync), Some(store)) = (&self.sync, self.roles.store()) else {
            debug!(trigger = trigger.as_str(), "store not wired, skipping reseed");
            return;
        };

        metrics::record_zone_reseed(trigger);
        match sync.seed(store.as_ref()).await {
            Ok(Some(loaded)) => match self.zone() {
                Some(zone) => {
                    zone.mark_ready();
                    zone.emit_metrics();
                    info!(
                        trigger = trigger.as_str(),
                        services = loaded,
                        serial = zone.serial(),
                        "zone seeded"
                    );
                }
                None => debug!(trigger = trigger.as_str(), "responder retired during reseed"),
            },
            Ok(None) => debug!(trigger = trigger.as_str(), "no DNS responder, nothing to seed"),
            Err(e) => warn!(
                trigger = trigger.as_str(),
                error = %e,
                "failed to seed zone, keeping previous contents"
            ),
        }
    }

    async fn close_all(&mut self) {
        if let Some(http) = self.roles.http.take() {
            http.instance.close().await;
        }
        if let Some(dns) = self.roles.dns.take() {
            *self.zone_slot.write() = None;
            dns.instance.close().await;
        }
        if let Some(store) = self.roles.store.take() {
            store.instance.close().await;
        }
        self.watch = None;
        self.sync = None;
        info!("all components stopped");
    }
}

/// Connect `store` and prove it with a write followed by a read.
async fn connect_store(store: Arc<dyn DataStore>) -> Result<Arc<dyn DataStore>, DiscoverError> {
    store.connect().await?;

    let probe = KeyValueEntry::put(LIVENESS_KEY, "ok");
    let check = async {
        store.put(probe.clone()).await?;
        let read = store.get(LIVENESS_KEY.as_bytes()).await?;
        Ok::<bool, DiscoverError>(read.entries.iter().any(|e| e.value == probe.value))
    };

    match check.await {
        Ok(true) => Ok(store),
        Ok(false) => {
            store.close().await;
            Err(ConnectError::Backend(
                "liveness probe read back a different value".to_string(),
            )
            .into())
        }
        Err(e) => {
            store.close().await;
            Err(e)
        }
    }
}

async fn resync_requested(sync: Option<Arc<ZoneSync>>) {
    match sync {
        Some(sync) => sync.resync_requested().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: Option<&mut tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
