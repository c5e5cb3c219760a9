//! Component roles and the built-in registry that constructs them.
//!
//! A manifest entry names a role and a locator. The locator is the file stem
//! of the entry's `path` (`./plugin/dataPlugin/etcd/etcd.so` resolves to
//! `etcd`), matched case-insensitively against the factories registered here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{DataStoreConfig, DnsResponderConfig, HttpRegistrarConfig};
use crate::error::{ConnectError, DiscoverError};
use crate::hook::EnvHook;
use crate::record::ServiceRecordSet;
use crate::registrar::{HttpRegistrarComponent, RegistrationError};
use crate::server::HickoryResponder;
use crate::state::Zone;
use crate::store::{DataStore, MemoryBackend, MemoryStore};

/// Component roles, in reload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Runs once per manifest load before anything else.
    StartupHook,
    /// Record store adapter.
    DataStore,
    /// Serves the zone over DNS.
    DnsResponder,
    /// Registration API.
    HttpRegistrar,
}

impl Role {
    /// Stable lowercase name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::StartupHook => "startup_hook",
            Role::DataStore => "data_store",
            Role::DnsResponder => "dns_responder",
            Role::HttpRegistrar => "http_registrar",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serves a [`Zone`] to DNS clients.
#[async_trait]
pub trait DnsResponder: Send + Sync {
    /// Bind listeners and start serving until `shutdown` or [`Self::close`].
    async fn connect(&self, shutdown: CancellationToken) -> Result<(), ConnectError>;

    /// Zone served by this responder.
    fn zone(&self) -> Zone;

    /// Port actually bound, once connected.
    fn listening_port(&self) -> Option<u16>;

    /// Stop serving and wait briefly for the listeners to close.
    async fn close(&self);
}

/// Registration API in front of the data store.
#[async_trait]
pub trait HttpRegistrar: Send + Sync {
    /// Prefix joined with service names to form store keys.
    fn service_prefix(&self) -> &str;

    /// Point registrations at `store`, or detach with `None`.
    fn attach_store(&self, store: Option<Arc<dyn DataStore>>);

    /// Bind the listener, start serving and announce every configured
    /// self-registration.
    async fn connect(&self, shutdown: CancellationToken) -> Result<(), ConnectError>;

    /// Announce this registrar under every configured `register[].name`.
    async fn self_register(&self) -> Result<(), RegistrationError>;

    /// Register `target:port` under `name`. An empty target means this
    /// host's advertised address.
    async fn register(
        &self,
        name: &str,
        target: &str,
        port: u16,
    ) -> Result<ServiceRecordSet, RegistrationError>;

    /// Stop serving and wait briefly for the listener to close.
    async fn close(&self);
}

/// Side effect run when a manifest is loaded.
pub trait StartupHook: Send + Sync {
    /// Run the hook.
    fn run(&self) -> Result<(), DiscoverError>;
}

type Factory<T> = Arc<dyn Fn(&Value) -> Result<Arc<T>, DiscoverError> + Send + Sync>;

/// Locator of a manifest path: its lowercase file stem.
pub fn locator_key(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| path.to_ascii_lowercase())
}

/// Compiled-in component factories keyed by locator.
pub struct ComponentRegistry {
    memory: Arc<MemoryBackend>,
    data_stores: HashMap<String, Factory<dyn DataStore>>,
    dns_responders: HashMap<String, Factory<dyn DnsResponder>>,
    http_registrars: HashMap<String, Factory<dyn HttpRegistrar>>,
    startup_hooks: HashMap<String, Factory<dyn StartupHook>>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ComponentRegistry {
    /// Registry with no factories.
    pub fn empty() -> Self {
        Self {
            memory: MemoryBackend::new(),
            data_stores: HashMap::new(),
            dns_responders: HashMap::new(),
            http_registrars: HashMap::new(),
            startup_hooks: HashMap::new(),
        }
    }

    /// Registry with every built-in component.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        let memory = registry.memory.clone();
        registry.register_data_store("memory", move |_conf| {
            Ok(Arc::new(MemoryStore::with_backend(memory.clone())) as Arc<dyn DataStore>)
        });

        #[cfg(feature = "etcd")]
        registry.register_data_store("etcd", |conf| {
            let config = DataStoreConfig::from_value(conf)?;
            Ok(Arc::new(crate::store::EtcdStore::new(config)) as Arc<dyn DataStore>)
        });
        #[cfg(not(feature = "etcd"))]
        registry.register_data_store("etcd", |conf| {
            // Validate anyway so a bad manifest is reported the same way.
            DataStoreConfig::from_value(conf)?;
            Err(DiscoverError::Config(crate::error::ConfigError::new(
                "data store",
                "etcd support is not compiled in (enable the `etcd` feature)",
            )))
        });

        for locator in ["dns", "hickory", "benburkertdns"] {
            registry.register_dns_responder(locator, |conf| {
                let config = DnsResponderConfig::from_value(conf)?;
                Ok(Arc::new(HickoryResponder::new(config)) as Arc<dyn DnsResponder>)
            });
        }

        for locator in ["http", "httpserver", "benburkertdnscompatiblehttpserver"] {
            registry.register_http_registrar(locator, |conf| {
                let config = HttpRegistrarConfig::from_value(conf)?;
                Ok(Arc::new(HttpRegistrarComponent::new(config)) as Arc<dyn HttpRegistrar>)
            });
        }

        for locator in ["env", "setenvironmentvarbyjson"] {
            registry.register_startup_hook(locator, |conf| {
                Ok(Arc::new(EnvHook::from_value(conf)?) as Arc<dyn StartupHook>)
            });
        }

        registry
    }

    /// Backing map shared by every `memory` data store this registry builds.
    pub fn memory_backend(&self) -> Arc<MemoryBackend> {
        self.memory.clone()
    }

    /// Register or replace a data store factory.
    pub fn register_data_store<F>(&mut self, locator: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn DataStore>, DiscoverError> + Send + Sync + 'static,
    {
        self.data_stores
            .insert(locator.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Register or replace a DNS responder factory.
    pub fn register_dns_responder<F>(&mut self, locator: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn DnsResponder>, DiscoverError> + Send + Sync + 'static,
    {
        self.dns_responders
            .insert(locator.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Register or replace an HTTP registrar factory.
    pub fn register_http_registrar<F>(&mut self, locator: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn HttpRegistrar>, DiscoverError> + Send + Sync + 'static,
    {
        self.http_registrars
            .insert(locator.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Register or replace a startup hook factory.
    pub fn register_startup_hook<F>(&mut self, locator: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn StartupHook>, DiscoverError> + Send + Sync + 'static,
    {
        self.startup_hooks
            .insert(locator.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Build the data store named by `path`.
    pub fn build_data_store(&self, path: &str, conf: &Value) -> Result<Arc<dyn DataStore>, DiscoverError> {
        build(&self.data_stores, Role::DataStore, path, conf)
    }

    /// Build the DNS responder named by `path`.
    pub fn build_dns_responder(
        &self,
        path: &str,
        conf: &Value,
    ) -> Result<Arc<dyn DnsResponder>, DiscoverError> {
        build(&self.dns_responders, Role::DnsResponder, path, conf)
    }

    /// Build the HTTP registrar named by `path`.
    pub fn build_http_registrar(
        &self,
        path: &str,
        conf: &Value,
    ) -> Result<Arc<dyn HttpRegistrar>, DiscoverError> {
        build(&self.http_registrars, Role::HttpRegistrar, path, conf)
    }

    /// Build the startup hook named by `path`.
    pub fn build_startup_hook(
        &self,
        path: &str,
        conf: &Value,
    ) -> Result<Arc<dyn StartupHook>, DiscoverError> {
        build(&self.startup_hooks, Role::StartupHook, path, conf)
    }
}

fn build<T: ?Sized>(
    factories: &HashMap<String, Factory<T>>,
    role: Role,
    path: &str,
    conf: &Value,
) -> Result<Arc<T>, DiscoverError> {
    let locator = locator_key(path);
    let factory = factories
        .get(&locator)
        .ok_or_else(|| DiscoverError::UnknownComponent {
            role: role.as_str(),
            locator: locator.clone(),
        })?;
    factory(conf)
}
