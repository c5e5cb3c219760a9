//! discover-dns - service discovery over DNS SRV records backed by a key-value store.
//!
//! Services register their endpoints in a key-value store (etcd, or an
//! in-process map for single-node setups and tests). The daemon mirrors every
//! key under the service prefix into a live SRV zone, and an HTTP API lets
//! services register themselves without talking to the store directly.
//!
//! ## Features
//!
//! - SRV answers that follow store changes through a watch subscription
//! - Zone seeded from a full prefix scan on every manifest load
//! - Components swapped at runtime when the manifest file changes
//! - Registration API that announces itself and the DNS responder
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          discover-dns                            │
//! │                                                                  │
//! │  plugin.json ──▶ Orchestrator ──▶ StartupHook (env)              │
//! │                       │                                          │
//! │                       ├──▶ DataStore (etcd | memory) ◀─── POST   │
//! │                       │        │ watch + scan          DELETE   │
//! │                       │        ▼                        │        │
//! │                       │    ZoneSync ──▶ Zone            │        │
//! │                       │                  │              │        │
//! │                       ├──▶ DnsResponder ◀┘ ◀── UDP/TCP  │        │
//! │                       └──▶ HttpRegistrar ───────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! alpha.tld. SRV ?
//!   → strip the origin
//!   → look up "alpha" in the zone (stored under service.discover.alpha)
//!   → one SRV answer per registered endpoint
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use discover_dns::{ComponentRegistry, DaemonConfig, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = CancellationToken::new();
//!     let orchestrator = Orchestrator::new(
//!         &DaemonConfig::default(),
//!         ComponentRegistry::with_defaults(),
//!         shutdown.clone(),
//!     );
//!     orchestrator.run().await;
//! }
//! ```

#![warn(missing_docs)]

pub mod authority;
pub mod component;
pub mod config;
pub mod error;
pub mod hook;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
pub mod record;
pub mod registrar;
pub mod server;
pub mod state;
pub mod store;
pub mod subscription;
pub mod telemetry;

// Re-export main types
pub use component::{ComponentRegistry, DnsResponder, HttpRegistrar, Role, StartupHook};
pub use config::{
    Config, DaemonConfig, DataStoreConfig, DnsResponderConfig, HttpRegistrarConfig, SoaConfig,
    TelemetryConfig,
};
pub use error::{ConfigError, ConnectError, DiscoverError, StoreError};
pub use manifest::{Manifest, ManifestEntry, ManifestWatcher};
pub use orchestrator::{Orchestrator, Phase};
pub use record::{ServiceRecord, ServiceRecordSet};
pub use server::HickoryResponder;
pub use state::Zone;
pub use store::{DataStore, KeyValueEntry, MemoryStore};
