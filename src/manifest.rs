//! Component manifest parsing and change detection.
//!
//! The manifest is a JSON array; each entry names a role, a locator path and
//! the component configuration:
//!
//! ```json
//! [
//!   { "type": "pluginOnLoad", "path": "./plugin/onLoad/env.so", "conf": ["./config/env.json"] },
//!   { "type": "pluginData", "path": "./plugin/dataPlugin/etcd/etcd.so", "conf": "./config/etcd.json" },
//!   { "type": "pluginDns", "path": "./plugin/dns/dns.so", "conf": { "addressAndPort": ":53" } },
//!   { "type": "pluginHttpServer", "path": "./plugin/http/http.so", "conf": ["./config/http.json"] }
//! ]
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::component::Role;
use crate::error::{ConfigError, DiscoverError};

/// Role named by a manifest `type` tag.
pub fn role_for_type(tag: &str) -> Option<Role> {
    match tag {
        "pluginOnLoad" | "startupHook" => Some(Role::StartupHook),
        "pluginData" | "dataStore" => Some(Role::DataStore),
        "pluginDns" | "dnsResponder" => Some(Role::DnsResponder),
        "pluginHttpServer" | "httpRegistrar" => Some(Role::HttpRegistrar),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    conf: Value,
}

/// One component to load.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    /// Role the component fills.
    pub role: Role,
    /// Locator path; its file stem selects the implementation.
    pub path: String,
    /// Configuration as written in the manifest, before file resolution.
    pub conf: Value,
}

impl ManifestEntry {
    /// Resolve `conf` into the component's configuration object.
    ///
    /// Accepts an inline object, a string naming a JSON file, or an array whose
    /// first element is either of those. `null` stays `null`.
    pub fn resolve_conf(&self) -> Result<Value, DiscoverError> {
        resolve(&self.conf)
    }
}

fn resolve(conf: &Value) -> Result<Value, DiscoverError> {
    match conf {
        Value::Null | Value::Object(_) => Ok(conf.clone()),
        Value::String(path) => read_conf_file(Path::new(path)),
        Value::Array(items) => match items.first() {
            Some(first @ (Value::String(_) | Value::Object(_))) => resolve(first),
            Some(_) | None => Err(ConfigError::new(
                "manifest",
                "conf array must start with a file path or an object",
            )
            .into()),
        },
        Value::Bool(_) | Value::Number(_) => {
            Err(ConfigError::new("manifest", "conf must be an object, a file path or an array").into())
        }
    }
}

fn read_conf_file(path: &Path) -> Result<Value, DiscoverError> {
    let component = path.display().to_string();
    let bytes = fs::read(path)
        .map_err(|e| ConfigError::new(component.clone(), format!("cannot read file: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ConfigError::new(component, format!("invalid JSON: {e}")).into())
}

/// Parsed manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    /// Entries in file order. Unknown types are dropped at parse time.
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, DiscoverError> {
        let raw: Vec<RawEntry> =
            serde_json::from_slice(bytes).map_err(|e| DiscoverError::Manifest(e.to_string()))?;

        let entries = raw
            .into_iter()
            .filter_map(|entry| match role_for_type(&entry.kind) {
                Some(role) => Some(ManifestEntry {
                    role,
                    path: entry.path,
                    conf: entry.conf,
                }),
                None => {
                    warn!(kind = %entry.kind, path = %entry.path, "ignoring manifest entry of unknown type");
                    None
                }
            })
            .collect();

        Ok(Self { entries })
    }

    /// Read and parse the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self, DiscoverError> {
        let bytes = fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Entries for one role, in file order.
    pub fn entries_for(&self, role: Role) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(move |e| e.role == role)
    }
}

/// Reports a freshly parsed manifest whenever the file's modification time
/// changes.
#[derive(Debug)]
pub struct ManifestWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ManifestWatcher {
    /// Watch `path`. The first successful [`Self::poll`] always reports.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    /// Watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the file is missing or unchanged; otherwise the parse result.
    ///
    /// A parse failure still records the modification time, so a broken
    /// manifest is reported once rather than on every poll.
    pub fn poll(&mut self) -> Option<Result<Manifest, DiscoverError>> {
        let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "manifest not readable");
                return None;
            }
        };

        if self.last_modified == Some(modified) {
            return None;
        }
        self.last_modified = Some(modified);
        Some(Manifest::load(&self.path))
    }
}
