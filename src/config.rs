//! Configuration types for discover-dns.
//!
//! Two layers of configuration exist:
//!
//! - [`Config`]: the daemon's own settings, read from TOML plus environment
//!   overrides by the binary.
//! - Component configs ([`DataStoreConfig`], [`DnsResponderConfig`],
//!   [`HttpRegistrarConfig`]): parsed from the manifest `conf` value of each
//!   component and validated eagerly, reporting every bad field at once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrator settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the component manifest (JSON array).
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    /// How often the manifest modification time is checked, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often the zone is rebuilt from a full prefix scan, in milliseconds.
    /// Zero disables periodic reseeding; watch gaps still trigger one.
    #[serde(default = "default_reseed_interval_ms")]
    pub reseed_interval_ms: u64,
}

impl DaemonConfig {
    /// Manifest poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Periodic reseed interval, `None` when disabled.
    pub fn reseed_interval(&self) -> Option<Duration> {
        (self.reseed_interval_ms > 0).then(|| Duration::from_millis(self.reseed_interval_ms))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            poll_interval_ms: default_poll_interval_ms(),
            reseed_interval_ms: default_reseed_interval_ms(),
        }
    }
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("./config/plugin.json")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reseed_interval_ms() -> u64 {
    60_000
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "discover_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Component configuration
// ---------------------------------------------------------------------------

/// Reads fields out of a component's JSON object, collecting every problem.
struct FieldReader<'a> {
    component: &'static str,
    map: &'a Map<String, Value>,
    problems: Vec<String>,
}

impl<'a> FieldReader<'a> {
    fn new(component: &'static str, value: &'a Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self {
                component,
                map,
                problems: Vec::new(),
            }),
            other => Err(ConfigError::new(
                component,
                format!("expected a JSON object, got {}", json_kind(other)),
            )),
        }
    }

    fn problem(&mut self, problem: String) {
        self.problems.push(problem);
    }

    fn optional_str(&mut self, key: &str) -> Option<String> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.problem(format!("{key} must be a string, got {}", json_kind(other)));
                None
            }
        }
    }

    fn required_str(&mut self, key: &str) -> Option<String> {
        let present = self.map.contains_key(key);
        match self.optional_str(key) {
            Some(s) if !s.is_empty() => Some(s),
            Some(_) => {
                self.problem(format!("{key} must not be empty"));
                None
            }
            None => {
                if !present {
                    self.problem(format!("{key} is missing"));
                }
                None
            }
        }
    }

    /// Integer field that may also be written as a numeric string.
    fn optional_u64(&mut self, key: &str) -> Option<u64> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_u64() {
                Some(v) => Some(v),
                None => {
                    self.problem(format!("{key} must be a non-negative integer, got {n}"));
                    None
                }
            },
            Some(Value::String(s)) => match s.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    self.problem(format!("{key} must be numeric, got {s:?}"));
                    None
                }
            },
            Some(other) => {
                self.problem(format!("{key} must be an integer, got {}", json_kind(other)));
                None
            }
        }
    }

    fn required_nonzero_u64(&mut self, key: &str) -> Option<u64> {
        let present = self.map.contains_key(key);
        match self.optional_u64(key) {
            Some(0) => {
                self.problem(format!("{key} must be greater than zero"));
                None
            }
            Some(v) => Some(v),
            None => {
                if !present {
                    self.problem(format!("{key} is missing"));
                }
                None
            }
        }
    }

    fn optional_ip(&mut self, key: &str) -> Option<IpAddr> {
        let raw = self.optional_str(key)?;
        match raw.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                self.problem(format!("{key} is not an IP address: {raw:?}"));
                None
            }
        }
    }

    fn optional_typed<T: serde::de::DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let value = self.map.get(key)?;
        if value.is_null() {
            return None;
        }
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                self.problem(format!("{key} is invalid: {e}"));
                None
            }
        }
    }

    fn finish(self) -> Result<(), ConfigError> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::with_problems(self.component, self.problems))
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Data-store connection settings.
///
/// ```json
/// {
///   "hostList": "172.18.0.1:2379,172.18.0.2:2379",
///   "keyPrefix": "dnsServerKey",
///   "dialTimeOut": 500000,
///   "requestTimeOut": 1000000
/// }
/// ```
///
/// Timeouts are expressed in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStoreConfig {
    /// Store endpoints.
    pub host_list: Vec<String>,
    /// Namespace applied to every key the adapter touches.
    pub key_prefix: String,
    /// Bound on establishing a session.
    pub dial_timeout: Duration,
    /// Bound on every individual request.
    pub request_timeout: Duration,
}

impl DataStoreConfig {
    /// Parse and validate a manifest `conf` value.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut reader = FieldReader::new("data store", value)?;

        let host_list = reader.required_str("hostList").map(|hosts| {
            hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        });
        if matches!(host_list, Some(ref hosts) if hosts.is_empty()) {
            reader.problem("hostList has no endpoints".to_string());
        }
        let key_prefix = reader.required_str("keyPrefix");
        let dial = reader.required_nonzero_u64("dialTimeOut");
        let request = reader.required_nonzero_u64("requestTimeOut");
        reader.finish()?;

        match (host_list, key_prefix, dial, request) {
            (Some(host_list), Some(key_prefix), Some(dial), Some(request)) => Ok(Self {
                host_list,
                key_prefix,
                dial_timeout: Duration::from_micros(dial),
                request_timeout: Duration::from_micros(request),
            }),
            _ => Err(ConfigError::new("data store", "incomplete configuration")),
        }
    }
}

/// DNS responder settings.
///
/// ```json
/// { "addressAndPort": ":53", "serialNumber": 1234 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponderConfig {
    /// Listen address; a bare `:port` listens on every IPv4 interface.
    pub address_and_port: String,
    /// Initial SOA serial.
    pub serial_number: u32,
    /// Zone origin (e.g. "tld.").
    pub origin: String,
    /// TTL for served records in seconds.
    pub ttl: u32,
    /// SOA record configuration.
    pub soa: SoaConfig,
}

impl DnsResponderConfig {
    /// Parse and validate a manifest `conf` value.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut reader = FieldReader::new("dns responder", value)?;

        let address_and_port = reader.required_str("addressAndPort");
        let serial_number = match reader.optional_u64("serialNumber") {
            Some(serial) => match u32::try_from(serial) {
                Ok(serial) => serial,
                Err(_) => {
                    reader.problem(format!("serialNumber {serial} does not fit in 32 bits"));
                    0
                }
            },
            None => 0,
        };
        let origin = reader.optional_str("origin").unwrap_or_else(default_origin);
        let ttl = match reader.optional_u64("ttl") {
            Some(ttl) => u32::try_from(ttl).unwrap_or_else(|_| {
                reader.problem(format!("ttl {ttl} does not fit in 32 bits"));
                default_ttl()
            }),
            None => default_ttl(),
        };
        let soa = reader.optional_typed::<SoaConfig>("soa").unwrap_or_default();
        reader.finish()?;

        let address_and_port =
            address_and_port.ok_or_else(|| ConfigError::new("dns responder", "addressAndPort is missing"))?;

        Ok(Self {
            address_and_port,
            serial_number,
            origin: fqdn(&origin),
            ttl,
            soa,
        })
    }

    /// Socket address to bind, expanding the `:port` shorthand.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = self.address_and_port.trim();
        let expanded = if raw.starts_with(':') {
            format!("0.0.0.0{raw}")
        } else {
            raw.to_string()
        };
        expanded.parse().map_err(|_| {
            ConfigError::new(
                "dns responder",
                format!("addressAndPort is not a socket address: {raw:?}"),
            )
        })
    }
}

fn default_origin() -> String {
    "tld.".to_string()
}

fn default_ttl() -> u32 {
    3600
}

/// Make sure a name ends in a dot.
pub(crate) fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// SOA (Start of Authority) record configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary nameserver hostname (e.g., "dns.tld.").
    #[serde(default = "default_mname")]
    pub mname: String,

    /// Admin mailbox in DNS format (e.g., "hostmaster.tld.").
    #[serde(default = "default_rname")]
    pub rname: String,

    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum TTL in seconds.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

fn default_mname() -> String {
    "dns.tld.".to_string()
}

fn default_rname() -> String {
    "hostmaster.tld.".to_string()
}

fn default_refresh() -> u32 {
    3600
}

fn default_retry() -> u32 {
    600
}

fn default_expire() -> u32 {
    604800
}

fn default_minimum() -> u32 {
    60
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: default_mname(),
            rname: default_rname(),
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

/// Default key prefix for service registrations.
pub const DEFAULT_SERVICE_PREFIX: &str = "service.discover.";

/// One self-registration announced by the HTTP registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTarget {
    /// URL scheme the registrar is reachable with (e.g. "http").
    #[serde(default = "default_schema", alias = "Schema")]
    pub schema: String,
    /// First path segment of the registration API (e.g. "service").
    #[serde(alias = "Endpoint")]
    pub endpoint: String,
    /// Service name the registrar announces itself under.
    #[serde(alias = "Name")]
    pub name: String,
}

fn default_schema() -> String {
    "http".to_string()
}

/// HTTP registrar settings.
///
/// ```json
/// {
///   "port": 8080,
///   "servicePrefix": "service.discover.",
///   "register": [
///     { "schema": "http", "endpoint": "service", "name": "http.service.discover" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRegistrarConfig {
    /// Listening port.
    pub port: u16,
    /// Prefix joined with a service name to form its store key.
    pub service_prefix: String,
    /// Self-registrations; their endpoints are the accepted API path roots.
    pub register: Vec<RegisterTarget>,
    /// Interface to bind.
    pub bind_address: IpAddr,
    /// Address announced by self-registration; detected when absent.
    pub advertise_address: Option<IpAddr>,
}

impl HttpRegistrarConfig {
    /// Parse and validate a manifest `conf` value.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut reader = FieldReader::new("http registrar", value)?;

        let port = match reader.required_nonzero_u64("port") {
            Some(port) => match u16::try_from(port) {
                Ok(port) => Some(port),
                Err(_) => {
                    reader.problem(format!("port {port} is out of range"));
                    None
                }
            },
            None => None,
        };
        let service_prefix = reader
            .optional_str("servicePrefix")
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_PREFIX.to_string());
        let register = reader
            .optional_typed::<Vec<RegisterTarget>>("register")
            .unwrap_or_default();
        if register.is_empty() {
            reader.problem("register must list at least one entry".to_string());
        }
        for (idx, target) in register.iter().enumerate() {
            if target.endpoint.is_empty() || target.endpoint.contains('/') {
                reader.problem(format!("register[{idx}].endpoint must be a single path segment"));
            }
            if target.name.is_empty() {
                reader.problem(format!("register[{idx}].name must not be empty"));
            }
        }
        let bind_address = reader
            .optional_ip("bindAddress")
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let advertise_address = reader.optional_ip("advertiseAddress");
        reader.finish()?;

        let port = port.ok_or_else(|| ConfigError::new("http registrar", "port is missing"))?;

        Ok(Self {
            port,
            service_prefix,
            register,
            bind_address,
            advertise_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_store_config_parses_microseconds() {
        let config = DataStoreConfig::from_value(&json!({
            "hostList": "10.0.0.1:2379, 10.0.0.2:2379",
            "keyPrefix": "dnsServerKey",
            "dialTimeOut": 500000,
            "requestTimeOut": 1000000
        }))
        .unwrap();

        assert_eq!(config.host_list, vec!["10.0.0.1:2379", "10.0.0.2:2379"]);
        assert_eq!(config.dial_timeout, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_data_store_config_reports_every_problem() {
        let err = DataStoreConfig::from_value(&json!({
            "hostList": "",
            "dialTimeOut": 0,
            "requestTimeOut": "soon"
        }))
        .unwrap_err();

        assert_eq!(err.component, "data store");
        assert_eq!(err.problems.len(), 4, "{:?}", err.problems);
        assert!(err.problems.iter().any(|p| p.contains("hostList")));
        assert!(err.problems.iter().any(|p| p.contains("keyPrefix is missing")));
        assert!(err.problems.iter().any(|p| p.contains("dialTimeOut")));
        assert!(err.problems.iter().any(|p| p.contains("requestTimeOut")));
    }

    #[test]
    fn test_data_store_config_rejects_non_object() {
        let err = DataStoreConfig::from_value(&json!(["a"])).unwrap_err();
        assert!(err.problems[0].contains("array"));
    }

    #[test]
    fn test_dns_config_accepts_string_serial() {
        let config = DnsResponderConfig::from_value(&json!({
            "addressAndPort": ":53535",
            "serialNumber": "1234"
        }))
        .unwrap();

        assert_eq!(config.serial_number, 1234);
        assert_eq!(config.origin, "tld.");
        assert_eq!(config.listen_addr().unwrap(), "0.0.0.0:53535".parse().unwrap());
    }

    #[test]
    fn test_dns_config_accepts_integer_serial_and_origin() {
        let config = DnsResponderConfig::from_value(&json!({
            "addressAndPort": "127.0.0.1:5353",
            "serialNumber": 7,
            "origin": "discover.local"
        }))
        .unwrap();

        assert_eq!(config.serial_number, 7);
        assert_eq!(config.origin, "discover.local.");
    }

    #[test]
    fn test_dns_config_rejects_bad_serial() {
        let err = DnsResponderConfig::from_value(&json!({
            "addressAndPort": ":53",
            "serialNumber": "abc"
        }))
        .unwrap_err();
        assert!(err.problems[0].contains("serialNumber"));
    }

    #[test]
    fn test_http_config_defaults_service_prefix() {
        let config = HttpRegistrarConfig::from_value(&json!({
            "port": 8080,
            "servicePrefix": "",
            "register": [{"schema": "http", "endpoint": "service", "name": "http.service.discover"}]
        }))
        .unwrap();

        assert_eq!(config.service_prefix, DEFAULT_SERVICE_PREFIX);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(config.advertise_address.is_none());
    }

    #[test]
    fn test_http_config_requires_register_and_port() {
        let err = HttpRegistrarConfig::from_value(&json!({ "register": [] })).unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("port is missing")));
        assert!(err.problems.iter().any(|p| p.contains("register")));
    }

    #[test]
    fn test_daemon_config_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.daemon.reseed_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_zero_reseed_interval_disables_reseeding() {
        let daemon = DaemonConfig {
            reseed_interval_ms: 0,
            ..DaemonConfig::default()
        };
        assert_eq!(daemon.reseed_interval(), None);
    }
}
