//! Error types for discover-dns.

use std::time::Duration;
use thiserror::Error;

/// Top-level errors surfaced by the daemon.
#[derive(Debug, Error)]
pub enum DiscoverError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid manifest or component configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A component could not reach its backend
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A single store request failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Manifest could not be read or parsed
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// No built-in component matches the manifest locator
    #[error("no {role} component registered for locator {locator:?}")]
    UnknownComponent {
        /// Role the manifest entry asked for.
        role: &'static str,
        /// Locator derived from the entry's path.
        locator: String,
    },

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// A component configuration failed validation.
///
/// Every missing or invalid field is collected into `problems` so an operator
/// sees the whole list at once instead of fixing fields one reload at a time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {component} configuration: {}", problems.join("; "))]
pub struct ConfigError {
    /// Component (or file) the configuration belongs to.
    pub component: String,
    /// Human-readable description of each problem.
    pub problems: Vec<String>,
}

impl ConfigError {
    /// Build an error with a single problem.
    pub fn new(component: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            problems: vec![problem.into()],
        }
    }

    /// Build an error from a list of problems.
    pub fn with_problems(component: impl Into<String>, problems: Vec<String>) -> Self {
        Self {
            component: component.into(),
            problems,
        }
    }
}

/// A component could not establish its session, listener or connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No store endpoint answered within the dial timeout.
    #[error("no endpoint reachable within {0:?}")]
    DialTimeout(Duration),

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The backend rejected the session.
    #[error("backend connection failed: {0}")]
    Backend(String),
}

/// A single store request failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `connect` has not succeeded yet.
    #[error("data store is not connected")]
    NotConnected,

    /// The request exceeded the configured request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend returned an error.
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
