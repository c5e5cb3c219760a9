//! Startup hooks run before any other component is loaded.

use serde_json::Value;
use tracing::info;

use crate::component::StartupHook;
use crate::error::{ConfigError, DiscoverError};

/// Exports a JSON object of string pairs into the process environment.
///
/// ```json
/// { "ETCD_ENDPOINTS": "10.0.0.1:2379", "DNS_ORIGIN": "tld." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvHook {
    vars: Vec<(String, String)>,
}

impl EnvHook {
    /// Parse and validate a manifest `conf` value.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let Value::Object(map) = value else {
            return Err(ConfigError::new("env hook", "expected a JSON object of strings"));
        };

        let mut vars = Vec::with_capacity(map.len());
        let mut problems = Vec::new();
        for (key, value) in map {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                problems.push(format!("{key:?} is not a valid variable name"));
                continue;
            }
            match value {
                Value::String(s) if !s.contains('\0') => vars.push((key.clone(), s.clone())),
                Value::String(_) => problems.push(format!("{key} contains a NUL byte")),
                _ => problems.push(format!("{key} must be a string")),
            }
        }

        if !problems.is_empty() {
            return Err(ConfigError::with_problems("env hook", problems));
        }
        Ok(Self { vars })
    }

    /// Variables this hook exports, in manifest order.
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Variables whose current value differs from the one this hook exports.
    pub fn pending(&self) -> impl Iterator<Item = &(String, String)> {
        self.vars
            .iter()
            .filter(|(key, value)| std::env::var(key).ok().as_deref() != Some(value.as_str()))
    }
}

/// Writes the process environment. The binary runs hooks once before the
/// runtime starts; later runs come only from the orchestrator task and skip
/// variables that already hold their value, so a reload that leaves the hook
/// unchanged writes nothing.
impl StartupHook for EnvHook {
    fn run(&self) -> Result<(), DiscoverError> {
        let pending: Vec<_> = self.pending().collect();
        for (key, value) in pending {
            std::env::set_var(key, value);
            info!(key = %key, "exported environment variable");
        }
        Ok(())
    }
}
