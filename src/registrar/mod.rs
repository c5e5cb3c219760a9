//! Service registration against the record store.
//!
//! [`Registrations`] is the read-modify-write core shared by the HTTP API and
//! in-process self-registration. Writes only ever go to the store; the zone
//! follows through the watch pipeline.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::record::{ServiceRecord, ServiceRecordSet};
use crate::store::{DataStore, KeyValueEntry, Update};

pub mod http;

pub use http::{router, HttpRegistrarComponent, RegistrarShared};

/// Message returned to clients for every store or internal failure.
pub const MASKED_ERROR: &str = "internal server error";

/// Errors from a registration operation.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The caller sent something unusable; the message is echoed back.
    #[error("{0}")]
    ClientInput(String),

    /// No data store is attached to the registrar.
    #[error("data store unavailable")]
    Unavailable,

    /// The data store rejected or failed the request.
    #[error("data store error: {0}")]
    Store(#[from] StoreError),

    /// Anything else, such as an undecodable stored payload.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistrationError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RegistrationError::ClientInput(_) => StatusCode::BAD_REQUEST,
            RegistrationError::Unavailable | RegistrationError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RegistrationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients. Only client input errors are echoed.
    pub fn public_message(&self) -> String {
        match self {
            RegistrationError::ClientInput(message) => message.clone(),
            _ => MASKED_ERROR.to_string(),
        }
    }
}

impl IntoResponse for RegistrationError {
    fn into_response(self) -> Response {
        if !matches!(self, RegistrationError::ClientInput(_)) {
            warn!(error = %self, "registration request failed");
        }
        (self.status(), Json(Envelope::error(self.public_message()))).into_response()
    }
}

/// Response body for every registration API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Outcome summary.
    #[serde(rename = "Meta")]
    pub meta: Meta,
    /// Records of the service after the operation.
    #[serde(rename = "Objects")]
    pub objects: Vec<ServiceRecord>,
}

/// Outcome summary inside an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Meta {
    /// Number of objects returned.
    pub total_count: usize,
    /// False only when `error` is set.
    pub success: bool,
    /// Empty on success.
    pub error: String,
}

impl Envelope {
    /// Successful envelope carrying `records`.
    pub fn records(records: ServiceRecordSet) -> Self {
        Self {
            meta: Meta {
                total_count: records.len(),
                success: true,
                error: String::new(),
            },
            objects: records.into_records(),
        }
    }

    /// Failed envelope with no objects.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            meta: Meta {
                total_count: 0,
                success: false,
                error: message.into(),
            },
            objects: Vec::new(),
        }
    }
}

/// Body of a create, update or delete call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegistrationRequest {
    /// Endpoint port.
    #[serde(default, alias = "Port")]
    pub port: u16,
    /// Endpoint host; the caller's address when absent or empty.
    #[serde(default, alias = "Target")]
    pub target: Option<String>,
}

impl RegistrationRequest {
    /// Parse a raw request body, echoing decoder errors to the client.
    pub fn from_body(body: &[u8]) -> Result<Self, RegistrationError> {
        serde_json::from_slice(body).map_err(|e| {
            RegistrationError::ClientInput(format!(
                "unmarshal incoming json from client side error: {e}"
            ))
        })
    }

    /// Resolve the endpoint this request describes.
    ///
    /// `caller` substitutes for a missing target; a request that carries
    /// neither a target nor a port, or whose target is the root `.`, is
    /// rejected.
    pub fn into_record(self, caller: Option<IpAddr>) -> Result<ServiceRecord, RegistrationError> {
        let target = self.target.unwrap_or_default();
        let target = target.trim();

        if (target.is_empty() && self.port == 0) || target == "." {
            return Err(RegistrationError::ClientInput(
                "register data error. please, don't send blank data".to_string(),
            ));
        }

        let target = if target.is_empty() {
            let caller = caller.ok_or_else(|| {
                RegistrationError::Internal("caller address unknown".to_string())
            })?;
            target_for_address(caller)
        } else {
            crate::config::fqdn(target)
        };

        Ok(ServiceRecord::new(target, self.port))
    }
}

/// Dot-terminated target for an observed address.
///
/// Loopback becomes `127.0.0.1.` and IPv4-mapped IPv6 addresses are unwrapped.
pub fn target_for_address(addr: IpAddr) -> String {
    let addr = match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    if addr.is_loopback() {
        return format!("{}.", Ipv4Addr::LOCALHOST);
    }
    format!("{addr}.")
}

/// Read-modify-write operations on the record set stored under a service.
#[derive(Clone)]
pub struct Registrations {
    store: Arc<dyn DataStore>,
    prefix: String,
}

impl Registrations {
    /// Operate on `store`, keying services as `<prefix><service>`.
    pub fn new(store: Arc<dyn DataStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Store key of a service.
    pub fn key(&self, service: &str) -> Vec<u8> {
        format!("{}{}", self.prefix, service).into_bytes()
    }

    /// Current records of `service`; empty when unregistered.
    pub async fn read(&self, service: &str) -> Result<ServiceRecordSet, RegistrationError> {
        let result = self.store.get(&self.key(service)).await?;
        Self::decode(service, result.entries.first())
    }

    /// Append `record` to `service` unless the same endpoint is registered.
    ///
    /// Returns the resulting set. A duplicate leaves the store untouched.
    pub async fn add(
        &self,
        service: &str,
        record: ServiceRecord,
    ) -> Result<ServiceRecordSet, RegistrationError> {
        let (records, changed) = self
            .modify(service, |records| records.append(record.clone()))
            .await?;
        if changed {
            debug!(service, records = records.len(), "registered endpoint");
        } else {
            debug!(service, "endpoint already registered");
        }
        Ok(records)
    }

    /// Remove the first record of `service` matching `record`'s endpoint.
    ///
    /// Removing the last record deletes the service key.
    pub async fn remove(
        &self,
        service: &str,
        record: &ServiceRecord,
    ) -> Result<ServiceRecordSet, RegistrationError> {
        let (records, changed) = self.modify(service, |records| records.remove(record)).await?;
        match (changed, records.is_empty()) {
            (false, _) => {}
            (true, true) => debug!(service, "deregistered last endpoint, service removed"),
            (true, false) => debug!(service, records = records.len(), "deregistered endpoint"),
        }
        Ok(records)
    }

    /// Apply `change` to the stored set atomically. An emptied set deletes the key.
    async fn modify<F>(
        &self,
        service: &str,
        change: F,
    ) -> Result<(ServiceRecordSet, bool), RegistrationError>
    where
        F: Fn(&mut ServiceRecordSet) -> bool + Send + Sync,
    {
        let outcome = Mutex::new(None);
        self.store
            .update(&self.key(service), &|current| {
                let (update, result) = match Self::decode(service, current) {
                    Err(e) => (Update::Keep, Err(e)),
                    Ok(mut records) => {
                        if !change(&mut records) {
                            (Update::Keep, Ok((records, false)))
                        } else if records.is_empty() {
                            (Update::Delete, Ok((records, true)))
                        } else {
                            match records.to_payload() {
                                Ok(payload) => (Update::Put(payload), Ok((records, true))),
                                Err(e) => (Update::Keep, Err(RegistrationError::Internal(e.to_string()))),
                            }
                        }
                    }
                };
                *outcome.lock() = Some(result);
                update
            })
            .await?;

        outcome.into_inner().unwrap_or_else(|| {
            Err(RegistrationError::Internal(format!("update of {service} did not run")))
        })
    }

    fn decode(
        service: &str,
        entry: Option<&KeyValueEntry>,
    ) -> Result<ServiceRecordSet, RegistrationError> {
        match entry {
            None => Ok(ServiceRecordSet::new()),
            Some(entry) => ServiceRecordSet::from_payload(&entry.value).map_err(|e| {
                RegistrationError::Internal(format!("stored records for {service} are invalid: {e}"))
            }),
        }
    }
}
