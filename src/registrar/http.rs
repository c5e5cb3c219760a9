//! HTTP registration API and the registrar component serving it.
//!
//! Routes are `/{endpoint}/{service}` where `endpoint` is one of the
//! configured `register[].endpoint` values:
//!
//! - `POST` / `PUT` append an endpoint (body `{"port": 8080, "target": "10.0.0.1."}`)
//! - `GET` returns the current records
//! - `DELETE` removes one endpoint (same body as `POST`)

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Envelope, RegistrationError, RegistrationRequest, Registrations};
use crate::component::HttpRegistrar;
use crate::config::HttpRegistrarConfig;
use crate::error::ConnectError;
use crate::metrics::{self, Timer};
use crate::record::{ServiceRecord, ServiceRecordSet};
use crate::store::DataStore;

/// How long `close` waits for the serving task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the router and the component.
pub struct RegistrarShared {
    endpoints: Vec<String>,
    prefix: String,
    store: RwLock<Option<Arc<dyn DataStore>>>,
}

impl RegistrarShared {
    /// Accept `endpoints` as path roots and key services under `prefix`.
    pub fn new(endpoints: Vec<String>, prefix: impl Into<String>) -> Self {
        Self {
            endpoints,
            prefix: prefix.into(),
            store: RwLock::new(None),
        }
    }

    /// Replace the store registrations are written to.
    pub fn attach_store(&self, store: Option<Arc<dyn DataStore>>) {
        *self.store.write() = store;
    }

    fn registrations(&self) -> Result<Registrations, RegistrationError> {
        let store = self.store.read().clone().ok_or(RegistrationError::Unavailable)?;
        Ok(Registrations::new(store, self.prefix.clone()))
    }

    fn accepts(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|e| e == endpoint)
    }
}

/// Build the registration router over `shared`.
pub fn router(shared: Arc<RegistrarShared>) -> Router {
    Router::new()
        .route(
            "/:endpoint/:service",
            get(get_service)
                .post(put_service)
                .put(put_service)
                .delete(delete_service),
        )
        .fallback(not_found)
        .with_state(shared)
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(Envelope::error("not found"))).into_response()
}

fn respond(method: &Method, timer: Timer, result: Result<ServiceRecordSet, RegistrationError>) -> Response {
    let response = match result {
        Ok(records) => (StatusCode::OK, Json(Envelope::records(records))).into_response(),
        Err(e) => e.into_response(),
    };
    metrics::record_registration(method.as_str(), response.status().as_u16(), timer.elapsed());
    response
}

async fn read_records(
    shared: &RegistrarShared,
    service: &str,
) -> Result<ServiceRecordSet, RegistrationError> {
    shared.registrations()?.read(service).await
}

async fn add_record(
    shared: &RegistrarShared,
    service: &str,
    caller: Option<IpAddr>,
    body: &[u8],
) -> Result<ServiceRecordSet, RegistrationError> {
    let record = RegistrationRequest::from_body(body)?.into_record(caller)?;
    shared.registrations()?.add(service, record).await
}

async fn remove_record(
    shared: &RegistrarShared,
    service: &str,
    caller: Option<IpAddr>,
    body: &[u8],
) -> Result<ServiceRecordSet, RegistrationError> {
    let record = RegistrationRequest::from_body(body)?.into_record(caller)?;
    shared.registrations()?.remove(service, &record).await
}

async fn get_service(
    method: Method,
    State(shared): State<Arc<RegistrarShared>>,
    Path((endpoint, service)): Path<(String, String)>,
) -> Response {
    let timer = Timer::start();
    if !shared.accepts(&endpoint) {
        debug!(endpoint = %endpoint, "unknown registration endpoint");
        return not_found().await;
    }

    let result = read_records(&shared, &service).await;
    respond(&method, timer, result)
}

async fn put_service(
    method: Method,
    State(shared): State<Arc<RegistrarShared>>,
    Path((endpoint, service)): Path<(String, String)>,
    caller: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let timer = Timer::start();
    if !shared.accepts(&endpoint) {
        debug!(endpoint = %endpoint, "unknown registration endpoint");
        return not_found().await;
    }

    let caller = caller.map(|ConnectInfo(addr)| addr.ip());
    let result = add_record(&shared, &service, caller, &body).await;
    respond(&method, timer, result)
}

async fn delete_service(
    method: Method,
    State(shared): State<Arc<RegistrarShared>>,
    Path((endpoint, service)): Path<(String, String)>,
    caller: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let timer = Timer::start();
    if !shared.accepts(&endpoint) {
        debug!(endpoint = %endpoint, "unknown registration endpoint");
        return not_found().await;
    }

    let caller = caller.map(|ConnectInfo(addr)| addr.ip());
    let result = remove_record(&shared, &service, caller, &body).await;
    respond(&method, timer, result)
}

/// First outbound IPv4 address of this host, or loopback when none is routable.
///
/// Connecting a UDP socket sends nothing; it only selects a source address.
pub fn detect_advertise_address() -> IpAddr {
    let detected = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match detected {
        Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Registrar component: serves the registration API and announces itself.
pub struct HttpRegistrarComponent {
    config: HttpRegistrarConfig,
    shared: Arc<RegistrarShared>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpRegistrarComponent {
    /// Create a registrar; nothing is bound until [`HttpRegistrar::connect`].
    pub fn new(config: HttpRegistrarConfig) -> Self {
        let endpoints = config.register.iter().map(|r| r.endpoint.clone()).collect();
        let shared = Arc::new(RegistrarShared::new(endpoints, config.service_prefix.clone()));
        Self {
            config,
            shared,
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn advertise_address(&self) -> IpAddr {
        self.config
            .advertise_address
            .unwrap_or_else(detect_advertise_address)
    }
}

#[async_trait]
impl HttpRegistrar for HttpRegistrarComponent {
    fn service_prefix(&self) -> &str {
        &self.config.service_prefix
    }

    fn attach_store(&self, store: Option<Arc<dyn DataStore>>) {
        self.shared.attach_store(store);
    }

    async fn connect(&self, shutdown: CancellationToken) -> Result<(), ConnectError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = crate::server::bind_tcp(addr).await?;
        let bound = listener.local_addr().map_err(|source| ConnectError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        *self.local_addr.lock() = Some(bound);

        let token = shutdown.child_token();
        let app = router(self.shared.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let serve_token = token.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                serve_token.cancelled().await;
            });
            if let Err(e) = server.await {
                error!("registration API error: {}", e);
            }
            info!(addr = %bound, "registration API stopped");
        });
        info!(addr = %bound, prefix = %self.config.service_prefix, "registration API listening");

        if let Some(previous) = self.shutdown.lock().replace(token) {
            previous.cancel();
        }
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }

        if let Err(e) = self.self_register().await {
            warn!(error = %e, "self-registration failed");
        }
        Ok(())
    }

    async fn self_register(&self) -> Result<(), RegistrationError> {
        let port = match self.local_addr() {
            Some(addr) => addr.port(),
            None => self.config.port,
        };
        for target in &self.config.register {
            self.register(&target.name, "", port).await?;
            info!(service = %target.name, port, "self-registered");
        }
        Ok(())
    }

    async fn register(
        &self,
        name: &str,
        target: &str,
        port: u16,
    ) -> Result<ServiceRecordSet, RegistrationError> {
        let target = if target.is_empty() {
            super::target_for_address(self.advertise_address())
        } else {
            crate::config::fqdn(target)
        };
        self.shared
            .registrations()?
            .add(name, ServiceRecord::new(target, port))
            .await
    }

    async fn close(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("registration API did not stop in time");
            }
        }
    }
}
