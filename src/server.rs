//! DNS responder: binds UDP and TCP and serves a [`Zone`] through hickory.

use async_trait::async_trait;
use hickory_server::authority::{AuthorityObject, Catalog};
use hickory_server::ServerFuture;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authority::ZoneAuthority;
use crate::component::DnsResponder;
use crate::config::DnsResponderConfig;
use crate::error::ConnectError;
use crate::state::Zone;

/// Interval for emitting zone metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// TCP idle timeout handed to hickory.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// A retired responder may still hold the port for a moment.
const BIND_ATTEMPTS: u32 = 10;
const BIND_BACKOFF: Duration = Duration::from_millis(100);

/// How long `close` waits for the serving task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Periodically emit zone metrics.
async fn metrics_loop(zone: Zone, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                zone.emit_metrics();
                debug!(services = zone.service_count(), serial = zone.serial(), "emitted zone metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, ConnectError> {
    let mut attempt = 1;
    loop {
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                debug!(%addr, attempt, "DNS port busy, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_BACKOFF).await;
            }
            Err(source) => {
                return Err(ConnectError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
}

/// Bind a TCP listener, retrying while a retired listener still holds `addr`.
pub(crate) async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, ConnectError> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                debug!(%addr, attempt, "TCP port busy, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_BACKOFF).await;
            }
            Err(source) => {
                return Err(ConnectError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
}

/// DNS responder backed by hickory's `ServerFuture`.
pub struct HickoryResponder {
    config: DnsResponderConfig,
    zone: Zone,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HickoryResponder {
    /// Create a responder; nothing is bound until [`DnsResponder::connect`].
    pub fn new(config: DnsResponderConfig) -> Self {
        let zone = Zone::with_serial(config.serial_number);
        Self {
            config,
            zone,
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Address the UDP socket is bound to, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl DnsResponder for HickoryResponder {
    async fn connect(&self, shutdown: CancellationToken) -> Result<(), ConnectError> {
        let listen_addr = self
            .config
            .listen_addr()
            .map_err(|e| ConnectError::Backend(e.to_string()))?;

        let authority = ZoneAuthority::new(&self.config, self.zone.clone())
            .map_err(|e| ConnectError::Backend(e.to_string()))?;
        let mut catalog = Catalog::new();
        let authority: Arc<dyn AuthorityObject> = Arc::new(authority);
        catalog.upsert(authority.origin().clone(), vec![authority]);

        let mut server = ServerFuture::new(catalog);

        let udp_socket = bind_udp(listen_addr).await?;
        let bound = udp_socket.local_addr().map_err(|source| ConnectError::Bind {
            addr: listen_addr.to_string(),
            source,
        })?;
        info!(addr = %bound, "DNS UDP listening");
        server.register_socket(udp_socket);

        // Same port as UDP, which matters when the configured port is 0.
        let tcp_listener = bind_tcp(bound).await?;
        info!(addr = %bound, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        *self.local_addr.lock() = Some(bound);
        info!(origin = %self.config.origin, "DNS responder ready to serve queries");

        let token = shutdown.child_token();
        let metrics_handle = tokio::spawn(metrics_loop(self.zone.clone(), token.clone()));
        self.zone.emit_metrics();

        let serve_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = serve_token.cancelled() => {
                    info!(addr = %bound, "DNS responder shutdown requested");
                }
                result = server.block_until_done() => {
                    if let Err(e) = result {
                        error!("DNS server error: {}", e);
                    }
                }
            }
            serve_token.cancel();
            let _ = metrics_handle.await;
            drop(server);
            info!(addr = %bound, "DNS responder stopped");
        });

        if let Some(previous) = self.shutdown.lock().replace(token) {
            previous.cancel();
        }
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn zone(&self) -> Zone {
        self.zone.clone()
    }

    fn listening_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    async fn close(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("DNS responder did not stop in time");
            }
        }
    }
}
