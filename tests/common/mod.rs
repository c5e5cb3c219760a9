//! Shared test infrastructure for discover-dns integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{AuthorityObject, Catalog, MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use serde_json::{json, Value};
use tokio::net::UdpSocket;

use discover_dns::authority::ZoneAuthority;
use discover_dns::config::{DnsResponderConfig, HttpRegistrarConfig, RegisterTarget, SoaConfig};
use discover_dns::record::{ServiceRecord, ServiceRecordSet};
use discover_dns::state::Zone;

// --- Constants ---

pub const ORIGIN: &str = "tld.";
pub const SERVICE_PREFIX: &str = "service.discover.";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed to `Catalog::handle_request()`.
/// The response is serialized via `MessageResponse::destructive_emit()` and stored
/// as raw wire-format bytes, which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Config builders ---

pub fn test_dns_config() -> DnsResponderConfig {
    DnsResponderConfig {
        address_and_port: "127.0.0.1:0".to_string(),
        serial_number: 1,
        origin: ORIGIN.to_string(),
        ttl: 60,
        soa: SoaConfig::default(),
    }
}

pub fn test_http_config() -> HttpRegistrarConfig {
    HttpRegistrarConfig {
        port: 0,
        service_prefix: SERVICE_PREFIX.to_string(),
        register: vec![RegisterTarget {
            schema: "http".to_string(),
            endpoint: "service".to_string(),
            name: "http.service.discover".to_string(),
        }],
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        advertise_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    }
}

// --- Zone builder ---

pub fn record_set(records: &[(&str, u16)]) -> ServiceRecordSet {
    ServiceRecordSet::from_records(
        records
            .iter()
            .map(|(target, port)| ServiceRecord::new(*target, *port)),
    )
}

pub struct TestZoneBuilder {
    zone: Zone,
}

impl TestZoneBuilder {
    pub fn new() -> Self {
        Self {
            zone: Zone::with_serial(1),
        }
    }

    pub fn service(self, name: &str, records: &[(&str, u16)]) -> Self {
        self.zone.set_service(name, record_set(records));
        self
    }

    /// Mark the zone as seeded and return it.
    pub fn build(self) -> Zone {
        self.zone.mark_ready();
        self.zone
    }

    /// Return the zone WITHOUT marking it ready.
    pub fn build_not_ready(self) -> Zone {
        self.zone
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from a loopback client.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    let src: SocketAddr = "127.0.0.1:12345".parse().unwrap();
    Request::new(msg, src, Protocol::Udp)
}

/// Build a Catalog with a ZoneAuthority.
pub fn build_catalog(config: DnsResponderConfig, zone: Zone) -> Catalog {
    let authority = ZoneAuthority::new(&config, zone).expect("failed to create ZoneAuthority");
    let origin = authority.origin().clone();
    let authority: Arc<dyn AuthorityObject> = Arc::new(authority);
    let mut catalog = Catalog::new();
    catalog.upsert(origin, vec![authority]);
    catalog
}

// --- Response helpers ---

/// Execute a query through the catalog and return the parsed response.
pub async fn execute_query(catalog: &Catalog, name: &str, record_type: RecordType, id: u16) -> Message {
    let request = build_request(name, record_type, id);
    let handler = TestResponseHandler::new();
    catalog.handle_request(&request, handler.clone()).await;
    handler.into_message()
}

/// Send a real UDP query to a running responder.
pub async fn query_udp(port: u16, name: &str, record_type: RecordType, id: u16) -> Message {
    let sock = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind client socket");
    let dest: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

    sock.send_to(&build_query_bytes(name, record_type, id), dest)
        .await
        .expect("failed to send query");

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(Duration::from_secs(5), sock.recv(&mut buf))
        .await
        .expect("query timed out")
        .expect("failed to recv response");

    Message::from_vec(&buf[..len]).expect("failed to parse DNS response")
}

/// `(target, port)` of every SRV answer, sorted.
pub fn extract_srv(msg: &Message) -> Vec<(String, u16)> {
    let mut answers: Vec<(String, u16)> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::SRV(srv) => Some((srv.target().to_string(), srv.port())),
            _ => None,
        })
        .collect();
    answers.sort();
    answers
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert response is successful with exactly the expected SRV answers.
pub fn assert_srv_response(msg: &Message, expected: &[(&str, u16)]) {
    assert_response_code(msg, ResponseCode::NoError);
    let mut expected: Vec<(String, u16)> = expected
        .iter()
        .map(|(target, port)| (target.to_string(), *port))
        .collect();
    expected.sort();
    assert_eq!(
        extract_srv(msg),
        expected,
        "SRV records mismatch.\nactual:   {:?}\nexpected: {:?}",
        extract_srv(msg),
        expected
    );
}

// --- Manifest fixtures ---

/// Port that was free a moment ago on 127.0.0.1 for both UDP and TCP.
pub fn free_port() -> u16 {
    loop {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = udp.local_addr().unwrap().port();
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// Manifest wiring the in-memory store, a DNS responder and a registrar.
pub fn full_manifest(dns_port: u16, http_port: u16) -> Value {
    json!([
        { "type": "pluginData", "path": "./plugin/dataPlugin/memory.so" },
        {
            "type": "pluginDns",
            "path": "./plugin/serviceDiscover/dns/benBurkertDns.so",
            "conf": { "addressAndPort": format!("127.0.0.1:{dns_port}"), "serialNumber": "7" }
        },
        {
            "type": "pluginHttpServer",
            "path": "./plugin/http/httpServer.so",
            "conf": {
                "port": http_port,
                "bindAddress": "127.0.0.1",
                "advertiseAddress": "127.0.0.1",
                "register": [
                    { "schema": "http", "endpoint": "service", "name": "http.service.discover" }
                ]
            }
        }
    ])
}

/// Write `manifest` to `dir/plugin.json` and return its path.
pub fn write_manifest(dir: &Path, manifest: &Value) -> PathBuf {
    let path = dir.join("plugin.json");
    std::fs::write(&path, serde_json::to_vec_pretty(manifest).unwrap()).unwrap();
    path
}

/// Move the manifest's modification time forward so the next poll reloads it.
pub fn touch(path: &Path, offset_secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
        .unwrap();
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
