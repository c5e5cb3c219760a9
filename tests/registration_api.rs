//! Registration API tests through the axum router.
//!
//! Requests are driven with `tower::ServiceExt::oneshot` and a mocked peer
//! address, against the in-memory data store.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use common::*;
use discover_dns::record::{ServiceRecord, ServiceRecordSet};
use discover_dns::registrar::{router, Envelope, RegistrarShared, MASKED_ERROR};
use discover_dns::store::{DataStore, MemoryStore};

const CALLER: ([u8; 4], u16) = ([10, 0, 0, 5], 40000);

async fn connected_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.connect().await.unwrap();
    store
}

fn app(store: Option<Arc<MemoryStore>>) -> Router {
    let shared = Arc::new(RegistrarShared::new(vec!["service".to_string()], SERVICE_PREFIX));
    shared.attach_store(store.map(|s| s as Arc<dyn DataStore>));
    router(shared).layer(MockConnectInfo(SocketAddr::from(CALLER)))
}

async fn call(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Envelope) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .unwrap_or_else(|e| panic!("response is not an envelope ({e}): {bytes:?}"));
    (status, envelope)
}

async fn stored(store: &MemoryStore, service: &str) -> Option<ServiceRecordSet> {
    let result = store
        .get(format!("{SERVICE_PREFIX}{service}").as_bytes())
        .await
        .unwrap();
    result
        .entries
        .first()
        .map(|entry| ServiceRecordSet::from_payload(&entry.value).unwrap())
}

// =========================================================================
// Create / read
// =========================================================================

#[tokio::test]
async fn register_then_read() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));

    let (status, envelope) = call(
        &app,
        Method::POST,
        "/service/alpha",
        r#"{"port": 9000, "target": "10.0.0.1"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(envelope.meta.success);
    assert_eq!(envelope.objects, vec![ServiceRecord::new("10.0.0.1.", 9000)]);

    let (status, envelope) = call(&app, Method::GET, "/service/alpha", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.meta.total_count, 1);
    assert_eq!(envelope.objects, vec![ServiceRecord::new("10.0.0.1.", 9000)]);

    assert_eq!(stored(&store, "alpha").await.unwrap().len(), 1);
}

#[tokio::test]
async fn put_appends_like_post() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));

    call(&app, Method::POST, "/service/alpha", r#"{"port": 1, "target": "a."}"#).await;
    let (status, envelope) =
        call(&app, Method::PUT, "/service/alpha", r#"{"port": 2, "target": "b."}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.meta.total_count, 2);
}

#[tokio::test]
async fn duplicate_registration_is_a_no_op() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));
    let body = r#"{"port": 9000, "target": "10.0.0.1."}"#;

    call(&app, Method::POST, "/service/alpha", body).await;
    let (status, envelope) = call(&app, Method::POST, "/service/alpha", body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.objects.len(), 1);
    assert_eq!(stored(&store, "alpha").await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_target_uses_caller_address() {
    let store = connected_store().await;
    let app = app(Some(store));

    let (status, envelope) = call(&app, Method::POST, "/service/alpha", r#"{"port": 8080}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.objects, vec![ServiceRecord::new("10.0.0.5.", 8080)]);
}

#[tokio::test]
async fn unregistered_service_reads_empty() {
    let app = app(Some(connected_store().await));

    let (status, envelope) = call(&app, Method::GET, "/service/ghost", "").await;

    assert_eq!(status, StatusCode::OK);
    assert!(envelope.meta.success);
    assert_eq!(envelope.meta.total_count, 0);
    assert!(envelope.objects.is_empty());
}

// =========================================================================
// Delete
// =========================================================================

#[tokio::test]
async fn delete_one_of_many_keeps_the_rest() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));
    for port in [1, 2, 3] {
        call(
            &app,
            Method::POST,
            "/service/alpha",
            &format!(r#"{{"port": {port}, "target": "a."}}"#),
        )
        .await;
    }

    let (status, envelope) =
        call(&app, Method::DELETE, "/service/alpha", r#"{"port": 2, "target": "a."}"#).await;

    assert_eq!(status, StatusCode::OK);
    let ports: Vec<u16> = envelope.objects.iter().map(|r| r.port).collect();
    assert_eq!(ports, vec![1, 3]);
    assert_eq!(stored(&store, "alpha").await.unwrap().len(), 2);
}

#[tokio::test]
async fn delete_last_record_removes_key() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));
    let body = r#"{"port": 9000, "target": "10.0.0.1."}"#;

    call(&app, Method::POST, "/service/alpha", body).await;
    let (status, envelope) = call(&app, Method::DELETE, "/service/alpha", body).await;

    assert_eq!(status, StatusCode::OK);
    assert!(envelope.objects.is_empty());
    assert!(stored(&store, "alpha").await.is_none());
}

#[tokio::test]
async fn delete_of_unknown_endpoint_changes_nothing() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));

    call(&app, Method::POST, "/service/alpha", r#"{"port": 1, "target": "a."}"#).await;
    let (status, envelope) =
        call(&app, Method::DELETE, "/service/alpha", r#"{"port": 9, "target": "z."}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.objects.len(), 1);
}

// =========================================================================
// Errors
// =========================================================================

#[tokio::test]
async fn malformed_body_is_rejected_without_mutation() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));

    let (status, envelope) = call(&app, Method::POST, "/service/alpha", r#"{"port": "#).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!envelope.meta.success);
    assert!(envelope.meta.error.contains("unmarshal"), "{}", envelope.meta.error);
    assert!(stored(&store, "alpha").await.is_none());
}

#[tokio::test]
async fn blank_registration_is_rejected() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));

    for body in [r#"{}"#, r#"{"port": 0, "target": ""}"#, r#"{"port": 80, "target": "."}"#] {
        let (status, envelope) = call(&app, Method::POST, "/service/alpha", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
        assert!(!envelope.meta.success);
    }
    assert!(stored(&store, "alpha").await.is_none());
}

#[tokio::test]
async fn unknown_endpoint_is_not_found() {
    let app = app(Some(connected_store().await));

    let (status, envelope) = call(&app, Method::GET, "/nodes/alpha", "").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!envelope.meta.success);
}

#[tokio::test]
async fn missing_store_is_masked() {
    let app = app(None);

    let (status, envelope) =
        call(&app, Method::POST, "/service/alpha", r#"{"port": 1, "target": "a."}"#).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(envelope.meta.error, MASKED_ERROR);
}

#[tokio::test]
async fn closed_store_errors_are_masked() {
    let store = connected_store().await;
    let app = app(Some(store.clone()));
    store.close().await;

    let (status, envelope) = call(&app, Method::GET, "/service/alpha", "").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(envelope.meta.error, MASKED_ERROR);
}
