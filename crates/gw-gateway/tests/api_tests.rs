//! API Endpoint Tests
//!
//! Tests for:
//! - Publishing (plain, keyed, tagged)
//! - Backpressure responses (throttled vs pool exhausted)
//! - Request validation
//! - Health, stats and broker admin endpoints
//! - Connection tracking over a real listener

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;
use axum::{
    body::Body,
    http::{Request, StatusCode, Method},
};
use tower::ServiceExt;
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use gw_gateway::{create_router, serve, tag};

use common::{test_config, test_gateway, TestGateway};

fn app(gw: &TestGateway) -> axum::Router {
    create_router(gw.server.clone(), None)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn publish(topic: &str, body: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/topics/{}", topic))
        .body(Body::from(body))
        .unwrap()
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn test_publish_returns_receipt() {
    let gw = test_gateway(test_config(0, 2));

    let response = app(&gw).oneshot(publish("orders", b"hello world")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let receipt = body_json(response).await;
    assert_eq!(receipt["partition"], 0);
    assert_eq!(receipt["offset"], 0);
    assert_eq!(receipt["size"], 11);
    assert_eq!(receipt["tagged"], false);
    assert!(receipt["request_id"].is_string());

    let produced = gw.broker.produced.lock();
    assert_eq!(produced[0].topic, "orders");
    assert_eq!(produced[0].value, b"hello world");
    assert!(produced[0].key.is_none());
}

#[tokio::test]
async fn test_publish_with_key() {
    let gw = test_gateway(test_config(0, 2));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/topics/orders?key=customer-7")
        .body(Body::from("payload"))
        .unwrap();
    let response = app(&gw).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let produced = gw.broker.produced.lock();
    assert_eq!(produced[0].key.as_deref(), Some(&b"customer-7"[..]));
}

#[tokio::test]
async fn test_publish_tagged_message_envelope() {
    let gw = test_gateway(test_config(0, 2));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/topics/orders")
        .header("X-Gw-Tag", "c=d; a=b")
        .body(Body::from("hello world"))
        .unwrap();
    let response = app(&gw).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["tagged"], true);

    let value = gw.broker.produced.lock()[0].value.clone();
    let mut expected = vec![0u8];
    expected.extend_from_slice(br#"{"a":"b","c":"d"}hello world"#);
    assert_eq!(value, expected);

    let (body, tags) = tag::untag_message(&value).unwrap();
    assert_eq!(body, b"hello world");
    assert_eq!(tags.get("a").map(String::as_str), Some("b"));
}

#[tokio::test]
async fn test_publish_audited() {
    let gw = test_gateway(test_config(0, 2));

    app(&gw).oneshot(publish("orders", b"one")).await.unwrap();
    app(&gw).oneshot(publish("bad$topic", b"two")).await.unwrap();

    let entries = gw.audit.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].outcome, "ok");
    assert_eq!(entries[0].topic, "orders");
    assert_eq!(entries[1].outcome, "invalid_request");
    assert!(entries[1].error.is_some());
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn test_throttled_returns_429() {
    let gw = test_gateway(test_config(2, 2));

    for _ in 0..2 {
        let response = app(&gw).oneshot(publish("orders", b"x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app(&gw).oneshot(publish("orders", b"x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "throttled");

    assert_eq!(gw.broker.produced_count(), 2);
}

#[tokio::test]
async fn test_pool_exhausted_returns_503() {
    let gw = test_gateway(test_config(0, 1));
    gw.broker.write_delay_ms.store(200, Ordering::SeqCst);

    let slow = {
        let app = app(&gw);
        tokio::spawn(async move { app.oneshot(publish("orders", b"slow")).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let response = app(&gw).oneshot(publish("orders", b"fast")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "pool_exhausted");

    assert_eq!(slow.await.unwrap().status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_connect_failure_returns_502() {
    let gw = test_gateway(test_config(0, 1));
    gw.broker.refuse_connects.store(true, Ordering::SeqCst);

    let response = app(&gw).oneshot(publish("orders", b"x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["error"], "connect_failed");
    assert_eq!(gw.server.stats().pool.checked_out, 0);
}

#[tokio::test]
async fn test_shutdown_returns_503() {
    let gw = test_gateway(test_config(0, 1));
    gw.server.shutdown(Duration::from_millis(100)).await;

    let response = app(&gw).oneshot(publish("orders", b"x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "shutting_down");

    let response = app(&gw)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_oversized_body_returns_413() {
    let gw = test_gateway(test_config(0, 1));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/topics/orders")
        .body(Body::from(vec![b'x'; 2048]))
        .unwrap();
    let response = app(&gw).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(gw.broker.produced_count(), 0);
}

#[tokio::test]
async fn test_untagged_body_with_marker_rejected() {
    let gw = test_gateway(test_config(0, 1));

    let response = app(&gw).oneshot(publish("orders", b"\x00{}raw")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn test_malformed_tag_header_rejected() {
    let gw = test_gateway(test_config(0, 1));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/topics/orders")
        .header("X-Gw-Tag", "novalue")
        .body(Body::from("x"))
        .unwrap();
    let response = app(&gw).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");
    assert_eq!(gw.broker.produced_count(), 0);

    // Refused before reaching the broker, but still on the audit trail
    let entries = gw.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, "invalid_request");
    assert_eq!(entries[0].topic, "orders");
    assert_eq!(gw.server.in_flight(), 0);
}

// ============================================================================
// Health, stats and admin
// ============================================================================

#[tokio::test]
async fn test_health_and_stats() {
    let gw = test_gateway(test_config(10, 2));
    app(&gw).oneshot(publish("orders", b"x")).await.unwrap();

    let response = app(&gw)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "UP");

    let response = app(&gw)
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["pool"]["idle"], 1);
    assert_eq!(stats["pool"]["checked_out"], 0);
    assert_eq!(stats["pool_version"], 1);
    assert_eq!(stats["throttle_keys"], 1);
}

#[tokio::test]
async fn test_metrics_disabled_returns_404() {
    let gw = test_gateway(test_config(0, 1));
    let response = app(&gw)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_broker_refresh_then_rebuild() {
    let gw = test_gateway(test_config(0, 2));

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/admin/brokers")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"brokers":["other:9092"]}"#))
        .unwrap();
    let response = app(&gw).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["changed"], true);
    assert_eq!(body["version"], 1);
    assert_eq!(body["brokers"][0], "mock:9092");
    assert_eq!(body["pending"][0], "other:9092");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/admin/brokers/rebuild")
        .body(Body::empty())
        .unwrap();
    let response = app(&gw).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["version"], 2);
    assert_eq!(body["brokers"][0], "other:9092");
}

// ============================================================================
// Connection tracking
// ============================================================================

#[tokio::test]
async fn test_served_connections_are_tracked() {
    let gw = test_gateway(test_config(0, 2));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let tracker = gw.server.tracker().clone();
    let handle = tokio::spawn(serve(listener, app(&gw), tracker.clone(), async move {
        let _ = stop_rx.await;
    }));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let local = stream.local_addr().unwrap().to_string();
    stream
        .write_all(b"POST /topics/orders HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 201"), "unexpected response: {}", response);

    assert_eq!(gw.audit.entries()[0].client.as_deref(), Some(local.as_str()));
    assert_eq!(tracker.total(), 1);

    // The close hook runs once hyper drops the connection
    for _ in 0..50 {
        if tracker.concurrent() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(tracker.concurrent(), 0);
    assert!(tracker.clients().map(|c| c.is_empty()).unwrap_or(false));

    let _ = stop_tx.send(());
    handle.await.unwrap().unwrap();
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..50 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn raw_publish(addr: std::net::SocketAddr) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /topics/orders HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_connections_over_max_clients_are_refused() {
    let mut config = test_config(0, 2);
    config.max_clients = 1;
    let gw = test_gateway(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let tracker = gw.server.tracker().clone();
    let handle = tokio::spawn(serve(listener, app(&gw), tracker.clone(), async move {
        let _ = stop_rx.await;
    }));

    // An idle keep-alive connection holds the only slot
    let idle = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_for(|| tracker.concurrent() == 1).await;
    assert_eq!(tracker.concurrent(), 1);

    let response = raw_publish(addr).await;
    assert!(response.starts_with("HTTP/1.1 503"), "unexpected response: {}", response);
    assert!(response.contains("too_many_clients"));
    assert_eq!(gw.broker.produced_count(), 0);
    assert_eq!(tracker.rejected(), 1);
    assert_eq!(gw.server.stats().rejected_connections, 1);

    drop(idle);
    wait_for(|| tracker.concurrent() == 0).await;

    let response = raw_publish(addr).await;
    assert!(response.starts_with("HTTP/1.1 201"), "unexpected response: {}", response);
    assert_eq!(gw.broker.produced_count(), 1);

    let _ = stop_tx.send(());
    handle.await.unwrap().unwrap();
}
