//! Plugin conductor: registration surface and request-path invocation

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{build, request};
use reproxy::config::Config;
use reproxy::plugins::Registration;

fn config_with_rules(rules: &[String]) -> Config {
    let mut config = Config::default();
    config.providers.static_rules.rules = rules.to_vec();
    config
}

/// Line-delimited JSON-RPC plugin double; replies are scripted per method.
async fn spawn_plugin(replies: HashMap<String, Value>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 8192];
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let req: Value = serde_json::from_slice(&line).unwrap();
                let method = req["method"].as_str().unwrap().to_string();
                let result = replies.get(&method).cloned().unwrap_or(json!({}));
                let reply = json!({ "id": req["id"], "result": result, "error": null });
                let mut out = serde_json::to_vec(&reply).unwrap();
                out.push(b'\n');
                socket.write_all(&out).await.unwrap();
            }
        }
    });
    addr
}

fn registration_request(method: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn registration_endpoint_lifecycle() {
    let core = build(Config::default()).await;
    let plugin_addr = spawn_plugin(HashMap::new()).await;

    let router = core.conductor.router();
    let resp = router
        .clone()
        .oneshot(registration_request(
            "POST",
            json!({ "name": "auth", "address": plugin_addr, "methods": ["Check"] }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(core.conductor.handlers().len(), 1);

    // unreachable plugin: 500, state untouched
    let resp = router
        .clone()
        .oneshot(registration_request(
            "POST",
            json!({ "name": "broken", "address": "127.0.0.1:1", "methods": ["M"] }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(core.conductor.handlers().len(), 1);

    // removal by name
    let resp = router
        .clone()
        .oneshot(registration_request(
            "DELETE",
            json!({ "name": "auth", "address": plugin_addr, "methods": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(core.conductor.handlers().is_empty());

    // any other method is a 400
    let resp = router
        .oneshot(registration_request("PUT", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn plugin_short_circuit_skips_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("upstream"))
        .expect(0)
        .mount(&upstream)
        .await;

    let core = build(config_with_rules(&[format!(
        "*,^/p/(.*),{}/$1",
        upstream.uri()
    )]))
    .await;

    let mut replies = HashMap::new();
    replies.insert(
        "mw.Headers".to_string(),
        json!({ "StatusCode": 200, "HeadersOut": { "K": ["V1"] } }),
    );
    replies.insert("mw.Deny".to_string(), json!({ "StatusCode": 500 }));
    let plugin_addr = spawn_plugin(replies).await;

    core.conductor
        .register(Registration {
            name: "mw".to_string(),
            address: plugin_addr,
            methods: vec!["Headers".to_string(), "Deny".to_string()],
        })
        .await
        .unwrap();

    let resp = core
        .router
        .oneshot(request("GET", "/p/x", "host"))
        .await
        .unwrap();
    // the second handler terminated the chain; upstream never ran
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = common::body_string(resp.into_body()).await;
    assert_eq!(body, "Internal Server Error");
}

#[tokio::test]
async fn plugin_status_is_propagated_verbatim() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let core = build(config_with_rules(&[format!(
        "*,^/p/(.*),{}/$1",
        upstream.uri()
    )]))
    .await;

    let mut replies = HashMap::new();
    replies.insert("gate.Check".to_string(), json!({ "StatusCode": 418 }));
    let plugin_addr = spawn_plugin(replies).await;
    core.conductor
        .register(Registration {
            name: "gate".to_string(),
            address: plugin_addr,
            methods: vec!["Check".to_string()],
        })
        .await
        .unwrap();

    let resp = core
        .router
        .oneshot(request("GET", "/p/x", "host"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn plugin_headers_reach_upstream_and_client() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let core = build(config_with_rules(&[format!(
        "*,^/p/(.*),{}/$1",
        upstream.uri()
    )]))
    .await;

    let mut replies = HashMap::new();
    replies.insert(
        "mw.Stamp".to_string(),
        json!({
            "StatusCode": 200,
            "HeadersIn": { "X-Plugin-In": ["yes"] },
            "HeadersOut": { "X-Plugin-Out": ["also"] },
        }),
    );
    let plugin_addr = spawn_plugin(replies).await;
    core.conductor
        .register(Registration {
            name: "mw".to_string(),
            address: plugin_addr,
            methods: vec!["Stamp".to_string()],
        })
        .await
        .unwrap();

    let resp = core
        .router
        .oneshot(request("GET", "/p/x", "host"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-plugin-out").unwrap(), "also");

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[0].headers.get("x-plugin-in").unwrap(), "yes");
}

#[tokio::test]
async fn rpc_transport_failure_is_a_500() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let core = build(config_with_rules(&[format!(
        "*,^/p/(.*),{}/$1",
        upstream.uri()
    )]))
    .await;

    // plugin accepts the registration dial, then hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let plugin_addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    core.conductor
        .register(Registration {
            name: "flaky".to_string(),
            address: plugin_addr,
            methods: vec!["M".to_string()],
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let resp = core
        .router
        .oneshot(request("GET", "/p/x", "host"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
