//! Shared helpers for the integration suite
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use reproxy::config::Config;
use reproxy::discovery::Aggregator;
use reproxy::errors::ProviderError;
use reproxy::health::HealthService;
use reproxy::plugins::Conductor;
use reproxy::providers::{Provider, ProviderId, build_providers};
use reproxy::proxy::{self, Gateway};
use reproxy::rules::Rule;

/// Provider seeded with a fixed rule list, for pipelines that need rules the
/// configuration cannot express directly (allow-lists, rule-scoped auth).
pub struct FixedProvider(pub Vec<Rule>);

#[async_trait]
impl Provider for FixedProvider {
    fn id(&self) -> ProviderId {
        ProviderId::System
    }

    async fn list(&self) -> Result<Vec<Rule>, ProviderError> {
        Ok(self.0.clone())
    }

    async fn events(&self, tx: mpsc::Sender<ProviderId>, cancel: CancellationToken) {
        let _ = tx.send(self.id()).await;
        cancel.cancelled().await;
    }
}

pub struct TestCore {
    pub router: Router,
    pub gateway: Arc<Gateway>,
    pub discovery: Arc<Aggregator>,
    pub health: Arc<HealthService>,
    pub conductor: Arc<Conductor>,
}

/// Build a core from the configuration's own providers (static rules etc.)
/// and publish the first snapshot.
pub async fn build(config: Config) -> TestCore {
    let providers = build_providers(&config).expect("providers");
    build_inner(config, Aggregator::new(providers)).await
}

/// Build a core seeded with explicit rules.
pub async fn build_with_rules(config: Config, rules: Vec<Rule>) -> TestCore {
    let provider: Arc<dyn Provider> = Arc::new(FixedProvider(rules));
    build_inner(config, Aggregator::new(vec![provider])).await
}

async fn build_inner(config: Config, discovery: Arc<Aggregator>) -> TestCore {
    discovery.rebuild().await;
    let config = Arc::new(config);
    let health = HealthService::new(config.healthcheck.clone());
    let conductor = Arc::new(Conductor::new());
    let gateway = Gateway::new(
        config,
        discovery.clone(),
        health.clone(),
        conductor.clone(),
    )
    .expect("gateway");
    TestCore {
        router: proxy::router(gateway.clone()),
        gateway,
        discovery,
        health,
        conductor,
    }
}

/// Request carrying the connect-info extension the middlewares expect.
pub fn request(method: &str, uri: &str, host: &str) -> Request<Body> {
    request_from(method, uri, host, "192.0.2.1:9999")
}

pub fn request_from(method: &str, uri: &str, host: &str, remote: &str) -> Request<Body> {
    let remote: SocketAddr = remote.parse().unwrap();
    Request::builder()
        .method(method)
        .uri(uri)
        .header("host", host)
        .extension(ConnectInfo(remote))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
