//! Proxy pipeline
//!
//! Assembles the HTTP(S) listeners and the fixed middleware chain around
//! the dispatch fallback: matched proxy rules are forwarded upstream,
//! matched static rules and unmatched requests (when a global assets tree
//! is configured) are served from disk.

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::from_fn_with_state;
use axum::response::Response;
use axum::routing::get;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::discovery::Aggregator;
use crate::errors::{AppError, AppResult};
use crate::health::HealthService;
use crate::plugins::Conductor;
use crate::rules::balancer::Selector;
use crate::rules::matcher::RouteMatch;
use crate::rules::{AuthEntry, MatchKind};
use crate::tls::{self, ChallengeStore, TlsMode};

pub mod assets;
pub mod dispatch;
pub mod middleware;

use assets::{AssetService, CacheRule};
use dispatch::ErrorReporter;
use middleware::Throttle;

/// Shared state of the request pipeline.
pub struct Gateway {
    pub config: Arc<Config>,
    pub discovery: Arc<Aggregator>,
    pub health: Arc<HealthService>,
    pub conductor: Arc<Conductor>,
    pub selector: Selector,
    pub throttle: Option<Throttle>,
    pub client: reqwest::Client,
    pub error_reporter: ErrorReporter,
    /// Global assets fallback for unmatched requests
    pub assets: Option<AssetService>,
    pub assets_cache: Arc<Vec<CacheRule>>,
    pub htpasswd: Vec<AuthEntry>,
    pub max_body: u64,
    pub proxy_headers: Vec<(HeaderName, HeaderValue)>,
    pub drop_headers: Vec<HeaderName>,
    /// Value of the `Server` signature header
    pub server_name: String,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        discovery: Arc<Aggregator>,
        health: Arc<HealthService>,
        conductor: Arc<Conductor>,
    ) -> AppResult<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeouts.dial)
            .read_timeout(config.timeouts.read)
            .pool_idle_timeout(config.timeouts.idle)
            .tcp_keepalive(config.timeouts.keep_alive)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::internal(format!("upstream client: {e}")))?;

        let mut proxy_headers = Vec::new();
        for entry in &config.headers.proxy {
            let (name, value) = entry.split_once(':').ok_or_else(|| {
                AppError::configuration(format!("proxy header '{entry}' is not Name:Value"))
            })?;
            let name: HeaderName = name.trim().parse().map_err(|_| {
                AppError::configuration(format!("invalid proxy header name '{name}'"))
            })?;
            let value: HeaderValue = value.trim().parse().map_err(|_| {
                AppError::configuration(format!("invalid proxy header value in '{entry}'"))
            })?;
            proxy_headers.push((name, value));
        }

        let mut drop_headers = Vec::new();
        for name in &config.headers.drop {
            drop_headers.push(name.trim().parse::<HeaderName>().map_err(|_| {
                AppError::configuration(format!("invalid drop header name '{name}'"))
            })?);
        }

        let htpasswd = config
            .auth
            .htpasswd
            .iter()
            .map(|entry| AuthEntry::parse(entry))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::configuration(e.to_string()))?;

        let assets_cache = Arc::new(assets::parse_cache_rules(&config.assets.cache)?);
        let assets = config.assets.location.clone().map(|location| {
            AssetService::new(
                location,
                config.assets.web_root.clone(),
                config.assets.spa,
                assets_cache.clone(),
            )
        });

        let server_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        Ok(Arc::new(Self {
            selector: Selector::new(config.lb.policy),
            throttle: Throttle::from_config(&config.throttle),
            error_reporter: ErrorReporter::from_config(&config.error_pages)?,
            max_body: config.max_body_bytes()?,
            client,
            discovery,
            health,
            conductor,
            assets,
            assets_cache,
            htpasswd,
            proxy_headers,
            drop_headers,
            server_name,
            config,
        }))
    }
}

async fn ping() -> &'static str {
    "pong"
}

/// Terminal handler: serve the matched route, or the global assets tree.
async fn dispatch_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    if let Some(route) = req.extensions().get::<RouteMatch>().cloned() {
        match route.kind {
            MatchKind::Proxy => dispatch::proxy_request(&gateway, req, &route, remote).await,
            MatchKind::Static => {
                match AssetService::from_rule(&route.rule, gateway.assets_cache.clone()) {
                    Some(service) => service.handle(req).await,
                    None => middleware::not_found(),
                }
            }
        }
    } else if let Some(assets) = &gateway.assets {
        assets.handle(req).await
    } else {
        middleware::not_found()
    }
}

/// Build the proxy router with the full middleware chain, outermost first:
/// recover, max-body, signature, access log, metrics, gzip, drop-headers,
/// throttle, basic auth, matcher binding, rule access control, plugin
/// conductor, proxy headers, dispatch.
pub fn router(gateway: Arc<Gateway>) -> Router {
    // the layer is always present so the stack keeps one shape; compression
    // only happens when enabled
    let gzip = CompressionLayer::new().gzip(gateway.config.gzip);

    Router::new()
        .route("/ping", get(ping))
        .fallback(dispatch_handler)
        .with_state(gateway.clone())
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::max_body_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::signature_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::access_log_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::metrics_middleware,
                ))
                .layer(gzip)
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::drop_headers_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::throttle_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::basic_auth_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::bind_route_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::rule_access_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::conductor_middleware,
                ))
                .layer(from_fn_with_state(
                    gateway.clone(),
                    middleware::proxy_headers_middleware,
                )),
        )
}

/// Run the proxy listeners until cancelled.
///
/// `none` TLS mode serves plain HTTP on the HTTP port. The other modes
/// serve HTTPS on the HTTPS port plus a companion HTTP listener answering
/// ACME challenges and redirecting everything else.
pub async fn serve(gateway: Arc<Gateway>, cancel: CancellationToken) -> AppResult<()> {
    let config = gateway.config.clone();
    let app = router(gateway).into_make_service_with_connect_info::<SocketAddr>();

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });
    }

    let challenges: ChallengeStore = Arc::new(DashMap::new());
    match tls::server_config(&config.tls, challenges.clone()).await? {
        None => {
            let addr = config.http_addr()?;
            info!(%addr, "proxy listening");
            axum_server::bind(addr).handle(handle).serve(app).await?;
        }
        Some(rustls_config) => {
            let https_addr = config.https_addr()?;
            let http_addr = config.http_addr()?;

            let redirect =
                tls::redirect_router(challenges.clone(), https_addr.port()).into_make_service();
            {
                let handle = handle.clone();
                tokio::spawn(async move {
                    info!(addr = %http_addr, "redirect listener");
                    if let Err(e) = axum_server::bind(http_addr).handle(handle).serve(redirect).await
                    {
                        error!(error = %e, "redirect listener failed");
                    }
                });
            }

            if config.tls.mode == TlsMode::Auto {
                tokio::spawn(tls::renewal_loop(
                    rustls_config.clone(),
                    config.tls.acme.clone(),
                    challenges,
                    cancel.clone(),
                ));
            }

            info!(addr = %https_addr, "proxy listening (https)");
            axum_server::bind_rustls(https_addr, rustls_config)
                .handle(handle)
                .serve(app)
                .await?;
        }
    }
    Ok(())
}
