//! HTTP middleware
//!
//! The fixed request pipeline, outermost first: panic recovery, body limit,
//! signature headers, access log, metrics, gzip, drop-headers, throttle,
//! basic auth, matcher binding, per-rule access control, plugin conductor,
//! outgoing proxy headers, dispatch. Each middleware is an axum `from_fn`
//! layer over the shared gateway state.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::Gateway;
use crate::config::ThrottleConfig;
use crate::metrics::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, THROTTLED_TOTAL};
use crate::rules::AuthEntry;
use crate::rules::matcher::{RouteMatch, best_match, expand_destination};
use crate::utils::{client_ip, request_host};

/// Matched source pattern, attached to responses for the metrics layer.
#[derive(Debug, Clone)]
pub struct MatchedPattern(pub String);

/// Global and per-server token buckets.
///
/// Both buckets are always consulted, so a request breaching the global
/// limit still debits its server's bucket and the per-server state stays
/// accurate.
pub struct Throttle {
    global: DefaultDirectRateLimiter,
    per_server: DashMap<String, Arc<DefaultDirectRateLimiter>>,
    quota: Quota,
    pub status: StatusCode,
}

impl Throttle {
    /// `None` when throttling is disabled (rate 0).
    pub fn from_config(config: &ThrottleConfig) -> Option<Self> {
        let rate = NonZeroU32::new(config.rate)?;
        let burst = NonZeroU32::new(config.burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Some(Self {
            global: RateLimiter::direct(quota),
            per_server: DashMap::new(),
            quota,
            status: StatusCode::from_u16(config.status_code)
                .unwrap_or(StatusCode::TOO_MANY_REQUESTS),
        })
    }

    /// Check both buckets; true means the request may proceed.
    pub fn admit(&self, server: Option<&str>) -> bool {
        let server_ok = match server {
            Some(server) => {
                let bucket = self
                    .per_server
                    .entry(server.to_ascii_lowercase())
                    .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)))
                    .clone();
                bucket.check().is_ok()
            }
            // no server name: the global bucket alone decides
            None => true,
        };
        let global_ok = self.global.check().is_ok();
        global_ok && server_ok
    }
}

/// Reject bodies over the configured limit with a 413.
pub async fn max_body_middleware(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    if gateway.max_body > 0 {
        if let Some(length) = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > gateway.max_body {
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("Request too large: {length} bytes (max: {})", gateway.max_body),
                )
                    .into_response();
            }
        }
    }
    next.run(req).await
}

/// Stamp identifying headers on responses.
pub async fn signature_middleware(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    if gateway.config.signature.enabled {
        let headers = response.headers_mut();
        headers.insert("app-name", env!("CARGO_PKG_NAME").parse().unwrap());
        headers.insert("app-version", env!("CARGO_PKG_VERSION").parse().unwrap());
        if let Ok(org) = gateway.config.signature.organization.parse() {
            headers.insert("org", org);
        }
        if let Ok(server) = gateway.server_name.parse() {
            headers.insert("server", server);
        }
    }
    response
}

/// One structured line per completed request, under `target: "access"`.
/// File output and rotation are the outer process's concern.
pub async fn access_log_middleware(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !gateway.config.logging.access || req.uri().path() == "/ping" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let client = client_ip(req.headers(), &remote);
    let host = request_host(req.headers(), req.uri()).unwrap_or_default();

    let response = next.run(req).await;

    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    info!(
        target: "access",
        method = %method,
        uri = %uri,
        host = %host,
        status = response.status().as_u16(),
        bytes,
        client = %client,
        request_id = %request_id,
        duration_ms = start.elapsed().as_millis(),
        "request completed"
    );
    response
}

/// Request count, status distribution and per-route latency.
pub async fn metrics_middleware(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let route = if gateway.config.metrics.low_cardinality {
        response
            .extensions()
            .get::<MatchedPattern>()
            .map(|m| m.0.clone())
            .unwrap_or_else(|| "[unmatched]".to_string())
    } else {
        path
    };
    metrics::counter!(
        REQUESTS_TOTAL,
        "method" => method,
        "status" => response.status().as_u16().to_string(),
        "route" => route.clone(),
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());

    response
}

/// Strip configured incoming headers before anything downstream sees them.
pub async fn drop_headers_middleware(
    State(gateway): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    for name in &gateway.drop_headers {
        req.headers_mut().remove(name);
    }
    next.run(req).await
}

/// Token-bucket throttling, global plus per-destination-server.
pub async fn throttle_middleware(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(throttle) = &gateway.throttle else {
        return next.run(req).await;
    };
    let server = request_host(req.headers(), req.uri());
    if !throttle.admit(server.as_deref()) {
        metrics::counter!(THROTTLED_TOTAL).increment(1);
        return (throttle.status, "Too Many Requests").into_response();
    }
    next.run(req).await
}

/// Proxy-wide basic auth, active when the htpasswd list is non-empty.
pub async fn basic_auth_middleware(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    if gateway.htpasswd.is_empty() {
        return next.run(req).await;
    }
    if !check_basic_auth(req.headers(), &gateway.htpasswd) {
        return unauthorized();
    }
    next.run(req).await
}

/// Run the matcher and bind the matched route to the request.
///
/// On a miss the request either falls through to the global asset handler
/// (when configured) or is answered with a 404 right here.
pub async fn bind_route_middleware(
    State(gateway): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if path == "/ping" {
        return next.run(req).await;
    }
    let host = request_host(req.headers(), req.uri()).unwrap_or_default();

    let snapshot = gateway.discovery.snapshot();
    let Some(group) = best_match(&snapshot, &host, &path) else {
        if gateway.assets.is_some() {
            // unmatched requests are served from the global assets tree
            return next.run(req).await;
        }
        return StatusCode::NOT_FOUND.into_response();
    };

    let alive: Vec<usize> = group
        .rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| gateway.health.is_alive(&rule.key()))
        .map(|(i, _)| i)
        .collect();
    // all dead: fall through to the first rule so the client sees the real
    // upstream error rather than a synthetic one
    let index = gateway
        .selector
        .pick(&group.group_key(), &alive)
        .unwrap_or(0);
    let rule = group.rules[index].clone();

    let Some(destination) = expand_destination(&rule, &path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let matched = RouteMatch {
        kind: rule.match_kind,
        destination,
        rule,
    };
    let pattern = matched.rule.src.clone();
    req.extensions_mut().insert(matched);

    let mut response = next.run(req).await;
    response.extensions_mut().insert(MatchedPattern(pattern));
    response
}

/// Per-rule access control: `only_from` allow-list and rule-scoped auth.
pub async fn rule_access_middleware(
    State(_gateway): State<Arc<Gateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let Some(matched) = req.extensions().get::<RouteMatch>() else {
        return next.run(req).await;
    };

    let client = client_ip(req.headers(), &remote);
    if !matched.rule.admits(client) {
        warn!(client = %client, rule = %matched.rule.src, "client not in allow-list");
        return StatusCode::FORBIDDEN.into_response();
    }

    if !matched.rule.auth_users.is_empty()
        && !check_basic_auth(req.headers(), &matched.rule.auth_users)
    {
        return unauthorized();
    }

    next.run(req).await
}

/// Invoke registered plugin handlers in order.
pub async fn conductor_middleware(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    if gateway.conductor.handlers().is_empty() {
        return next.run(req).await;
    }

    let url = req.uri().to_string();
    let host = request_host(req.headers(), req.uri()).unwrap_or_default();
    let route = req.extensions().get::<RouteMatch>().cloned();

    let outcome = {
        let headers = req.headers_mut();
        gateway
            .conductor
            .conduct(&url, &remote.to_string(), &host, headers, route.as_ref())
            .await
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            // plugins may be security-critical; failures are never swallowed
            warn!(error = %e, "plugin invocation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "plugin failure").into_response();
        }
    };

    if let Some(status) = outcome.terminal {
        let text = status.canonical_reason().unwrap_or("");
        return (status, text.to_string()).into_response();
    }

    let mut response = next.run(req).await;
    if outcome.override_response_headers {
        response.headers_mut().clear();
    }
    let keys: Vec<HeaderName> = outcome.response_headers.keys().cloned().collect();
    for key in keys {
        response.headers_mut().remove(&key);
    }
    for (name, value) in outcome.response_headers.iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

/// Append user-configured headers to the upstream request.
pub async fn proxy_headers_middleware(
    State(gateway): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    for (name, value) in &gateway.proxy_headers {
        req.headers_mut().append(name.clone(), value.clone());
    }
    next.run(req).await
}

/// Validate an `Authorization: Basic` header against bcrypt entries.
pub fn check_basic_auth(headers: &HeaderMap, entries: &[AuthEntry]) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return false;
    };
    entries
        .iter()
        .filter(|entry| entry.user == user)
        .any(|entry| bcrypt::verify(password, &entry.hash).unwrap_or(false))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"restricted\"")],
        "Unauthorized",
    )
        .into_response()
}

/// Used by the dispatch fallback for requests that reached it without a
/// matched route and without a global assets tree; the matcher middleware
/// answers those earlier, so this is a backstop.
pub fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}
