//! Plugin conductor
//!
//! External processes can register as middleware: a registration names the
//! plugin, its RPC address and its method list, and every method becomes a
//! handler invoked synchronously, in registration order, for each matched
//! request. Handlers can rewrite incoming and outgoing headers or terminate
//! the request with a status of their own.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{PluginError, PluginResult};
use crate::rules::matcher::RouteMatch;

pub mod rpc;

use rpc::RpcClient;

/// Registration payload: `POST {name, address, methods[]}`
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// One remotely callable plugin method
pub struct PluginHandler {
    pub name: String,
    pub method: String,
    pub address: String,
    pub alive: bool,
    client: Arc<RpcClient>,
}

impl PluginHandler {
    /// Handler identity, `<plugin>.<method>`
    pub fn id(&self) -> String {
        format!("{}.{}", self.name, self.method)
    }
}

/// Request descriptor sent to each handler
#[derive(Debug, Clone, Serialize)]
pub struct PluginRequest {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "RemoteAddr")]
    pub remote_addr: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Header")]
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "Route")]
    pub route: String,
    #[serde(rename = "Match")]
    pub route_match: PluginMatch,
}

/// Matched-route context passed along with the request
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginMatch {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Src")]
    pub src: String,
    #[serde(rename = "Dst")]
    pub dst: String,
    #[serde(rename = "ProviderID")]
    pub provider_id: String,
    #[serde(rename = "PingURL")]
    pub ping_url: String,
    #[serde(rename = "MatchType")]
    pub match_type: String,
    #[serde(rename = "AssetsLocation")]
    pub assets_location: String,
    #[serde(rename = "AssetsWebRoot")]
    pub assets_web_root: String,
}

/// Handler reply
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginReply {
    #[serde(rename = "StatusCode", default)]
    pub status_code: u16,
    #[serde(rename = "HeadersIn", default)]
    pub headers_in: HashMap<String, Vec<String>>,
    #[serde(rename = "HeadersOut", default)]
    pub headers_out: HashMap<String, Vec<String>>,
    #[serde(rename = "OverrideHeadersIn", default)]
    pub override_headers_in: bool,
    #[serde(rename = "OverrideHeadersOut", default)]
    pub override_headers_out: bool,
}

/// Outcome of running the handler chain for one request
#[derive(Debug, Default)]
pub struct Conducted {
    /// Terminal status a handler decided on; the inner pipeline is skipped
    pub terminal: Option<StatusCode>,
    /// Headers to merge into the outgoing response
    pub response_headers: HeaderMap,
    /// Clear the response header set before merging
    pub override_response_headers: bool,
}

pub struct Conductor {
    /// Copy-on-write handler list: registrations swap the Arc under the
    /// write lock while in-flight requests iterate their own clone.
    handlers: RwLock<Arc<Vec<Arc<PluginHandler>>>>,
}

impl Default for Conductor {
    fn default() -> Self {
        Self::new()
    }
}

impl Conductor {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Snapshot of the current handler list, in registration order.
    pub fn handlers(&self) -> Arc<Vec<Arc<PluginHandler>>> {
        self.handlers.read().expect("handler lock poisoned").clone()
    }

    /// Register (or re-register) a plugin. Dial failure leaves the current
    /// handler list untouched; re-registration at the same address is a
    /// no-op; a new address replaces the prior handlers.
    pub async fn register(&self, registration: Registration) -> PluginResult<()> {
        if registration.name.is_empty() || registration.methods.is_empty() {
            return Err(PluginError::InvalidRegistration {
                message: "registration requires a name and at least one method".to_string(),
            });
        }

        {
            let current = self.handlers();
            let same_address = current
                .iter()
                .filter(|h| h.name == registration.name)
                .all(|h| h.address == registration.address);
            let already_known = current.iter().any(|h| h.name == registration.name);
            if already_known && same_address {
                debug!(plugin = %registration.name, "re-registration at the same address, ignored");
                return Ok(());
            }
        }

        // dial once; all of the plugin's handlers share the connection
        let client = Arc::new(RpcClient::connect(&registration.address).await?);

        let mut next: Vec<Arc<PluginHandler>> = self
            .handlers()
            .iter()
            .filter(|h| h.name != registration.name)
            .cloned()
            .collect();
        for method in &registration.methods {
            next.push(Arc::new(PluginHandler {
                name: registration.name.clone(),
                method: method.clone(),
                address: registration.address.clone(),
                alive: true,
                client: client.clone(),
            }));
        }

        info!(plugin = %registration.name, address = %registration.address,
            methods = registration.methods.len(), "plugin registered");
        *self.handlers.write().expect("handler lock poisoned") = Arc::new(next);
        Ok(())
    }

    /// Remove all handlers whose plugin name starts with `name`.
    pub fn deregister(&self, name: &str) -> usize {
        let mut guard = self.handlers.write().expect("handler lock poisoned");
        let before = guard.len();
        let next: Vec<Arc<PluginHandler>> = guard
            .iter()
            .filter(|h| !h.name.starts_with(name))
            .cloned()
            .collect();
        let removed = before - next.len();
        *guard = Arc::new(next);
        if removed > 0 {
            info!(plugin = %name, removed, "plugin deregistered");
        }
        removed
    }

    /// Invoke every alive handler in registration order.
    ///
    /// `headers` is the incoming request header map; handler-supplied
    /// `HeadersIn` are applied to it between calls so later handlers and the
    /// upstream see them. A reply status ≥ 400 terminates the chain.
    pub async fn conduct(
        &self,
        url: &str,
        remote_addr: &str,
        host: &str,
        headers: &mut HeaderMap,
        route: Option<&RouteMatch>,
    ) -> PluginResult<Conducted> {
        let chain = self.handlers();
        let mut outcome = Conducted::default();
        if chain.is_empty() {
            return Ok(outcome);
        }

        let route_match = route.map(plugin_match).unwrap_or_default();
        let destination = route.map(|r| r.destination.clone()).unwrap_or_default();

        for handler in chain.iter() {
            if !handler.alive {
                debug!(handler = %handler.id(), "skipping non-alive handler");
                continue;
            }

            let request = PluginRequest {
                url: url.to_string(),
                remote_addr: remote_addr.to_string(),
                host: host.to_string(),
                header: header_map_to_plugin(headers),
                route: destination.clone(),
                route_match: route_match.clone(),
            };

            let reply: PluginReply = handler.client.call(&handler.id(), &request).await?;

            if reply.override_headers_in {
                headers.clear();
            }
            merge_plugin_headers(headers, &reply.headers_in);

            if reply.override_headers_out {
                outcome.response_headers.clear();
                outcome.override_response_headers = true;
            }
            merge_plugin_headers(&mut outcome.response_headers, &reply.headers_out);

            if reply.status_code >= 400 {
                let status = StatusCode::from_u16(reply.status_code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                debug!(handler = %handler.id(), status = %status, "handler terminated the chain");
                outcome.terminal = Some(status);
                return Ok(outcome);
            }
        }
        Ok(outcome)
    }

    /// Registration endpoint router: `POST` registers, `DELETE` removes,
    /// anything else is a 400.
    pub fn router(self: &Arc<Self>) -> Router {
        async fn register_handler(
            State(conductor): State<Arc<Conductor>>,
            Json(registration): Json<Registration>,
        ) -> axum::response::Response {
            match conductor.register(registration).await {
                Ok(()) => StatusCode::OK.into_response(),
                Err(e) => {
                    warn!(error = %e, "plugin registration failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                }
            }
        }

        async fn deregister_handler(
            State(conductor): State<Arc<Conductor>>,
            Json(registration): Json<Registration>,
        ) -> axum::response::Response {
            conductor.deregister(&registration.name);
            StatusCode::OK.into_response()
        }

        async fn bad_request() -> axum::response::Response {
            StatusCode::BAD_REQUEST.into_response()
        }

        Router::new()
            .route(
                "/",
                axum::routing::post(register_handler).delete(deregister_handler),
            )
            .fallback(bad_request)
            // registrations are tiny; slow or oversized clients are cut off
            .layer(tower_http::timeout::TimeoutLayer::new(
                std::time::Duration::from_secs(5),
            ))
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.clone())
    }

    /// Serve the registration endpoint until cancelled.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "plugin conductor listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    }
}

fn plugin_match(route: &RouteMatch) -> PluginMatch {
    PluginMatch {
        server: route.rule.server.clone(),
        src: route.rule.src.clone(),
        dst: route.rule.dst.clone(),
        provider_id: route.rule.provider.to_string(),
        ping_url: route.rule.ping_url.clone(),
        match_type: route.rule.match_kind.to_string(),
        assets_location: route
            .rule
            .assets_location
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        assets_web_root: route.rule.assets_web_root.clone(),
    }
}

fn header_map_to_plugin(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(v.to_string());
        }
    }
    map
}

fn merge_plugin_headers(target: &mut HeaderMap, source: &HashMap<String, Vec<String>>) {
    for (name, values) in source {
        let Ok(header_name) = name.parse::<HeaderName>() else {
            warn!(header = %name, "plugin supplied an invalid header name, dropped");
            continue;
        };
        target.remove(&header_name);
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                target.append(header_name.clone(), header_value);
            } else {
                warn!(header = %name, "plugin supplied an invalid header value, dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Plugin double whose reply per method is scripted by the caller.
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

    fn registration(name: &str, address: &str, methods: &[&str]) -> Registration {
        Registration {
            name: name.to_string(),
            address: address.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn registration_lifecycle() {
        let addr = spawn_plugin(HashMap::new()).await;
        let conductor = Conductor::new();

        conductor
            .register(registration("auth", &addr, &["Check", "Stamp"]))
            .await
            .unwrap();
        let handlers = conductor.handlers();
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].id(), "auth.Check");
        assert_eq!(handlers[1].id(), "auth.Stamp");

        // same address: no-op
        conductor
            .register(registration("auth", &addr, &["Check", "Stamp"]))
            .await
            .unwrap();
        assert_eq!(conductor.handlers().len(), 2);

        assert_eq!(conductor.deregister("auth"), 2);
        assert!(conductor.handlers().is_empty());
    }

    #[tokio::test]
    async fn dial_failure_leaves_state_untouched() {
        let addr = spawn_plugin(HashMap::new()).await;
        let conductor = Conductor::new();
        conductor
            .register(registration("ok", &addr, &["M"]))
            .await
            .unwrap();

        let err = conductor
            .register(registration("broken", "127.0.0.1:1", &["M"]))
            .await;
        assert!(err.is_err());
        assert_eq!(conductor.handlers().len(), 1);
    }

    #[tokio::test]
    async fn re_registration_at_new_address_replaces_handlers() {
        let first = spawn_plugin(HashMap::new()).await;
        let second = spawn_plugin(HashMap::new()).await;
        let conductor = Conductor::new();

        conductor
            .register(registration("auth", &first, &["Check"]))
            .await
            .unwrap();
        conductor
            .register(registration("auth", &second, &["Check", "Extra"]))
            .await
            .unwrap();

        let handlers = conductor.handlers();
        assert_eq!(handlers.len(), 2);
        assert!(handlers.iter().all(|h| h.address == second));
    }

    #[tokio::test]
    async fn conduct_merges_and_overrides_headers() {
        let mut replies = HashMap::new();
        replies.insert(
            "mw.AddHeaders".to_string(),
            json!({
                "StatusCode": 200,
                "HeadersIn": { "X-Plugin": ["one"] },
                "HeadersOut": { "X-Resp": ["yes"] },
            }),
        );
        let addr = spawn_plugin(replies).await;
        let conductor = Conductor::new();
        conductor
            .register(registration("mw", &addr, &["AddHeaders"]))
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-existing", "keep".parse().unwrap());
        let outcome = conductor
            .conduct("/x", "1.2.3.4:555", "example.com", &mut headers, None)
            .await
            .unwrap();

        assert!(outcome.terminal.is_none());
        assert_eq!(headers.get("x-plugin").unwrap(), "one");
        assert_eq!(headers.get("x-existing").unwrap(), "keep");
        assert_eq!(outcome.response_headers.get("x-resp").unwrap(), "yes");
    }

    #[tokio::test]
    async fn override_headers_in_clears_existing() {
        let mut replies = HashMap::new();
        replies.insert(
            "mw.Replace".to_string(),
            json!({
                "StatusCode": 200,
                "HeadersIn": { "X-Only": ["this"] },
                "OverrideHeadersIn": true,
            }),
        );
        let addr = spawn_plugin(replies).await;
        let conductor = Conductor::new();
        conductor
            .register(registration("mw", &addr, &["Replace"]))
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-existing", "gone".parse().unwrap());
        conductor
            .conduct("/x", "1.2.3.4:555", "h", &mut headers, None)
            .await
            .unwrap();

        assert!(headers.get("x-existing").is_none());
        assert_eq!(headers.get("x-only").unwrap(), "this");
    }

    #[tokio::test]
    async fn terminal_status_stops_the_chain() {
        let mut replies = HashMap::new();
        replies.insert(
            "mw.First".to_string(),
            json!({ "StatusCode": 200, "HeadersOut": { "K": ["V1"] } }),
        );
        replies.insert("mw.Deny".to_string(), json!({ "StatusCode": 403 }));
        // never reached; returning 200 here would be invisible anyway
        replies.insert("mw.After".to_string(), json!({ "StatusCode": 200 }));
        let addr = spawn_plugin(replies).await;
        let conductor = Conductor::new();
        conductor
            .register(registration("mw", &addr, &["First", "Deny", "After"]))
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        let outcome = conductor
            .conduct("/x", "1.2.3.4:555", "h", &mut headers, None)
            .await
            .unwrap();
        assert_eq!(outcome.terminal, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn transport_error_fails_the_conduct() {
        // the plugin accepts the registration dial, then hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr2 = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await; // accept then drop
        });
        let broken = Conductor::new();
        broken
            .register(registration("mw", &addr2, &["M"]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut headers = HeaderMap::new();
        let result = broken.conduct("/x", "r", "h", &mut headers, None).await;
        assert!(matches!(result, Err(PluginError::Transport { .. })));
    }
}
