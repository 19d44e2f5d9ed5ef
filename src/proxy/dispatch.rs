//! Upstream dispatch
//!
//! The last stage of the pipeline: forwards the (possibly plugin-rewritten)
//! request to the expanded destination and streams the response back.
//! Upstream failures surface as a 502 through the error reporter, which
//! renders plain text or a user-supplied HTML template.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, warn};

use super::Gateway;
use crate::errors::{AppError, AppResult};
use crate::rules::KeepHost;
use crate::rules::matcher::RouteMatch;
use crate::tls::TlsMode;

// Hop-by-hop headers, stripped in both directions (RFC 7230 §6.1).
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Renders upstream failures to the client.
pub struct ErrorReporter {
    template: Option<String>,
}

impl ErrorReporter {
    pub fn from_config(config: &crate::config::ErrorPagesConfig) -> AppResult<Self> {
        let template = if config.enabled {
            let path: &Path = config.template.as_deref().ok_or_else(|| {
                AppError::configuration("error_pages.enabled requires a template path")
            })?;
            Some(std::fs::read_to_string(path).map_err(|e| {
                AppError::configuration(format!("error template {}: {e}", path.display()))
            })?)
        } else {
            None
        };
        Ok(Self { template })
    }

    pub fn plain() -> Self {
        Self { template: None }
    }

    pub fn render(&self, status: StatusCode, message: &str) -> Response {
        match &self.template {
            Some(template) => {
                let body = template
                    .replace("{{status}}", status.as_str())
                    .replace("{{message}}", message);
                (
                    status,
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    body,
                )
                    .into_response()
            }
            None => (status, message.to_string()).into_response(),
        }
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.append(name, value);
    }
}

/// Reverse-proxy one matched request to its expanded destination.
pub async fn proxy_request(
    gateway: &Gateway,
    req: Request<Body>,
    route: &RouteMatch,
    remote: SocketAddr,
) -> Response {
    let destination = match url::Url::parse(&route.destination) {
        Ok(url) => url,
        Err(e) => {
            warn!(destination = %route.destination, error = %e, "unparseable destination");
            return gateway
                .error_reporter
                .render(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let client_host = crate::utils::request_host(req.headers(), req.uri());
    let (parts, body) = req.into_parts();

    let mut headers = parts.headers;
    strip_hop_headers(&mut headers);
    headers.remove(header::HOST);

    let keep_host = match route.rule.keep_host {
        KeepHost::Keep => true,
        KeepHost::Rewrite => false,
        KeepHost::Unset => gateway.config.headers.keep_host,
    };
    if keep_host {
        if let Some(host) = &client_host {
            append_header(&mut headers, header::HOST, host);
        }
    }

    let scheme = if gateway.config.tls.mode == TlsMode::None {
        "http"
    } else {
        "https"
    };
    append_header(
        &mut headers,
        HeaderName::from_static("x-forwarded-for"),
        &remote.ip().to_string(),
    );
    append_header(
        &mut headers,
        HeaderName::from_static("x-forwarded-proto"),
        scheme,
    );
    if let Some(host) = &client_host {
        append_header(&mut headers, HeaderName::from_static("x-forwarded-host"), host);
    }

    debug!(destination = %destination, "dispatching upstream");
    let outbound = gateway
        .client
        .request(parts.method, destination)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = match outbound.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(destination = %route.destination, error = %e, "upstream request failed");
            return gateway
                .error_reporter
                .render(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_headers(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
