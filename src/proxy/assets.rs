//! Static asset serving
//!
//! Serves a directory tree under a URL prefix, optionally with an SPA
//! fallback (missing files answer with `index.html` and a 200), and stamps
//! Cache-Control per response from a user-supplied MIME/duration list.

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use crate::errors::{AppError, AppResult};
use crate::rules::Rule;

/// One Cache-Control entry: `duration` (all types) or `mime/type:duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRule {
    pub mime_prefix: Option<String>,
    pub max_age: Duration,
}

/// Parse the configured cache entries. The first matching MIME prefix wins;
/// entries without a prefix match everything.
pub fn parse_cache_rules(entries: &[String]) -> AppResult<Vec<CacheRule>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            let (prefix, duration) = match entry.split_once(':') {
                Some((mime, duration)) if mime.contains('/') => (Some(mime.to_string()), duration),
                _ => (None, entry),
            };
            let max_age = humantime::parse_duration(duration.trim()).map_err(|e| {
                AppError::configuration(format!("cache entry '{entry}': {e}"))
            })?;
            Ok(CacheRule {
                mime_prefix: prefix,
                max_age,
            })
        })
        .collect()
}

/// Cache-Control value for a response content type, if any entry matches.
fn cache_control_for(rules: &[CacheRule], content_type: &str) -> Option<String> {
    rules
        .iter()
        .find(|rule| {
            rule.mime_prefix
                .as_deref()
                .map(|prefix| content_type.starts_with(prefix))
                .unwrap_or(true)
        })
        .map(|rule| format!("max-age={}", rule.max_age.as_secs()))
}

#[derive(Clone)]
pub struct AssetService {
    root: PathBuf,
    web_root: String,
    spa: bool,
    cache: Arc<Vec<CacheRule>>,
}

impl AssetService {
    pub fn new(
        root: PathBuf,
        web_root: impl Into<String>,
        spa: bool,
        cache: Arc<Vec<CacheRule>>,
    ) -> Self {
        Self {
            root,
            web_root: web_root.into(),
            spa,
            cache,
        }
    }

    /// Asset service for a `static` rule; `None` when the rule carries no
    /// assets location (which would be a provider bug).
    pub fn from_rule(rule: &Rule, cache: Arc<Vec<CacheRule>>) -> Option<Self> {
        let root = rule.assets_location.clone()?;
        Some(Self::new(root, rule.assets_web_root.clone(), rule.assets_spa, cache))
    }

    /// Serve one request from the tree.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let (mut parts, _body) = req.into_parts();

        // rebase the request path onto the tree root
        let full_path = parts.uri.path().to_string();
        let rel = full_path
            .strip_prefix(self.web_root.trim_end_matches('/'))
            .unwrap_or(&full_path);
        let rel = if rel.starts_with('/') {
            rel.to_string()
        } else {
            format!("/{rel}")
        };
        let rebased = match parts.uri.query() {
            Some(q) => format!("{rel}?{q}"),
            None => rel,
        };
        parts.uri = match rebased.parse() {
            Ok(uri) => uri,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        let req = Request::from_parts(parts, Body::empty());

        let served = if self.spa {
            let fallback = ServeFile::new(self.root.join("index.html"));
            ServeDir::new(&self.root)
                .not_found_service(fallback)
                .oneshot(req)
                .await
        } else {
            ServeDir::new(&self.root).oneshot(req).await
        };

        let mut response = match served {
            Ok(resp) => resp.map(Body::new),
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };

        if response.status().is_success() && !response.headers().contains_key(header::CACHE_CONTROL)
        {
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if let Some(value) = cache_control_for(&self.cache, &content_type) {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    response.headers_mut().insert(header::CACHE_CONTROL, value);
                }
            }
        }

        response
    }
}
