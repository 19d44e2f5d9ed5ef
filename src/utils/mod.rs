//! Common utilities shared across the proxy layers

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Strip a port suffix from a host value.
///
/// Handles bracketed IPv6 literals (`[::1]:8080`), plain `host:port` pairs
/// and bare hostnames.
pub fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        // bracketed IPv6, with or without port
        return stripped.split(']').next().unwrap_or(stripped);
    }
    // an unbracketed value with more than one colon is an IPv6 literal
    if host.matches(':').count() > 1 {
        return host;
    }
    host.split(':').next().unwrap_or(host)
}

/// Resolve the server name of a request from its Host header, falling back
/// to the URI authority for HTTP/2-style requests.
pub fn request_host(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .map(|h| strip_port(&h).to_ascii_lowercase())
}

/// Resolve the client IP of a request.
///
/// Prefers `X-Real-IP`, then the first entry of `X-Forwarded-For`, then the
/// remote socket address. Unparseable header values fall through.
pub fn client_ip(headers: &HeaderMap, remote: &SocketAddr) -> IpAddr {
    if let Some(real) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return real;
    }
    if let Some(fwd) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return fwd;
    }
    remote.ip()
}

/// Parse a human-readable size string (`64KB`, `1MB`, `1048576`) into bytes.
///
/// A value of `0` (or an empty string) means "no limit".
pub fn parse_size(value: &str) -> Result<u64, String> {
    let v = value.trim();
    if v.is_empty() {
        return Ok(0);
    }
    let split = v
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(v.len());
    let (digits, suffix) = v.split_at(split);
    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size value '{value}'"))?;
    let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size suffix '{other}'")),
    };
    Ok(base * multiplier)
}
