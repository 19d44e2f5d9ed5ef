//! Routing rule model
//!
//! A [`Rule`] is one source-to-destination mapping contributed by a discovery
//! provider: a host scope, a compiled source pattern, a destination template
//! with `$N` back-references, an optional health URL and optional per-rule
//! access controls. Rules are immutable once built; liveness is tracked
//! separately by the health probe.

use ipnet::IpNet;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::errors::ProviderError;
use crate::providers::ProviderId;

pub mod balancer;
pub mod matcher;

/// How a matched request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MatchKind {
    /// Reverse-proxy to the expanded destination
    Proxy,
    /// Serve from a filesystem directory
    Static,
}

/// Host header policy for upstream requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepHost {
    /// Rule is silent; the global default applies
    #[default]
    Unset,
    /// Forward the client's Host header unchanged
    Keep,
    /// Rewrite Host to the destination's
    Rewrite,
}

/// One `user:bcrypt-hash` credential gating a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthEntry {
    pub user: String,
    pub hash: String,
}

impl AuthEntry {
    pub fn parse(entry: &str) -> Result<Self, ProviderError> {
        let (user, hash) = entry.split_once(':').ok_or_else(|| {
            ProviderError::invalid_rule(entry, "auth entry is not of the form user:bcrypt-hash")
        })?;
        if user.is_empty() || hash.is_empty() {
            return Err(ProviderError::invalid_rule(
                entry,
                "auth entry has an empty user or hash",
            ));
        }
        Ok(Self {
            user: user.to_string(),
            hash: hash.to_string(),
        })
    }
}

/// Identity of a rule within the active set.
///
/// Providers may re-deliver equivalent rules on every rebuild; this key is
/// what the aggregator deduplicates on and what the health map is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub provider: ProviderId,
    pub server: String,
    pub src: String,
    pub dst: String,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} -> {}",
            self.provider, self.server, self.src, self.dst
        )
    }
}

/// One routing rule
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    /// Host scope: a literal hostname or `*` for any
    pub server: String,
    /// Source pattern, as written
    pub src: String,
    /// Compiled source pattern
    #[serde(skip)]
    pub src_re: Regex,
    /// Destination template with `$N` back-references
    pub dst: String,
    /// Health URL; empty means "no checks, assume alive"
    pub ping_url: String,
    pub provider: ProviderId,
    pub match_kind: MatchKind,
    /// Filesystem root for `static` rules
    pub assets_location: Option<PathBuf>,
    /// URL prefix the asset tree is exposed under
    pub assets_web_root: String,
    /// Serve index.html for missing files
    pub assets_spa: bool,
    pub keep_host: KeepHost,
    /// Client allow-list; empty admits everyone
    #[serde(skip)]
    pub only_from: Vec<IpNet>,
    /// Rule-scoped credentials; empty means no rule auth
    pub auth_users: Vec<AuthEntry>,
}

impl Rule {
    /// Build a rule, compiling the source pattern and resolving the
    /// destination kind.
    ///
    /// Destinations prefixed `assets:<dir>` or `spa:<dir>` produce `static`
    /// rules rooted at `<dir>`, exposed under the literal prefix of the
    /// source pattern.
    pub fn new(
        server: impl Into<String>,
        src: impl Into<String>,
        dst: impl Into<String>,
        provider: ProviderId,
    ) -> Result<Self, ProviderError> {
        let server = server.into();
        let src = src.into();
        let dst = dst.into();

        let src_re = Regex::new(&src).map_err(|e| ProviderError::InvalidPattern {
            pattern: src.clone(),
            message: e.to_string(),
        })?;

        let (match_kind, assets_location, assets_spa) =
            if let Some(dir) = dst.strip_prefix("assets:") {
                (MatchKind::Static, Some(PathBuf::from(dir)), false)
            } else if let Some(dir) = dst.strip_prefix("spa:") {
                (MatchKind::Static, Some(PathBuf::from(dir)), true)
            } else {
                (MatchKind::Proxy, None, false)
            };
        let assets_web_root = match match_kind {
            MatchKind::Static => literal_prefix(&src),
            MatchKind::Proxy => String::new(),
        };

        Ok(Self {
            server,
            src,
            src_re,
            dst,
            ping_url: String::new(),
            provider,
            match_kind,
            assets_location,
            assets_web_root,
            assets_spa,
            keep_host: KeepHost::Unset,
            only_from: Vec::new(),
            auth_users: Vec::new(),
        })
    }

    pub fn with_ping(mut self, ping_url: impl Into<String>) -> Self {
        self.ping_url = ping_url.into();
        self
    }

    pub fn with_keep_host(mut self, keep_host: KeepHost) -> Self {
        self.keep_host = keep_host;
        self
    }

    pub fn with_only_from(mut self, nets: Vec<IpNet>) -> Self {
        self.only_from = nets;
        self
    }

    pub fn with_auth_users(mut self, users: Vec<AuthEntry>) -> Self {
        self.auth_users = users;
        self
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            provider: self.provider,
            server: self.server.clone(),
            src: self.src.clone(),
            dst: self.dst.clone(),
        }
    }

    /// Rules sharing a group are alternative destinations for one source.
    pub fn group_key(&self) -> String {
        format!("{}|{}", self.server.to_ascii_lowercase(), self.src)
    }

    /// Whether this rule's host scope covers the given server name.
    /// `server_name` is expected lowercased with the port already stripped.
    pub fn matches_host(&self, server_name: &str) -> bool {
        self.server == "*" || self.server.eq_ignore_ascii_case(server_name)
    }

    /// Whether the client address passes the rule's allow-list.
    pub fn admits(&self, client: IpAddr) -> bool {
        self.only_from.is_empty() || self.only_from.iter().any(|net| net.contains(&client))
    }
}

/// Expand a comma-separated server scope into one entry per host.
pub fn expand_servers(server: &str) -> Vec<String> {
    server
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an allow-list of CIDRs and bare IPs.
pub fn parse_only_from(entries: &[String]) -> Result<Vec<IpNet>, ProviderError> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            if let Ok(net) = entry.parse::<IpNet>() {
                return Ok(net);
            }
            entry
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|_| ProviderError::invalid_rule(entry, "not an IP address or CIDR"))
        })
        .collect()
}

/// The literal (regex-free) prefix of a source pattern, used as the web root
/// of provider-declared asset rules. `^/web/(.*)` yields `/web/`.
fn literal_prefix(src: &str) -> String {
    let src = src.strip_prefix('^').unwrap_or(src);
    let end = src
        .find(['(', '[', '{', '.', '*', '+', '?', '|', '$', '\\'])
        .unwrap_or(src.len());
    let prefix = &src[..end];
    if prefix.is_empty() {
        "/".to_string()
    } else {
        prefix.to_string()
    }
}
