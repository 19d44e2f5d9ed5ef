//! Label-to-rule conversion shared by the docker and consul providers
//!
//! Both providers describe routes through `reproxy.*` key/value pairs:
//! container labels on one side, `reproxy.<key>=<value>` catalog tags on the
//! other. The mapping from a labeled service instance to routing rules is
//! identical and lives here.

use std::collections::HashMap;

use crate::errors::ProviderError;
use crate::providers::ProviderId;
use crate::rules::{AuthEntry, KeepHost, Rule, expand_servers, parse_only_from};

pub const LABEL_PREFIX: &str = "reproxy.";

const LABEL_ROUTE: &str = "reproxy.route";
const LABEL_DEST: &str = "reproxy.dest";
const LABEL_SERVER: &str = "reproxy.server";
const LABEL_PING: &str = "reproxy.ping";
const LABEL_ENABLED: &str = "reproxy.enabled";
const LABEL_KEEP_HOST: &str = "reproxy.keep-host";
const LABEL_REMOTE: &str = "reproxy.remote";
const LABEL_AUTH: &str = "reproxy.auth";
const LABEL_PORT: &str = "reproxy.port";

/// Whether the labels explicitly disable this instance.
/// Anything except `false`, `no` and `0` counts as enabled.
pub fn enabled(labels: &HashMap<String, String>) -> bool {
    labels
        .get(LABEL_ENABLED)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "no" | "0"))
        .unwrap_or(true)
}

/// Whether any `reproxy.` label is present at all.
pub fn has_route_labels(labels: &HashMap<String, String>) -> bool {
    labels.keys().any(|k| k.starts_with(LABEL_PREFIX))
}

/// Build the rules for one service instance.
///
/// Defaults when labels are absent produce the auto-API shape:
/// `^/<name>/(.*) -> http://<address>:<port>/$1` for any host. A relative
/// `reproxy.dest` is appended to the instance address; an absolute one is
/// taken verbatim.
pub fn rules_from_labels(
    name: &str,
    address: &str,
    port: u16,
    labels: &HashMap<String, String>,
    provider: ProviderId,
) -> Result<Vec<Rule>, ProviderError> {
    let port = match labels.get(LABEL_PORT) {
        Some(v) => v.trim().parse::<u16>().map_err(|_| {
            ProviderError::invalid_rule(name, format!("invalid {LABEL_PORT} value '{v}'"))
        })?,
        None => port,
    };

    let route = labels
        .get(LABEL_ROUTE)
        .cloned()
        .unwrap_or_else(|| format!("^/{name}/(.*)"));
    let dest = labels.get(LABEL_DEST).cloned().unwrap_or_else(|| "/$1".to_string());
    let dest = if dest.contains("://") || dest.starts_with("assets:") || dest.starts_with("spa:") {
        dest
    } else {
        format!("http://{address}:{port}{dest}")
    };

    let keep_host = match labels.get(LABEL_KEEP_HOST).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "true" | "yes" | "1") => KeepHost::Keep,
        Some(_) => KeepHost::Rewrite,
        None => KeepHost::Unset,
    };

    let only_from = match labels.get(LABEL_REMOTE) {
        Some(list) => {
            let entries: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            parse_only_from(&entries)?
        }
        None => Vec::new(),
    };

    let auth_users = match labels.get(LABEL_AUTH) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(AuthEntry::parse)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let servers = labels
        .get(LABEL_SERVER)
        .map(|s| expand_servers(s))
        .unwrap_or_else(|| vec!["*".to_string()]);

    let mut rules = Vec::with_capacity(servers.len());
    for server in servers {
        let mut rule = Rule::new(server, route.clone(), dest.clone(), provider)?
            .with_keep_host(keep_host)
            .with_only_from(only_from.clone())
            .with_auth_users(auth_users.clone());
        if let Some(ping) = labels.get(LABEL_PING) {
            rule = rule.with_ping(ping.clone());
        }
        rules.push(rule);
    }
    Ok(rules)
}
