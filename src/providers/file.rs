//! File provider: a declarative YAML rules file watched for changes
//!
//! Canonical form:
//!
//! ```yaml
//! example.com:
//!   - { route: "^/api/(.*)", dest: "http://127.0.0.1:8080/$1", ping: "http://127.0.0.1:8080/ping" }
//! default:
//!   - { route: "^/fallback/(.*)", dest: "http://127.0.0.1:9000/$1" }
//! ```
//!
//! Entries under `default` apply to any host. The file is polled by mtime
//! plus content hash; after a change is noticed the provider waits a settle
//! delay before signalling, so writers finish before the re-read. A file
//! containing any invalid pattern is rejected wholesale and the previous
//! rules stay active.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Provider, ProviderId};
use crate::config::FileProviderConfig;
use crate::errors::ProviderError;
use crate::rules::{Rule, expand_servers};

/// One rule entry in the YAML file
#[derive(Debug, Clone, Deserialize)]
struct FileRule {
    route: String,
    dest: String,
    #[serde(default)]
    ping: Option<String>,
}

pub struct FileProvider {
    config: FileProviderConfig,
}

impl FileProvider {
    pub fn new(config: FileProviderConfig) -> Self {
        Self { config }
    }

    fn path_str(&self) -> String {
        self.config.path.display().to_string()
    }

    fn parse(&self, content: &str) -> Result<Vec<Rule>, ProviderError> {
        let doc: BTreeMap<String, Vec<FileRule>> =
            serde_yaml::from_str(content).map_err(|e| ProviderError::File {
                path: self.path_str(),
                message: e.to_string(),
            })?;

        let mut rules = Vec::new();
        for (server_key, entries) in &doc {
            let servers = if server_key == "default" {
                vec!["*".to_string()]
            } else {
                expand_servers(server_key)
            };
            for entry in entries {
                if entry.route.is_empty() || entry.dest.is_empty() {
                    return Err(ProviderError::File {
                        path: self.path_str(),
                        message: format!("entry under '{server_key}' is missing route or dest"),
                    });
                }
                for server in &servers {
                    let mut rule =
                        Rule::new(server.clone(), &entry.route, &entry.dest, ProviderId::File)?;
                    if let Some(ping) = &entry.ping {
                        rule = rule.with_ping(ping.clone());
                    }
                    rules.push(rule);
                }
            }
        }
        Ok(rules)
    }

    async fn fingerprint(&self) -> Option<(SystemTime, [u8; 32])> {
        let meta = tokio::fs::metadata(&self.config.path).await.ok()?;
        let mtime = meta.modified().ok()?;
        let content = tokio::fs::read(&self.config.path).await.ok()?;
        let digest: [u8; 32] = Sha256::digest(&content).into();
        Some((mtime, digest))
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn id(&self) -> ProviderId {
        ProviderId::File
    }

    async fn list(&self) -> Result<Vec<Rule>, ProviderError> {
        let content =
            tokio::fs::read_to_string(&self.config.path)
                .await
                .map_err(|e| ProviderError::File {
                    path: self.path_str(),
                    message: e.to_string(),
                })?;
        self.parse(&content)
    }

    async fn events(&self, tx: mpsc::Sender<ProviderId>, cancel: CancellationToken) {
        let mut last = self.fingerprint().await;
        let _ = tx.send(self.id()).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }

            let current = self.fingerprint().await;
            if current == last {
                continue;
            }
            debug!(path = %self.path_str(), "rules file changed, waiting for settle delay");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.delay) => {}
            }
            // re-read after the delay so a burst of writes is coalesced
            last = self.fingerprint().await;
            if last.is_none() {
                warn!(path = %self.path_str(), "rules file disappeared");
            }
            if tx.send(self.id()).await.is_err() {
                return;
            }
        }
    }
}
