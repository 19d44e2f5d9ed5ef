//! Docker provider: routing rules derived from container labels
//!
//! Containers opt in through `reproxy.*` labels; with auto-API enabled every
//! running, non-excluded container gets a synthesized
//! `^/<name>/(.*) -> http://<ip>:<port>/$1` route even without labels.
//! The container listing is polled on a fixed interval and a change event is
//! emitted only when the derived rule set actually differs.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Provider, ProviderId, labels};
use crate::config::DockerProviderConfig;
use crate::errors::ProviderError;
use crate::rules::Rule;

pub struct DockerProvider {
    docker: Docker,
    config: DockerProviderConfig,
    last_fingerprint: Mutex<Option<String>>,
}

impl DockerProvider {
    pub fn connect(config: DockerProviderConfig) -> Result<Self, ProviderError> {
        let endpoint = config.endpoint.trim();
        let docker = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 20, bollard::API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("http://") || endpoint.starts_with("tcp://") {
            Docker::connect_with_http(endpoint, 20, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_local_defaults()?
        };
        Ok(Self {
            docker,
            config,
            last_fingerprint: Mutex::new(None),
        })
    }

    /// Primary name of a container, without the leading slash.
    fn container_name(container: &ContainerSummary) -> Option<String> {
        container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
    }

    /// IP of the container on the preferred (or first usable) network.
    fn container_ip(&self, container: &ContainerSummary) -> Option<String> {
        let networks = container.network_settings.as_ref()?.networks.as_ref()?;
        if let Some(wanted) = &self.config.network {
            return networks
                .get(wanted)
                .and_then(|n| n.ip_address.clone())
                .filter(|ip| !ip.is_empty());
        }
        networks
            .values()
            .filter_map(|n| n.ip_address.clone())
            .find(|ip| !ip.is_empty())
    }

    /// First exposed private port, unless overridden by label.
    fn container_port(container: &ContainerSummary) -> Option<u16> {
        container
            .ports
            .as_ref()
            .and_then(|ports| ports.iter().map(|p| p.private_port).min())
            .map(|p| p as u16)
    }

    fn rules_for(&self, container: &ContainerSummary) -> Vec<Rule> {
        let Some(name) = Self::container_name(container) else {
            return Vec::new();
        };
        let container_labels = container.labels.clone().unwrap_or_default();

        if !labels::enabled(&container_labels) {
            debug!(container = %name, "container disabled via label");
            return Vec::new();
        }

        let labeled = labels::has_route_labels(&container_labels);
        let auto = self.config.auto_api && !self.config.excluded.contains(&name);
        if !labeled && !auto {
            return Vec::new();
        }

        let Some(ip) = self.container_ip(container) else {
            debug!(container = %name, "no usable network address, skipping");
            return Vec::new();
        };
        let Some(port) = Self::container_port(container).or_else(|| {
            // a port label alone is enough; rules_from_labels applies it
            container_labels.contains_key("reproxy.port").then_some(0)
        }) else {
            debug!(container = %name, "no exposed port, skipping");
            return Vec::new();
        };

        match labels::rules_from_labels(&name, &ip, port, &container_labels, ProviderId::Docker) {
            Ok(rules) => rules,
            Err(e) => {
                // drop the offending container's rules, keep the rest
                warn!(container = %name, error = %e, "invalid container labels, skipping");
                Vec::new()
            }
        }
    }

    async fn running_containers(&self) -> Result<Vec<ContainerSummary>, ProviderError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    fn fingerprint(rules: &[Rule]) -> String {
        let mut keys: Vec<String> = rules.iter().map(|r| r.key().to_string()).collect();
        keys.sort();
        keys.join("\n")
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Docker
    }

    async fn list(&self) -> Result<Vec<Rule>, ProviderError> {
        let containers = self.running_containers().await?;
        let rules: Vec<Rule> = containers.iter().flat_map(|c| self.rules_for(c)).collect();
        debug!(count = rules.len(), "docker provider listed rules");
        Ok(rules)
    }

    async fn events(&self, tx: mpsc::Sender<ProviderId>, cancel: CancellationToken) {
        let _ = tx.send(self.id()).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.refresh_interval) => {}
            }

            let rules = match self.list().await {
                Ok(rules) => rules,
                Err(e) => {
                    warn!(error = %e, "docker listing failed");
                    continue;
                }
            };
            let fingerprint = Self::fingerprint(&rules);
            let mut last = self.last_fingerprint.lock().await;
            if last.as_deref() != Some(fingerprint.as_str()) {
                *last = Some(fingerprint);
                drop(last);
                if tx.send(self.id()).await.is_err() {
                    return;
                }
            }
        }
    }
}
