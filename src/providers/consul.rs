//! Consul catalog provider
//!
//! Enumerates catalog services, keeps those carrying any `reproxy.`-prefixed
//! tag, then lists each service's instances and converts the tags to the
//! shared label map (`reproxy.<key>=<value>`; tags without `=` or with an
//! empty value become empty-string labels). A change event is emitted only
//! when the set of service-instance IDs differs from the previous poll.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Provider, ProviderId, labels};
use crate::config::ConsulProviderConfig;
use crate::errors::ProviderError;
use crate::rules::Rule;

/// One instance of a catalog service
#[derive(Debug, Clone, Deserialize)]
struct CatalogService {
    #[serde(rename = "ServiceID")]
    service_id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "ServiceAddress", default)]
    service_address: String,
    #[serde(rename = "ServicePort", default)]
    service_port: u16,
    #[serde(rename = "ServiceTags", default)]
    service_tags: Vec<String>,
}

impl CatalogService {
    /// Instance address; the service-level address wins over the node's.
    fn addr(&self) -> &str {
        if self.service_address.is_empty() {
            &self.address
        } else {
            &self.service_address
        }
    }
}

pub struct ConsulProvider {
    client: reqwest::Client,
    config: ConsulProviderConfig,
    last_instances: Mutex<Option<BTreeSet<String>>>,
}

impl ConsulProvider {
    pub fn new(config: ConsulProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            last_instances: Mutex::new(None),
        }
    }

    /// Catalog services whose tag list mentions reproxy at all.
    async fn routed_services(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/catalog/services", self.config.address);
        let services: HashMap<String, Vec<String>> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut names: Vec<String> = services
            .into_iter()
            .filter(|(_, tags)| tags.iter().any(|t| t.starts_with(labels::LABEL_PREFIX)))
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn instances(&self, service: &str) -> Result<Vec<CatalogService>, ProviderError> {
        let url = format!("{}/v1/catalog/service/{}", self.config.address, service);
        Ok(self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// `reproxy.<key>=<value>` tags as a label map.
    fn tags_to_labels(tags: &[String]) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for tag in tags {
            let Some(rest) = tag.strip_prefix(labels::LABEL_PREFIX) else {
                continue;
            };
            let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
            map.insert(format!("{}{}", labels::LABEL_PREFIX, key), value.to_string());
        }
        map
    }

    /// The identity set used for change detection.
    async fn instance_ids(&self) -> Result<BTreeSet<String>, ProviderError> {
        let mut ids = BTreeSet::new();
        for service in self.routed_services().await? {
            for instance in self.instances(&service).await? {
                ids.insert(format!("{service}/{}", instance.service_id));
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl Provider for ConsulProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Consul
    }

    async fn list(&self) -> Result<Vec<Rule>, ProviderError> {
        let mut rules = Vec::new();
        for service in self.routed_services().await? {
            for instance in self.instances(&service).await? {
                let tag_labels = Self::tags_to_labels(&instance.service_tags);
                match labels::rules_from_labels(
                    &service,
                    instance.addr(),
                    instance.service_port,
                    &tag_labels,
                    ProviderId::Consul,
                ) {
                    Ok(mut derived) => rules.append(&mut derived),
                    Err(e) => {
                        warn!(service = %service, instance = %instance.service_id, error = %e,
                            "invalid catalog tags, skipping instance");
                    }
                }
            }
        }
        debug!(count = rules.len(), "consul provider listed rules");
        Ok(rules)
    }

    async fn events(&self, tx: mpsc::Sender<ProviderId>, cancel: CancellationToken) {
        let _ = tx.send(self.id()).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.refresh_interval) => {}
            }

            let ids = match self.instance_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "consul catalog poll failed");
                    continue;
                }
            };
            let mut last = self.last_instances.lock().await;
            if last.as_ref() != Some(&ids) {
                *last = Some(ids);
                drop(last);
                if tx.send(self.id()).await.is_err() {
                    return;
                }
            }
        }
    }
}
