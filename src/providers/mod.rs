//! Discovery provider contract and implementations
//!
//! A provider is any subsystem supplying routing rules and change hints:
//! static configuration strings, a declarative YAML file, the container
//! runtime, or a service catalog. The aggregator consumes providers through
//! the [`Provider`] trait and tolerates spurious change events.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::{AppResult, ProviderError};
use crate::rules::Rule;

pub mod consul;
pub mod docker;
pub mod file;
pub mod labels;
pub mod static_rules;

/// Identifies which provider produced a rule.
///
/// The variant order is also the precedence order used by the aggregator
/// when otherwise-equivalent rules conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderId {
    Static,
    File,
    Docker,
    Consul,
    System,
}

/// Abstract source of routing rules.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Current rule set as a finite sequence.
    async fn list(&self) -> Result<Vec<Rule>, ProviderError>;

    /// Run until cancelled, sending a change hint whenever `list()` *may*
    /// now return a different set. Spurious hints are fine.
    async fn events(&self, tx: mpsc::Sender<ProviderId>, cancel: CancellationToken);
}

/// Assemble the enabled providers in their fixed precedence order:
/// static, file, docker, consul.
pub fn build_providers(config: &Config) -> AppResult<Vec<Arc<dyn Provider>>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if !config.providers.static_rules.rules.is_empty() {
        providers.push(Arc::new(static_rules::StaticProvider::new(
            &config.providers.static_rules.rules,
        )?));
    }
    if config.providers.file.enabled {
        providers.push(Arc::new(file::FileProvider::new(
            config.providers.file.clone(),
        )));
    }
    if config.providers.docker.enabled {
        providers.push(Arc::new(docker::DockerProvider::connect(
            config.providers.docker.clone(),
        )?));
    }
    if config.providers.consul.enabled {
        providers.push(Arc::new(consul::ConsulProvider::new(
            config.providers.consul.clone(),
        )));
    }

    Ok(providers)
}
