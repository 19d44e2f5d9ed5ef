//! Application supervisor
//!
//! `build_core` wires the configuration into the core services and returns
//! their handles; `run` spawns every background task (aggregator, health
//! probe, plugin conductor, proxy listeners) from one place, owns the root
//! cancellation token, and drains the join set on shutdown.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::discovery::Aggregator;
use crate::errors::{AppError, AppResult};
use crate::health::HealthService;
use crate::plugins::Conductor;
use crate::providers::build_providers;
use crate::proxy::{self, Gateway};

/// Handles to the core services, the embedding surface for the external
/// driver and the management collaborator (routes via
/// `discovery.mappers()`, metrics via the Prometheus handle).
pub struct CoreHandles {
    pub config: Arc<Config>,
    pub discovery: Arc<Aggregator>,
    pub health: Arc<HealthService>,
    pub conductor: Arc<Conductor>,
    pub gateway: Arc<Gateway>,
    pub metrics: Option<PrometheusHandle>,
}

/// Validate the configuration and construct the core services.
pub fn build_core(config: Config) -> AppResult<CoreHandles> {
    config.validate()?;
    let config = Arc::new(config);

    let metrics = match crate::metrics::init() {
        Ok(handle) => Some(handle),
        Err(e) => {
            // a second core in one process (tests, embedding) cannot
            // install another global recorder
            warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let providers = build_providers(&config)?;
    info!(providers = providers.len(), "discovery providers assembled");
    let discovery = Aggregator::new(providers);
    let health = HealthService::new(config.healthcheck.clone());
    let conductor = Arc::new(Conductor::new());
    let gateway = Gateway::new(
        config.clone(),
        discovery.clone(),
        health.clone(),
        conductor.clone(),
    )?;

    Ok(CoreHandles {
        config,
        discovery,
        health,
        conductor,
        gateway,
        metrics,
    })
}

/// Run the whole system until SIGINT/SIGTERM.
pub async fn run(config: Config) -> AppResult<()> {
    let core = build_core(config)?;
    let cancel = CancellationToken::new();
    let fatal: Arc<Mutex<Option<AppError>>> = Arc::new(Mutex::new(None));
    let mut tasks: JoinSet<()> = JoinSet::new();

    tasks.spawn(core.discovery.clone().run(cancel.child_token()));
    tasks.spawn(
        core.health
            .clone()
            .run(core.discovery.clone(), cancel.child_token()),
    );

    if core.config.plugin.enabled {
        let addr = core
            .config
            .plugin
            .listen
            .parse()
            .map_err(|e| AppError::configuration(format!("plugin listen address: {e}")))?;
        let conductor = core.conductor.clone();
        let token = cancel.child_token();
        let cancel_all = cancel.clone();
        let fatal = fatal.clone();
        tasks.spawn(async move {
            if let Err(e) = conductor.serve(addr, token).await {
                error!(error = %e, "plugin conductor failed");
                *fatal.lock().expect("fatal lock") = Some(AppError::Io(e));
                cancel_all.cancel();
            }
        });
    }

    {
        let gateway = core.gateway.clone();
        let token = cancel.child_token();
        let cancel_all = cancel.clone();
        let fatal = fatal.clone();
        tasks.spawn(async move {
            if let Err(e) = proxy::serve(gateway, token).await {
                error!(error = %e, "proxy listener failed");
                *fatal.lock().expect("fatal lock") = Some(e);
                cancel_all.cancel();
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "background task panicked");
        }
    }

    match fatal.lock().expect("fatal lock").take() {
        Some(e) => Err(e),
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
