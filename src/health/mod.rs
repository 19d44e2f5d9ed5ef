//! Rule health probing
//!
//! Every rule carrying a ping URL is probed on a fixed interval; a 2xx
//! response marks it alive, anything else (connection failure, timeout,
//! non-2xx) marks it dead. Rules without a ping URL are always alive.
//! Probe results feed the load-balancer's alive-subset selection.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;
use crate::discovery::{Aggregator, RuleSnapshot};
use crate::rules::{Rule, RuleKey};

/// Outcome of the latest probe of one rule
#[derive(Debug, Clone)]
pub struct ProbeStatus {
    pub alive: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProbeStatus {
    /// New rules start alive and are confirmed on the next sweep.
    fn optimistic() -> Self {
        Self {
            alive: true,
            checked_at: None,
            last_error: None,
        }
    }
}

pub struct HealthService {
    config: HealthCheckConfig,
    client: reqwest::Client,
    /// Probed rules only; absence means "no checks, assume alive".
    /// Single writer (the sweep), many readers; whole-map swap under the
    /// write lock so readers always see one complete sweep.
    state: RwLock<HashMap<RuleKey, ProbeStatus>>,
}

impl HealthService {
    pub fn new(config: HealthCheckConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            client,
            state: RwLock::new(HashMap::new()),
        })
    }

    /// Whether the rule should receive traffic.
    pub fn is_alive(&self, key: &RuleKey) -> bool {
        self.state
            .read()
            .expect("health state lock poisoned")
            .get(key)
            .map(|s| s.alive)
            .unwrap_or(true)
    }

    /// Status map snapshot for the management collaborator.
    pub fn statuses(&self) -> HashMap<RuleKey, ProbeStatus> {
        self.state
            .read()
            .expect("health state lock poisoned")
            .clone()
    }

    /// Run the probe scheduler until cancelled, reconciling the status map
    /// whenever the aggregator publishes a new snapshot.
    pub async fn run(
        self: Arc<Self>,
        discovery: Arc<Aggregator>,
        cancel: CancellationToken,
    ) {
        let mut updates = discovery.subscribe();
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep(discovery.snapshot()).await;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile(discovery.snapshot());
                }
            }
        }
        debug!("health probe stopped");
    }

    /// Probe every rule with a ping URL, bounded by the configured
    /// concurrency, and swap in the full result map.
    pub async fn sweep(&self, snapshot: RuleSnapshot) {
        let targets: Vec<Arc<Rule>> = snapshot
            .iter()
            .filter(|r| !r.ping_url.is_empty())
            .cloned()
            .collect();
        if targets.is_empty() {
            let mut state = self.state.write().expect("health state lock poisoned");
            state.clear();
            return;
        }

        let results: Vec<(RuleKey, ProbeStatus)> = futures::stream::iter(targets)
            .map(|rule| {
                let client = self.client.clone();
                async move {
                    let status = Self::probe(&client, &rule).await;
                    (rule.key(), status)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let dead = results.iter().filter(|(_, s)| !s.alive).count();
        if dead > 0 {
            warn!(dead, total = results.len(), "health sweep found dead destinations");
        } else {
            debug!(total = results.len(), "health sweep completed");
        }

        let mut state = self.state.write().expect("health state lock poisoned");
        *state = results.into_iter().collect();
    }

    async fn probe(client: &reqwest::Client, rule: &Rule) -> ProbeStatus {
        let checked_at = Some(Utc::now());
        match client.get(&rule.ping_url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeStatus {
                alive: true,
                checked_at,
                last_error: None,
            },
            Ok(resp) => ProbeStatus {
                alive: false,
                checked_at,
                last_error: Some(format!("ping returned {}", resp.status())),
            },
            Err(e) => ProbeStatus {
                alive: false,
                checked_at,
                last_error: Some(e.to_string()),
            },
        }
    }

    /// Align the status map with a new snapshot: drop removed rules, admit
    /// new ones optimistically until the next sweep confirms them.
    pub fn reconcile(&self, snapshot: RuleSnapshot) {
        let mut state = self.state.write().expect("health state lock poisoned");
        let mut next: HashMap<RuleKey, ProbeStatus> = HashMap::new();
        for rule in snapshot.iter().filter(|r| !r.ping_url.is_empty()) {
            let key = rule.key();
            let status = state.remove(&key).unwrap_or_else(ProbeStatus::optimistic);
            next.insert(key, status);
        }
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderId;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service() -> Arc<HealthService> {
        HealthService::new(HealthCheckConfig {
            interval: Duration::from_secs(300),
            timeout: Duration::from_millis(500),
            concurrency: 4,
        })
    }

    fn snapshot(rules: Vec<Rule>) -> RuleSnapshot {
        Arc::new(rules.into_iter().map(Arc::new).collect())
    }

    #[tokio::test]
    async fn rule_without_ping_is_always_alive() {
        let health = service();
        let rule = Rule::new("*", "^/", "http://u/", ProviderId::Static).unwrap();
        health.sweep(snapshot(vec![rule.clone()])).await;
        assert!(health.is_alive(&rule.key()));
    }

    #[tokio::test]
    async fn sweep_marks_destinations_by_ping_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let good = Rule::new("*", "^/a/(.*)", "http://a/$1", ProviderId::Static)
            .unwrap()
            .with_ping(format!("{}/good", server.uri()));
        let bad = Rule::new("*", "^/a/(.*)", "http://b/$1", ProviderId::Static)
            .unwrap()
            .with_ping(format!("{}/bad", server.uri()));

        let health = service();
        health.sweep(snapshot(vec![good.clone(), bad.clone()])).await;

        assert!(health.is_alive(&good.key()));
        assert!(!health.is_alive(&bad.key()));

        let statuses = health.statuses();
        let bad_status = statuses.get(&bad.key()).unwrap();
        assert!(bad_status.last_error.as_ref().unwrap().contains("500"));
        assert!(bad_status.checked_at.is_some());
    }

    #[tokio::test]
    async fn unreachable_ping_marks_dead() {
        // nothing listens on this port
        let rule = Rule::new("*", "^/", "http://u/", ProviderId::Static)
            .unwrap()
            .with_ping("http://127.0.0.1:1/ping");
        let health = service();
        health.sweep(snapshot(vec![rule.clone()])).await;
        assert!(!health.is_alive(&rule.key()));
    }

    #[tokio::test]
    async fn reconcile_admits_new_rules_optimistically() {
        let health = service();

        let old = Rule::new("*", "^/old/(.*)", "http://old/$1", ProviderId::Static)
            .unwrap()
            .with_ping("http://127.0.0.1:1/ping");
        health.sweep(snapshot(vec![old.clone()])).await;
        assert!(!health.is_alive(&old.key()));

        let new = Rule::new("*", "^/new/(.*)", "http://new/$1", ProviderId::Static)
            .unwrap()
            .with_ping("http://127.0.0.1:1/ping");
        health.reconcile(snapshot(vec![new.clone()]));

        // the new rule starts alive, the removed one is forgotten
        assert!(health.is_alive(&new.key()));
        assert!(health.statuses().get(&old.key()).is_none());
    }

    #[tokio::test]
    async fn reconcile_keeps_existing_verdicts() {
        let health = service();
        let rule = Rule::new("*", "^/x/(.*)", "http://x/$1", ProviderId::Static)
            .unwrap()
            .with_ping("http://127.0.0.1:1/ping");
        health.sweep(snapshot(vec![rule.clone()])).await;
        assert!(!health.is_alive(&rule.key()));

        health.reconcile(snapshot(vec![rule.clone()]));
        // a surviving rule keeps its dead verdict until the next sweep
        assert!(!health.is_alive(&rule.key()));
    }
}
