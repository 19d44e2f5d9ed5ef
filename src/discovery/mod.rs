//! Discovery aggregation
//!
//! The aggregator multiplexes every provider's change events, debounces
//! rebuild storms, and maintains the active rule snapshot: an immutable,
//! longest-pattern-first ordered list swapped atomically so readers never
//! observe a half-built set.

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::providers::{Provider, ProviderId};
use crate::rules::Rule;

/// The active rule set. Immutable; a rebuild publishes a fresh one.
pub type RuleSnapshot = Arc<Vec<Arc<Rule>>>;

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

pub struct Aggregator {
    providers: Vec<Arc<dyn Provider>>,
    snapshot: ArcSwap<Vec<Arc<Rule>>>,
    /// Last good rule set per provider, used when a `list()` call fails
    cached: Mutex<HashMap<ProviderId, Vec<Rule>>>,
    updated: watch::Sender<()>,
    debounce: Duration,
}

impl Aggregator {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Arc<Self> {
        Self::with_debounce(providers, DEBOUNCE_WINDOW)
    }

    pub fn with_debounce(providers: Vec<Arc<dyn Provider>>, debounce: Duration) -> Arc<Self> {
        let (updated, _) = watch::channel(());
        Arc::new(Self {
            providers,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            cached: Mutex::new(HashMap::new()),
            updated,
            debounce,
        })
    }

    /// Current snapshot; lock-free, O(1).
    pub fn snapshot(&self) -> RuleSnapshot {
        self.snapshot.load_full()
    }

    /// Ordered rule list for the management collaborator.
    pub fn mappers(&self) -> Vec<Arc<Rule>> {
        self.snapshot().as_ref().clone()
    }

    /// Notified after every snapshot publication.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.updated.subscribe()
    }

    /// Run the aggregation loop until cancelled. Spawns one event task per
    /// provider and rebuilds on start and on each (coalesced) change hint.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<ProviderId>(64);
        let mut event_tasks = JoinSet::new();
        for provider in &self.providers {
            let provider = provider.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            event_tasks.spawn(async move { provider.events(tx, cancel).await });
        }
        drop(tx);

        self.rebuild().await;

        'events: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'events,
                event = rx.recv() => {
                    let Some(id) = event else { break 'events };
                    debug!(provider = %id, "provider change event");

                    // coalesce events arriving within the debounce window
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'events,
                            _ = tokio::time::sleep(self.debounce) => break,
                            more = rx.recv() => match more {
                                Some(id) => trace!(provider = %id, "coalesced change event"),
                                None => break,
                            }
                        }
                    }
                    self.rebuild().await;
                }
            }
        }

        while event_tasks.join_next().await.is_some() {}
        debug!("aggregator stopped");
    }

    /// Query every provider in precedence order and publish a new snapshot.
    ///
    /// A provider whose listing fails contributes its previously cached
    /// rules; the rebuild itself never fails.
    pub async fn rebuild(&self) {
        let mut combined: Vec<Rule> = Vec::new();
        {
            let mut cache = self.cached.lock().await;
            for provider in &self.providers {
                let id = provider.id();
                match provider.list().await {
                    Ok(rules) => {
                        cache.insert(id, rules.clone());
                        combined.extend(rules);
                    }
                    Err(e) => {
                        let fallback = cache.get(&id).cloned().unwrap_or_default();
                        warn!(provider = %id, error = %e, cached = fallback.len(),
                            "provider listing failed, keeping cached rules");
                        combined.extend(fallback);
                    }
                }
            }
        }

        // drop re-delivered duplicates; first occurrence wins
        let mut seen = HashSet::new();
        combined.retain(|rule| seen.insert(rule.key()));

        // longest pattern first; the sort is stable so provider precedence
        // breaks ties between equal-length patterns
        combined.sort_by(|a, b| b.src.len().cmp(&a.src.len()));

        let snapshot: Vec<Arc<Rule>> = combined.into_iter().map(Arc::new).collect();
        info!(rules = snapshot.len(), "published rule snapshot");
        self.snapshot.store(Arc::new(snapshot));
        self.updated.send_replace(());
    }
}
