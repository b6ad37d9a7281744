//! Run-scoped reputation cache with single-flight lookups
//!
//! One [`ReputationCache`] is built per run and shared by every worker
//! through an `Arc`. For any key there is at most one upstream query set in
//! flight: the first caller starts it, concurrent callers await the same
//! shared future, and whoever observes completion first stores the verdict.
//! Entries expire lazily once their TTL has elapsed.

use crate::config::{ProviderCombination, ReputationConfig};
use crate::reputation::provider::{DnsblProvider, ReputationProvider};
use crate::reputation::retry::RetryPolicy;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Combined reputation status for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationStatus {
    Clean,
    Listed,
    /// No provider could answer; says nothing about the key
    Inconclusive,
}

/// What one provider said about a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOutcome {
    Listed,
    NotListed,
    Failed(String),
}

/// Verdict for a key, with per-provider detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: ReputationStatus,
    pub providers: BTreeMap<String, ProviderOutcome>,
}

impl Verdict {
    pub fn inconclusive(reason: &str) -> Self {
        let mut providers = BTreeMap::new();
        providers.insert("*".to_string(), ProviderOutcome::Failed(reason.to_string()));
        Self {
            status: ReputationStatus::Inconclusive,
            providers,
        }
    }

    /// Combine provider answers; failures never count towards a listing
    pub fn combine(
        providers: BTreeMap<String, ProviderOutcome>,
        combination: ProviderCombination,
    ) -> Self {
        let listed = providers
            .values()
            .filter(|o| matches!(o, ProviderOutcome::Listed))
            .count();
        let answered = providers
            .values()
            .filter(|o| !matches!(o, ProviderOutcome::Failed(_)))
            .count();

        let status = if answered == 0 {
            ReputationStatus::Inconclusive
        } else {
            let is_listed = match combination {
                ProviderCombination::Any => listed > 0,
                ProviderCombination::Majority => listed * 2 > answered,
            };
            if is_listed {
                ReputationStatus::Listed
            } else {
                ReputationStatus::Clean
            }
        };

        Self { status, providers }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.status == ReputationStatus::Listed
    }

    pub fn is_inconclusive(&self) -> bool {
        self.status == ReputationStatus::Inconclusive
    }

    /// Providers that listed the key
    pub fn listed_by(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, o)| matches!(o, ProviderOutcome::Listed))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// A stored verdict
#[derive(Debug, Clone)]
pub struct ReputationCacheEntry {
    pub key: String,
    pub verdict: Verdict,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl ReputationCacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

type Flight = Shared<BoxFuture<'static, Verdict>>;

enum Slot {
    Ready(ReputationCacheEntry),
    InFlight { id: u64, flight: Flight },
}

enum Probe {
    Hit(Verdict),
    Join(u64, Flight),
    Miss,
}

/// Counters describing cache behaviour over a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that joined an in-flight query instead of starting one
    pub coalesced: u64,
    /// Upstream query sets issued (one per miss that reached the providers)
    pub query_sets: u64,
    /// Individual provider queries, retries included
    pub provider_queries: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    query_sets: AtomicU64,
    provider_queries: AtomicU64,
}

/// Shared reputation lookup service
pub struct ReputationCache {
    providers: Arc<[Arc<dyn ReputationProvider>]>,
    ttl: Duration,
    combination: ProviderCombination,
    retry: RetryPolicy,
    slots: Mutex<HashMap<String, Slot>>,
    next_flight: AtomicU64,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl ReputationCache {
    pub fn new(providers: Vec<Arc<dyn ReputationProvider>>, ttl: Duration) -> Self {
        Self {
            providers: providers.into(),
            ttl,
            combination: ProviderCombination::default(),
            retry: RetryPolicy::default(),
            slots: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a cache querying the configured DNSBL zones
    pub fn from_config(config: &ReputationConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|zone| {
                Arc::new(DnsblProvider::new(zone, config.query_timeout())) as Arc<dyn ReputationProvider>
            })
            .collect();

        Self::new(providers, config.cache_ttl())
            .with_combination(config.combination)
            .with_retry(config.retry.clone())
    }

    pub fn with_combination(mut self, combination: ProviderCombination) -> Self {
        self.combination = combination;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // slot updates are single inserts/removes, so a poisoned map is still consistent
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Verdict for `key`, from cache, from an in-flight query, or from a new query set
    pub async fn lookup(&self, key: &str) -> Verdict {
        if self.shutdown.is_cancelled() {
            return Verdict::inconclusive("reputation cache shut down");
        }

        let probe = {
            let slots = self.slots();
            match slots.get(key) {
                Some(Slot::Ready(entry)) if entry.is_fresh(Instant::now()) => {
                    Probe::Hit(entry.verdict.clone())
                }
                Some(Slot::InFlight { id, flight }) => Probe::Join(*id, flight.clone()),
                _ => Probe::Miss,
            }
        };

        let (id, flight) = match probe {
            Probe::Hit(verdict) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "reputation cache hit");
                return verdict;
            }
            Probe::Join(id, flight) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "joining in-flight reputation query");
                (id, flight)
            }
            Probe::Miss => self.begin(key),
        };

        let verdict = flight.await;
        self.settle(key, id, &verdict);
        verdict
    }

    /// Register a new flight for `key` unless another caller beat us to it
    fn begin(&self, key: &str) -> (u64, Flight) {
        let mut slots = self.slots();
        if let Some(Slot::InFlight { id, flight }) = slots.get(key) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return (*id, flight.clone());
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let flight = self.start_flight(key.to_string());
        slots.insert(
            key.to_string(),
            Slot::InFlight {
                id,
                flight: flight.clone(),
            },
        );
        debug!(key, "reputation cache miss, querying providers");
        (id, flight)
    }

    fn start_flight(&self, key: String) -> Flight {
        let providers = Arc::clone(&self.providers);
        let retry = self.retry.clone();
        let combination = self.combination;
        let counters = Arc::clone(&self.counters);
        let cancel = self.shutdown.clone();

        async move {
            counters.query_sets.fetch_add(1, Ordering::Relaxed);
            let queries = providers.iter().map(|provider| {
                let retry = &retry;
                let key = &key;
                let counters = &counters;
                async move {
                    let result = retry
                        .run(|| {
                            counters.provider_queries.fetch_add(1, Ordering::Relaxed);
                            provider.is_listed(key)
                        })
                        .await;
                    let outcome = match result {
                        Ok(true) => ProviderOutcome::Listed,
                        Ok(false) => ProviderOutcome::NotListed,
                        Err(e) => {
                            warn!(key = %key, provider = provider.name(), error = %e, "reputation provider failed");
                            ProviderOutcome::Failed(e.to_string())
                        }
                    };
                    (provider.name().to_string(), outcome)
                }
            });

            tokio::select! {
                outcomes = join_all(queries) => {
                    Verdict::combine(outcomes.into_iter().collect(), combination)
                }
                _ = cancel.cancelled() => Verdict::inconclusive("reputation lookup cancelled"),
            }
        }
        .boxed()
        .shared()
    }

    /// Store the verdict of flight `id` if it still owns the slot
    fn settle(&self, key: &str, id: u64, verdict: &Verdict) {
        let mut slots = self.slots();
        let owns_slot = matches!(slots.get(key), Some(Slot::InFlight { id: current, .. }) if *current == id);
        if !owns_slot {
            return;
        }

        if verdict.is_inconclusive() {
            // not cached: the next lookup tries the providers again
            slots.remove(key);
        } else {
            slots.insert(
                key.to_string(),
                Slot::Ready(ReputationCacheEntry {
                    key: key.to_string(),
                    verdict: verdict.clone(),
                    fetched_at: Instant::now(),
                    ttl: self.ttl,
                }),
            );
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => entry.is_fresh(now),
            Slot::InFlight { .. } => true,
        });
        before - slots.len()
    }

    /// Fresh cached entry for `key`, if any
    pub fn get(&self, key: &str) -> Option<ReputationCacheEntry> {
        match self.slots().get(key) {
            Some(Slot::Ready(entry)) if entry.is_fresh(Instant::now()) => Some(entry.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            query_sets: self.counters.query_sets.load(Ordering::Relaxed),
            provider_queries: self.counters.provider_queries.load(Ordering::Relaxed),
        }
    }

    /// Cancel in-flight queries and answer every pending and future lookup
    /// with an inconclusive verdict
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let mut slots = self.slots();
        slots.retain(|_, slot| matches!(slot, Slot::Ready(_)));
        info!(entries = slots.len(), "reputation cache shut down");
    }
}

impl std::fmt::Debug for ReputationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationCache")
            .field("providers", &self.providers.len())
            .field("ttl", &self.ttl)
            .field("combination", &self.combination)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ReputationError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Provider answering from a fixed list after a delay, counting queries
    pub(crate) struct FakeProvider {
        pub name: String,
        pub listed: Vec<String>,
        pub fail: bool,
        pub delay: Duration,
        pub queries: AtomicUsize,
    }

    impl FakeProvider {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                listed: Vec::new(),
                fail: false,
                delay: Duration::from_millis(50),
                queries: AtomicUsize::new(0),
            }
        }

        pub(crate) fn listing(mut self, key: &str) -> Self {
            self.listed.push(key.to_string());
            self
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReputationProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn is_listed(&self, key: &str) -> Result<bool, ReputationError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ReputationError::Lookup {
                    provider: self.name.clone(),
                    reason: "network unreachable".to_string(),
                });
            }
            Ok(self.listed.iter().any(|k| k == key))
        }
    }

    fn cache_with(providers: Vec<Arc<FakeProvider>>, ttl: Duration) -> ReputationCache {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn ReputationProvider>)
            .collect();
        ReputationCache::new(providers, ttl).with_retry(RetryPolicy::none())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_share_one_query() {
        let a = Arc::new(FakeProvider::new("a"));
        let b = Arc::new(FakeProvider::new("b"));
        let cache = cache_with(vec![a.clone(), b.clone()], Duration::from_secs(60));

        let verdicts = join_all((0..10).map(|_| cache.lookup("192.0.2.1"))).await;

        assert!(verdicts.iter().all(|v| *v == verdicts[0]));
        assert_eq!(verdicts[0].status, ReputationStatus::Clean);
        assert_eq!(a.queries(), 1);
        assert_eq!(b.queries(), 1);
        let stats = cache.stats();
        assert_eq!(stats.query_sets, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_reused_until_ttl() {
        let provider = Arc::new(FakeProvider::new("a"));
        let cache = cache_with(vec![provider.clone()], Duration::from_secs(60));

        cache.lookup("192.0.2.1").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.lookup("192.0.2.1").await;
        assert_eq!(provider.queries(), 1);
        assert_eq!(cache.stats().hits, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("192.0.2.1").is_none());
        cache.lookup("192.0.2.1").await;
        assert_eq!(provider.queries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_combination_lists_on_single_hit() {
        let a = Arc::new(FakeProvider::new("a").listing("192.0.2.9"));
        let b = Arc::new(FakeProvider::new("b"));
        let c = Arc::new(FakeProvider::new("c"));
        let cache = cache_with(vec![a, b, c], Duration::from_secs(60));

        let verdict = cache.lookup("192.0.2.9").await;
        assert!(verdict.is_blacklisted());
        assert_eq!(verdict.listed_by(), vec!["a"]);
        assert_eq!(verdict.providers["b"], ProviderOutcome::NotListed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_majority_combination() {
        let a = Arc::new(FakeProvider::new("a").listing("192.0.2.9"));
        let b = Arc::new(FakeProvider::new("b"));
        let c = Arc::new(FakeProvider::new("c"));
        let cache = cache_with(vec![a, b, c], Duration::from_secs(60))
            .with_combination(ProviderCombination::Majority);
        assert_eq!(cache.lookup("192.0.2.9").await.status, ReputationStatus::Clean);

        let a = Arc::new(FakeProvider::new("a").listing("192.0.2.9"));
        let b = Arc::new(FakeProvider::new("b").listing("192.0.2.9"));
        let c = Arc::new(FakeProvider::new("c"));
        let cache = cache_with(vec![a, b, c], Duration::from_secs(60))
            .with_combination(ProviderCombination::Majority);
        assert_eq!(cache.lookup("192.0.2.9").await.status, ReputationStatus::Listed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failing_is_inconclusive_and_not_cached() {
        let a = Arc::new(FakeProvider::new("a").failing());
        let b = Arc::new(FakeProvider::new("b").failing());
        let cache = cache_with(vec![a.clone(), b], Duration::from_secs(60))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(100), 2.0));

        let verdict = cache.lookup("192.0.2.1").await;
        assert!(verdict.is_inconclusive());
        assert!(!verdict.is_blacklisted());
        assert_eq!(a.queries(), 3);
        assert!(cache.is_empty());

        cache.lookup("192.0.2.1").await;
        assert_eq!(a.queries(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_still_conclusive() {
        let a = Arc::new(FakeProvider::new("a").failing());
        let b = Arc::new(FakeProvider::new("b"));
        let cache = cache_with(vec![a, b], Duration::from_secs(60));

        let verdict = cache.lookup("192.0.2.1").await;
        assert_eq!(verdict.status, ReputationStatus::Clean);
        assert!(matches!(verdict.providers["a"], ProviderOutcome::Failed(_)));
        assert!(cache.get("192.0.2.1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_waiters() {
        let slow = Arc::new(FakeProvider::new("slow").with_delay(Duration::from_secs(600)));
        let cache = Arc::new(cache_with(vec![slow], Duration::from_secs(60)));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.lookup("192.0.2.1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.shutdown();
        let verdict = waiter.await.unwrap();
        assert!(verdict.is_inconclusive());
        assert!(cache.lookup("192.0.2.1").await.is_inconclusive());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_stale_entries() {
        let provider = Arc::new(FakeProvider::new("a"));
        let cache = cache_with(vec![provider], Duration::from_secs(10));

        cache.lookup("192.0.2.1").await;
        cache.lookup("192.0.2.2").await;
        assert_eq!(cache.sweep(), 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_verdict_combine_without_answers() {
        let mut providers = BTreeMap::new();
        providers.insert("a".to_string(), ProviderOutcome::Failed("down".into()));
        let verdict = Verdict::combine(providers, ProviderCombination::Any);
        assert!(verdict.is_inconclusive());
    }
}
