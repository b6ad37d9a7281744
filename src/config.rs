//! Validator configuration
//!
//! Every option has a default matching the reference settings, so an empty
//! JSON object (or no file at all) is a valid configuration.

use crate::error::ConfigError;
use crate::pipeline::StageId;
use crate::reputation::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum acceptable connect latency in milliseconds
const DEFAULT_MAX_LATENCY_MS: u64 = 2000;

/// Default TCP connect timeout in milliseconds
const DEFAULT_TCP_TIMEOUT_MS: u64 = 3000;

/// Default timeout for a single HTTP request through the engine
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5000;

/// Default number of concurrent workers
const DEFAULT_WORKERS: usize = 25;

/// Default URL used to prove a tunnel carries traffic
const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Default download used for throughput measurement
const DEFAULT_SPEED_TEST_URL: &str = "https://speed.cloudflare.com/__down?bytes=5000000";

/// Default HTTPS endpoint whose certificate is inspected through the tunnel
const DEFAULT_TLS_PROBE_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";

/// Per-stage execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    pub enabled: bool,
    /// A failing blocking stage rejects the candidate; an advisory one only lowers its score
    pub blocking: bool,
    pub timeout_ms: u64,
}

impl StagePolicy {
    pub fn blocking(timeout_ms: u64) -> Self {
        Self {
            enabled: true,
            blocking: true,
            timeout_ms,
        }
    }

    pub fn advisory(timeout_ms: u64) -> Self {
        Self {
            enabled: true,
            blocking: false,
            timeout_ms,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Partial stage policy as written in a config file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StagePolicyOverride {
    enabled: Option<bool>,
    blocking: Option<bool>,
    timeout_ms: Option<u64>,
}

impl StagePolicyOverride {
    fn apply(self, base: StagePolicy) -> StagePolicy {
        StagePolicy {
            enabled: self.enabled.unwrap_or(base.enabled),
            blocking: self.blocking.unwrap_or(base.blocking),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StagePoliciesOverride {
    connectivity: StagePolicyOverride,
    protocol: StagePolicyOverride,
    reputation: StagePolicyOverride,
    speed: StagePolicyOverride,
    stability: StagePolicyOverride,
    route_quality: StagePolicyOverride,
    tls: StagePolicyOverride,
}

impl From<StagePoliciesOverride> for StagePolicies {
    fn from(o: StagePoliciesOverride) -> Self {
        let base = StagePolicies::default();
        Self {
            connectivity: o.connectivity.apply(base.connectivity),
            protocol: o.protocol.apply(base.protocol),
            reputation: o.reputation.apply(base.reputation),
            speed: o.speed.apply(base.speed),
            stability: o.stability.apply(base.stability),
            route_quality: o.route_quality.apply(base.route_quality),
            tls: o.tls.apply(base.tls),
        }
    }
}

/// Policies for the seven stages
///
/// Fields missing from a config file keep the stage's own default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StagePoliciesOverride")]
pub struct StagePolicies {
    pub connectivity: StagePolicy,
    pub protocol: StagePolicy,
    pub reputation: StagePolicy,
    pub speed: StagePolicy,
    pub stability: StagePolicy,
    pub route_quality: StagePolicy,
    pub tls: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            connectivity: StagePolicy::blocking(DEFAULT_TCP_TIMEOUT_MS),
            protocol: StagePolicy::blocking(6_000),
            reputation: StagePolicy::blocking(18_000),
            speed: StagePolicy::advisory(15_000),
            stability: StagePolicy::advisory(17_000),
            route_quality: StagePolicy::advisory(6_000),
            tls: StagePolicy::advisory(6_000),
        }
    }
}

impl StagePolicies {
    pub fn get(&self, stage: StageId) -> &StagePolicy {
        match stage {
            StageId::Connectivity => &self.connectivity,
            StageId::Protocol => &self.protocol,
            StageId::Reputation => &self.reputation,
            StageId::Speed => &self.speed,
            StageId::Stability => &self.stability,
            StageId::RouteQuality => &self.route_quality,
            StageId::Tls => &self.tls,
        }
    }

    pub fn get_mut(&mut self, stage: StageId) -> &mut StagePolicy {
        match stage {
            StageId::Connectivity => &mut self.connectivity,
            StageId::Protocol => &mut self.protocol,
            StageId::Reputation => &mut self.reputation,
            StageId::Speed => &mut self.speed,
            StageId::Stability => &mut self.stability,
            StageId::RouteQuality => &mut self.route_quality,
            StageId::Tls => &mut self.tls,
        }
    }

    /// Enabled stages in pipeline order
    pub fn enabled(&self) -> Vec<StageId> {
        StageId::ALL
            .into_iter()
            .filter(|stage| self.get(*stage).enabled)
            .collect()
    }
}

/// What producers do when the candidate queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    #[default]
    Block,
    Drop,
}

/// How per-provider answers combine into one blacklist verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCombination {
    /// Listed if any answering provider lists the key
    #[default]
    Any,
    /// Listed if more than half of the answering providers list the key
    Majority,
}

/// How the reputation stage treats an inconclusive verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InconclusivePolicy {
    #[default]
    Pass,
    Fail,
}

/// Reputation lookup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// DNSBL zones to query
    pub providers: Vec<String>,
    pub cache_ttl_secs: u64,
    pub query_timeout_ms: u64,
    pub combination: ProviderCombination,
    pub inconclusive: InconclusivePolicy,
    pub retry: RetryPolicy,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                "zen.spamhaus.org".to_string(),
                "bl.spamcop.net".to_string(),
                "dnsbl.sorbs.net".to_string(),
            ],
            cache_ttl_secs: 3600,
            query_timeout_ms: 5000,
            combination: ProviderCombination::Any,
            inconclusive: InconclusivePolicy::Pass,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReputationConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Weights of the composite score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub latency: f64,
    pub stability: f64,
    pub route_quality: f64,
    /// Added when measured throughput meets the speed floor
    pub speed_bonus: f64,
    /// Subtracted when measured throughput misses the speed floor
    pub speed_penalty: f64,
    /// Subtracted for every failed or timed-out advisory stage
    pub advisory_penalty: f64,
    /// Latency at which the latency component is worth half its weight
    pub latency_reference_ms: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            stability: 0.3,
            route_quality: 0.2,
            speed_bonus: 0.1,
            speed_penalty: 0.1,
            advisory_penalty: 0.05,
            latency_reference_ms: 500.0,
        }
    }
}

/// Reference host probed during route-quality analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHost {
    pub url: String,
    pub name: String,
}

impl RouteHost {
    pub fn new(url: &str, name: &str) -> Self {
        Self {
            url: url.to_string(),
            name: name.to_string(),
        }
    }
}

/// External protocol engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: PathBuf,
    pub startup_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xray"),
            startup_timeout_ms: 800,
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Configuration for a validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Candidates whose connect latency exceeds this are rejected
    pub max_latency_ms: u64,
    pub http_timeout_ms: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressureMode,
    /// Added to the sum of stage timeouts to form the per-candidate deadline
    pub deadline_overhead_ms: u64,
    pub probe_url: String,
    pub min_speed_mbps: f64,
    pub speed_test_url: String,
    pub stability_checks: u32,
    pub stability_success_rate: f64,
    pub route_quality_hosts: Vec<RouteHost>,
    pub tls_probe_url: String,
    /// Expected SHA-256 leaf fingerprints (hex) keyed by probe host
    pub pinned_fingerprints: HashMap<String, String>,
    pub engine: EngineConfig,
    pub reputation: ReputationConfig,
    pub weights: ScoreWeights,
    pub stages: StagePolicies,
    pub mmdb_path: Option<PathBuf>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_WORKERS * 4,
            backpressure: BackpressureMode::Block,
            deadline_overhead_ms: 2000,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            min_speed_mbps: 1.0,
            speed_test_url: DEFAULT_SPEED_TEST_URL.to_string(),
            stability_checks: 3,
            stability_success_rate: 0.7,
            route_quality_hosts: vec![
                RouteHost::new("http://www.gstatic.com/generate_204", "Google"),
                RouteHost::new("http://cp.cloudflare.com/generate_204", "Cloudflare"),
                RouteHost::new("http://connectivitycheck.android.com/generate_204", "Android"),
            ],
            tls_probe_url: DEFAULT_TLS_PROBE_URL.to_string(),
            pinned_fingerprints: HashMap::new(),
            engine: EngineConfig::default(),
            reputation: ReputationConfig::default(),
            weights: ScoreWeights::default(),
            stages: StagePolicies::default(),
            mmdb_path: None,
        }
    }
}

impl ValidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON configuration file; missing keys take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, mode: BackpressureMode) -> Self {
        self.backpressure = mode;
        self
    }

    pub fn with_tcp_timeout(mut self, timeout: Duration) -> Self {
        self.stages.connectivity.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_latency(mut self, latency: Duration) -> Self {
        self.max_latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn with_min_speed_mbps(mut self, mbps: f64) -> Self {
        self.min_speed_mbps = mbps;
        self
    }

    pub fn with_stage(mut self, stage: StageId, policy: StagePolicy) -> Self {
        *self.stages.get_mut(stage) = policy;
        self
    }

    pub fn with_stage_enabled(mut self, stage: StageId, enabled: bool) -> Self {
        self.stages.get_mut(stage).enabled = enabled;
        self
    }

    pub fn with_engine_binary(mut self, binary: PathBuf) -> Self {
        self.engine.binary = binary;
        self
    }

    pub fn with_mmdb_path(mut self, path: PathBuf) -> Self {
        self.mmdb_path = Some(path);
        self
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Worst-case wall-clock budget for one candidate
    pub fn candidate_deadline(&self) -> Duration {
        let stages: u64 = self
            .stages
            .enabled()
            .into_iter()
            .map(|stage| self.stages.get(stage).timeout_ms)
            .sum();
        Duration::from_millis(stages + self.deadline_overhead_ms)
    }

    /// How long the reputation stage waits for a verdict before calling it inconclusive
    pub fn reputation_budget(&self) -> Duration {
        self.stages.reputation.timeout() * 9 / 10
    }

    /// Longest a reputation lookup takes when every provider attempt times out
    pub fn reputation_worst_case(&self) -> Duration {
        self.reputation.retry.worst_case(self.reputation.query_timeout())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.stability_success_rate) {
            return Err(ConfigError::Invalid(
                "stability_success_rate must be within 0.0..=1.0".into(),
            ));
        }
        if self.min_speed_mbps < 0.0 {
            return Err(ConfigError::Invalid("min_speed_mbps must not be negative".into()));
        }
        if self.reputation.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reputation.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.stages.reputation.enabled && self.reputation_worst_case() > self.reputation_budget() {
            return Err(ConfigError::Invalid(format!(
                "reputation retries can take {:?}, more than the {:?} the reputation stage allows",
                self.reputation_worst_case(),
                self.reputation_budget()
            )));
        }
        let w = &self.weights;
        if [w.latency, w.stability, w.route_quality, w.speed_bonus, w.speed_penalty, w.advisory_penalty]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(ConfigError::Invalid("score weights must not be negative".into()));
        }
        if w.latency + w.stability + w.route_quality + w.speed_bonus <= 0.0 {
            return Err(ConfigError::Invalid("score weights sum to zero".into()));
        }
        if w.latency_reference_ms <= 0.0 {
            return Err(ConfigError::Invalid("latency_reference_ms must be positive".into()));
        }
        for stage in StageId::ALL {
            let policy = self.stages.get(stage);
            if policy.enabled && policy.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!("stage {} has a zero timeout", stage)));
            }
        }
        Ok(())
    }
}
