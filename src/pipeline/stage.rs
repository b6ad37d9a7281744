//! Stage framework: identifiers, results and the executor trait

use crate::engine::{EngineSession, ProtocolEngine};
use crate::error::{FailureCause, FailureKind, StageError};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The seven checks, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Connectivity = 1,
    Protocol = 2,
    Reputation = 3,
    Speed = 4,
    Stability = 5,
    RouteQuality = 6,
    Tls = 7,
}

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::Connectivity,
        StageId::Protocol,
        StageId::Reputation,
        StageId::Speed,
        StageId::Stability,
        StageId::RouteQuality,
        StageId::Tls,
    ];

    /// 1-based position in the pipeline
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            StageId::Connectivity => "connectivity",
            StageId::Protocol => "protocol",
            StageId::Reputation => "reputation",
            StageId::Speed => "speed",
            StageId::Stability => "stability",
            StageId::RouteQuality => "route_quality",
            StageId::Tls => "tls",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number(), self.name())
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// A recorded measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetricValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Number(value as f64)
    }
}

impl From<u32> for MetricValue {
    fn from(value: u32) -> Self {
        MetricValue::Number(value as f64)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Bool(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

/// Result of one stage for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageStatus,
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    pub elapsed_ms: u64,
}

impl StageResult {
    pub fn from_output(stage: StageId, output: StageOutput, elapsed: Duration) -> Self {
        let (status, cause) = match &output.verdict {
            OutputVerdict::Passed => (StageStatus::Passed, None),
            OutputVerdict::Skipped => (StageStatus::Skipped, None),
            OutputVerdict::Failed(error) => (StageStatus::Failed, Some(error.to_cause())),
        };
        Self {
            stage,
            status,
            metrics: output.metrics,
            cause,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(stage: StageId, error: &StageError, elapsed: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            metrics: Metrics::new(),
            cause: Some(error.to_cause()),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn timed_out(stage: StageId, timeout: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::TimedOut,
            metrics: Metrics::new(),
            cause: Some(FailureCause::new(
                FailureKind::Timeout,
                format!("stage {} exceeded {:?}", stage, timeout),
            )),
            elapsed_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, StageStatus::Failed | StageStatus::TimedOut)
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(MetricValue::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.metrics.get(name).and_then(MetricValue::as_bool)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.metrics.get(name).and_then(MetricValue::as_str)
    }
}

#[derive(Debug)]
enum OutputVerdict {
    Passed,
    Skipped,
    Failed(StageError),
}

/// What an executor hands back: metrics plus pass/fail/skip
///
/// Executors return `Err` for failures that produced no measurements and
/// [`StageOutput::fail`] when they measured something but the result is not
/// good enough.
#[derive(Debug)]
pub struct StageOutput {
    metrics: Metrics,
    verdict: OutputVerdict,
}

impl StageOutput {
    pub fn passed() -> Self {
        Self {
            metrics: Metrics::new(),
            verdict: OutputVerdict::Passed,
        }
    }

    pub fn skipped() -> Self {
        Self {
            metrics: Metrics::new(),
            verdict: OutputVerdict::Skipped,
        }
    }

    pub fn metric(mut self, name: &str, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(name.to_string(), value.into());
        self
    }

    pub fn fail(mut self, error: StageError) -> Self {
        self.verdict = OutputVerdict::Failed(error);
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.verdict, OutputVerdict::Failed(_))
    }
}

/// Per-candidate state shared by the stages of one pipeline run
pub struct StageContext {
    engine: Arc<dyn ProtocolEngine>,
    session: Option<EngineSession>,
    resolved_ip: Option<IpAddr>,
    results: Vec<StageResult>,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn new(engine: Arc<dyn ProtocolEngine>, cancel: CancellationToken) -> Self {
        Self {
            engine,
            session: None,
            resolved_ip: None,
            results: Vec::new(),
            cancel,
        }
    }

    /// Engine session for the candidate, started on first use
    pub async fn session(&mut self, candidate: &Candidate) -> Result<&EngineSession, StageError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => self.engine.start(candidate).await?,
        };
        Ok(self.session.insert(session))
    }

    pub fn resolved_ip(&self) -> Option<IpAddr> {
        self.resolved_ip
    }

    pub fn set_resolved_ip(&mut self, ip: IpAddr) {
        self.resolved_ip = Some(ip);
    }

    pub fn result(&self, stage: StageId) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn push(&mut self, result: StageResult) {
        self.results.push(result);
    }

    /// Stage results and resolved address; stops the engine session
    pub(crate) fn finish(self) -> (Vec<StageResult>, Option<IpAddr>) {
        (self.results, self.resolved_ip)
    }
}

/// One pluggable check
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> StageId;

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError>;
}
