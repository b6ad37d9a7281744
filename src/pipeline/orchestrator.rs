//! Drives one candidate through the enabled stages

use crate::config::{StagePolicy, ValidatorConfig};
use crate::engine::ProtocolEngine;
use crate::error::{FailureCause, FailureKind};
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageResult};
use crate::pipeline::stages::build_stages;
use crate::proxy::models::Candidate;
use crate::reputation::ReputationCache;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Terminal outcome of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordVerdict {
    Accepted,
    Rejected,
}

/// Everything learned about one candidate in one run
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    /// Position of the candidate in the input
    pub seq: usize,
    pub candidate: Candidate,
    /// Results of the stages that ran, in pipeline order
    pub stages: Vec<StageResult>,
    pub verdict: RecordVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<IpAddr>,
}

impl CandidateRecord {
    /// Record for a candidate that never reached a stage
    pub fn rejected(seq: usize, candidate: Candidate, cause: FailureCause) -> Self {
        Self {
            seq,
            candidate,
            stages: Vec::new(),
            verdict: RecordVerdict::Rejected,
            cause: Some(cause),
            resolved_ip: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == RecordVerdict::Accepted
    }

    pub fn result(&self, stage: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// Why a stage invocation did not produce a result
enum Interrupt {
    Shutdown,
    Deadline,
}

impl Interrupt {
    fn cause(&self, stage: StageId) -> FailureCause {
        let message = match self {
            Interrupt::Shutdown => format!("cancelled by shutdown during stage {}", stage),
            Interrupt::Deadline => format!("candidate deadline exceeded during stage {}", stage),
        };
        FailureCause::new(FailureKind::GlobalDeadlineExceeded, message)
    }
}

struct PlannedStage {
    policy: StagePolicy,
    executor: Arc<dyn StageExecutor>,
}

/// Stage state machine for a single candidate
///
/// Stages run strictly in order. A failed or timed-out blocking stage
/// rejects the candidate and nothing after it runs; an advisory failure is
/// recorded and the pass continues. The deadline and the cancellation token
/// preempt whatever stage is in progress.
pub struct Orchestrator {
    stages: Vec<PlannedStage>,
    engine: Arc<dyn ProtocolEngine>,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ProtocolEngine>) -> Self {
        Self {
            stages: Vec::new(),
            engine,
        }
    }

    /// Orchestrator running every enabled stage of `config`
    pub fn from_config(
        config: &ValidatorConfig,
        engine: Arc<dyn ProtocolEngine>,
        cache: &Arc<ReputationCache>,
    ) -> Self {
        build_stages(config, cache)
            .into_iter()
            .fold(Self::new(engine), |orchestrator, executor| {
                let policy = config.stages.get(executor.stage()).clone();
                orchestrator.with_stage(policy, executor)
            })
    }

    /// Append a stage; disabled policies are ignored
    pub fn with_stage(mut self, policy: StagePolicy, executor: Arc<dyn StageExecutor>) -> Self {
        if policy.enabled {
            self.stages.push(PlannedStage { policy, executor });
        }
        self
    }

    /// Enabled stages in the order they run
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.executor.stage()).collect()
    }

    pub async fn run(
        &self,
        seq: usize,
        candidate: Candidate,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> CandidateRecord {
        let mut ctx = StageContext::new(Arc::clone(&self.engine), cancel.clone());
        let mut terminal: Option<FailureCause> = None;

        for planned in &self.stages {
            let stage = planned.executor.stage();

            if let Some(interrupt) = Self::interrupted(deadline, cancel) {
                terminal = Some(interrupt.cause(stage));
                break;
            }

            debug!(seq, candidate = %candidate, stage = %stage, "stage started");
            let started = Instant::now();
            let timeout = planned.policy.timeout();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Shutdown),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
                outcome = tokio::time::timeout(timeout, planned.executor.execute(&candidate, &mut ctx)) => {
                    Ok(match outcome {
                        Ok(Ok(output)) => StageResult::from_output(stage, output, started.elapsed()),
                        Ok(Err(error)) => StageResult::failed(stage, &error, started.elapsed()),
                        Err(_) => StageResult::timed_out(stage, timeout),
                    })
                }
            };

            let result = match result {
                Ok(result) => result,
                Err(interrupt) => {
                    terminal = Some(interrupt.cause(stage));
                    break;
                }
            };

            debug!(seq, stage = %stage, status = ?result.status, elapsed_ms = result.elapsed_ms, "stage finished");
            let blocking_failure = result.is_failure() && planned.policy.blocking;
            let cause = result.cause.clone();
            ctx.push(result);

            if blocking_failure {
                terminal = cause.or_else(|| Some(FailureCause::new(FailureKind::Internal, "stage failed")));
                break;
            }
        }

        let (stages, resolved_ip) = ctx.finish();
        let verdict = if terminal.is_some() {
            RecordVerdict::Rejected
        } else {
            RecordVerdict::Accepted
        };

        match &terminal {
            Some(cause) => info!(seq, candidate = %candidate, stages = stages.len(), cause = %cause, "candidate rejected"),
            None => info!(seq, candidate = %candidate, stages = stages.len(), "candidate accepted"),
        }

        CandidateRecord {
            seq,
            candidate,
            stages,
            verdict,
            cause: terminal,
            resolved_ip,
        }
    }

    fn interrupted(deadline: Instant, cancel: &CancellationToken) -> Option<Interrupt> {
        if cancel.is_cancelled() {
            Some(Interrupt::Shutdown)
        } else if Instant::now() >= deadline {
            Some(Interrupt::Deadline)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.stage_ids())
            .finish_non_exhaustive()
    }
}
