//! Bounded worker pool feeding candidates through the orchestrator

use crate::config::{BackpressureMode, ValidatorConfig};
use crate::error::{FailureCause, FailureKind};
use crate::pipeline::orchestrator::{CandidateRecord, Orchestrator};
use crate::proxy::models::Candidate;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A candidate refused at the queue
#[derive(Debug, Clone, Serialize)]
pub struct DroppedCandidate {
    pub seq: usize,
    pub candidate: Candidate,
    pub reason: String,
}

/// Everything a scheduler run produced
#[derive(Debug, Default)]
pub struct RunOutput {
    /// One record per dequeued candidate, in input order
    pub records: Vec<CandidateRecord>,
    pub dropped: Vec<DroppedCandidate>,
}

type Job = (usize, Candidate);

/// Fixed pool of workers over a bounded FIFO queue
///
/// Each worker takes one candidate, runs it as its own task under a
/// per-candidate deadline and joins that task before taking the next.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    workers: usize,
    queue_capacity: usize,
    backpressure: BackpressureMode,
    deadline: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &ValidatorConfig) -> Self {
        Self {
            orchestrator,
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            backpressure: config.backpressure,
            deadline: config.candidate_deadline(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run; in-flight candidates are rejected
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Validate `candidates`, returning when every accepted job has a record
    pub async fn run(&self, candidates: Vec<Candidate>) -> RunOutput {
        let total = candidates.len();
        info!(total, workers = self.workers, queue = self.queue_capacity, "validation run started");

        let (job_tx, job_rx) = mpsc::channel::<Job>(self.queue_capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (record_tx, mut record_rx) = mpsc::unbounded_channel::<CandidateRecord>();

        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&job_rx),
                    record_tx.clone(),
                    Arc::clone(&self.orchestrator),
                    self.deadline,
                    self.cancel.clone(),
                ))
            })
            .collect();
        drop(record_tx);

        let dropped = self.produce(job_tx, candidates).await;

        for joined in join_all(workers).await {
            if let Err(e) = joined {
                warn!(error = %e, "worker ended abnormally");
            }
        }

        let mut records = Vec::with_capacity(total);
        while let Some(record) = record_rx.recv().await {
            records.push(record);
        }
        records.sort_by_key(|r| r.seq);

        info!(
            total,
            completed = records.len(),
            dropped = dropped.len(),
            "validation run finished"
        );
        RunOutput { records, dropped }
    }

    /// Enqueue every candidate; the sender is dropped on return so workers drain and stop
    async fn produce(&self, jobs: mpsc::Sender<Job>, candidates: Vec<Candidate>) -> Vec<DroppedCandidate> {
        let mut dropped = Vec::new();
        for (seq, candidate) in candidates.into_iter().enumerate() {
            match self.backpressure {
                BackpressureMode::Block => {
                    if let Err(mpsc::error::SendError((seq, candidate))) = jobs.send((seq, candidate)).await {
                        dropped.push(Self::drop_candidate(seq, candidate, "no worker left to accept it"));
                    }
                }
                BackpressureMode::Drop => match jobs.try_send((seq, candidate)) {
                    Ok(()) => {}
                    Err(TrySendError::Full((seq, candidate))) => {
                        dropped.push(Self::drop_candidate(seq, candidate, "queue full"));
                    }
                    Err(TrySendError::Closed((seq, candidate))) => {
                        dropped.push(Self::drop_candidate(seq, candidate, "no worker left to accept it"));
                    }
                },
            }
        }
        dropped
    }

    fn drop_candidate(seq: usize, candidate: Candidate, reason: &str) -> DroppedCandidate {
        warn!(seq, candidate = %candidate, reason, "candidate dropped");
        DroppedCandidate {
            seq,
            candidate,
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("backpressure", &self.backpressure)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

async fn worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    records: mpsc::UnboundedSender<CandidateRecord>,
    orchestrator: Arc<Orchestrator>,
    budget: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some((seq, candidate)) = next else {
            break;
        };

        let deadline = Instant::now() + budget;
        let fallback = candidate.clone();
        let task = {
            let orchestrator = Arc::clone(&orchestrator);
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.run(seq, candidate, deadline, &cancel).await })
        };

        let record = match task.await {
            Ok(record) => record,
            Err(e) => {
                warn!(worker = id, seq, error = %e, "candidate task failed");
                CandidateRecord::rejected(
                    seq,
                    fallback,
                    FailureCause::new(FailureKind::Internal, format!("candidate task failed: {}", e)),
                )
            }
        };

        if records.send(record).is_err() {
            break;
        }
    }
    debug!(worker = id, "worker stopped");
}
