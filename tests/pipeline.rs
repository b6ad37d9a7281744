//! End-to-end pipeline scenarios with fake engines, executors and providers

use async_trait::async_trait;
use proxy_sieve::config::{InconclusivePolicy, StagePolicy, ValidatorConfig};
use proxy_sieve::engine::{EngineSession, ProtocolEngine};
use proxy_sieve::error::{EngineError, FailureKind, ReputationError, StageError};
use proxy_sieve::pipeline::stages::{ConnectivityStage, ReputationStage};
use proxy_sieve::pipeline::{
    Orchestrator, RecordVerdict, Scheduler, StageContext, StageExecutor, StageId, StageOutput, StageStatus,
};
use proxy_sieve::proxy::{Candidate, CandidateParser};
use proxy_sieve::report::Aggregator;
use proxy_sieve::reputation::{ReputationCache, ReputationProvider, RetryPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct FakeEngine;

#[async_trait]
impl ProtocolEngine for FakeEngine {
    async fn start(&self, _candidate: &Candidate) -> Result<EngineSession, EngineError> {
        Ok(EngineSession::attached("socks5h://127.0.0.1:1080"))
    }
}

#[derive(Clone, Copy)]
enum Script {
    Pass,
    Fail,
    SlowDownload,
    Sleep(Duration),
}

struct FakeStage {
    stage: StageId,
    script: Script,
    calls: AtomicUsize,
}

impl FakeStage {
    fn new(stage: StageId, script: Script) -> Arc<Self> {
        Arc::new(Self {
            stage,
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for FakeStage {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn execute(&self, _candidate: &Candidate, _ctx: &mut StageContext) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = match self.stage {
            StageId::Protocol => StageOutput::passed().metric("handshake_ms", 150u64),
            StageId::Speed => StageOutput::passed()
                .metric("throughput_mbps", 20.0)
                .metric("meets_floor", true),
            StageId::Stability => StageOutput::passed()
                .metric("checks", 3u32)
                .metric("success_rate", 1.0),
            StageId::RouteQuality => StageOutput::passed().metric("quality_score", 0.9),
            StageId::Tls => StageOutput::passed()
                .metric("valid", true)
                .metric("fingerprint", "00ff".to_string()),
            _ => StageOutput::passed(),
        };

        match self.script {
            Script::Pass => Ok(output),
            Script::Fail => Err(StageError::Protocol(format!("stage {} failed", self.stage))),
            Script::SlowDownload => Ok(StageOutput::passed()
                .metric("throughput_mbps", 0.2)
                .metric("meets_floor", false)
                .fail(StageError::SpeedTest("0.20 Mbps below minimum 1.00 Mbps".into()))),
            Script::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(output)
            }
        }
    }
}

/// Provider listing nothing, counting queries
struct CountingProvider {
    queries: AtomicUsize,
}

#[async_trait]
impl ReputationProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting.bl"
    }

    async fn is_listed(&self, _key: &str) -> Result<bool, ReputationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(false)
    }
}

fn candidate(host: &str, port: u16) -> Candidate {
    CandidateParser::parse_line(&format!(
        "vless://b831381d-6324-4d53-ad4f-8cda48b30811@{}:{}?security=tls&sni=example.com#node",
        host, port
    ))
    .unwrap()
    .unwrap()
}

fn policy(stage: StageId) -> StagePolicy {
    match stage {
        StageId::Connectivity | StageId::Protocol | StageId::Reputation => StagePolicy::blocking(5_000),
        _ => StagePolicy::advisory(5_000),
    }
}

/// Orchestrator over scripted stages 1..=7
fn scripted(scripts: [Script; 7]) -> (Orchestrator, Vec<Arc<FakeStage>>) {
    let fakes: Vec<Arc<FakeStage>> = StageId::ALL
        .iter()
        .zip(scripts)
        .map(|(stage, script)| FakeStage::new(*stage, script))
        .collect();
    let orchestrator = fakes.iter().fold(Orchestrator::new(Arc::new(FakeEngine)), |o, fake| {
        o.with_stage(policy(fake.stage), Arc::clone(fake) as Arc<dyn StageExecutor>)
    });
    (orchestrator, fakes)
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

#[tokio::test]
async fn test_scenario_a_unreachable_host_is_rejected_after_one_stage() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let rest: Vec<Arc<FakeStage>> = StageId::ALL[1..]
        .iter()
        .map(|stage| FakeStage::new(*stage, Script::Pass))
        .collect();
    let orchestrator = rest.iter().fold(
        Orchestrator::new(Arc::new(FakeEngine)).with_stage(
            StagePolicy::blocking(3_000),
            Arc::new(ConnectivityStage::new(Duration::from_secs(2))),
        ),
        |o, fake| o.with_stage(policy(fake.stage), Arc::clone(fake) as Arc<dyn StageExecutor>),
    );

    let record = orchestrator
        .run(0, candidate("127.0.0.1", port), far_deadline(), &CancellationToken::new())
        .await;

    assert_eq!(record.verdict, RecordVerdict::Rejected);
    assert_eq!(record.stages.len(), 1);
    assert_eq!(record.stages[0].stage, StageId::Connectivity);
    assert_eq!(record.stages[0].status, StageStatus::Failed);
    assert_eq!(record.cause.unwrap().kind, FailureKind::Connectivity);
    assert!(rest.iter().all(|fake| fake.calls() == 0));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_same_host_within_ttl_queries_once() {
    let provider = Arc::new(CountingProvider {
        queries: AtomicUsize::new(0),
    });
    let cache = Arc::new(
        ReputationCache::new(
            vec![provider.clone() as Arc<dyn ReputationProvider>],
            Duration::from_secs(3600),
        )
        .with_retry(RetryPolicy::none()),
    );
    let orchestrator = Orchestrator::new(Arc::new(FakeEngine)).with_stage(
        StagePolicy::blocking(10_000),
        Arc::new(ReputationStage::new(Arc::clone(&cache), InconclusivePolicy::Pass)),
    );
    let config = ValidatorConfig::new().with_workers(2);
    let scheduler = Scheduler::new(Arc::new(orchestrator), &config);

    // concurrent: the second lookup joins the first
    let output = scheduler
        .run(vec![candidate("198.51.100.4", 443), candidate("198.51.100.4", 8443)])
        .await;
    assert_eq!(output.records.len(), 2);
    assert!(output.records.iter().all(|r| r.is_accepted()));
    assert_eq!(provider.queries.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().query_sets, 1);

    // later, still within the TTL: served from the cache
    tokio::time::advance(Duration::from_secs(600)).await;
    let output = scheduler.run(vec![candidate("198.51.100.4", 2053)]).await;
    assert!(output.records[0].is_accepted());
    assert_eq!(provider.queries.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().hits, 1);

    // past the TTL: one fresh query
    tokio::time::advance(Duration::from_secs(3600)).await;
    scheduler.run(vec![candidate("198.51.100.4", 2083)]).await;
    assert_eq!(provider.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_slow_speed_is_accepted_with_lower_score() {
    let (slow, fakes) = scripted([
        Script::Pass,
        Script::Pass,
        Script::Pass,
        Script::SlowDownload,
        Script::Pass,
        Script::Pass,
        Script::Pass,
    ]);
    let (fast, _) = scripted([Script::Pass; 7]);

    let cancel = CancellationToken::new();
    let slow_record = slow.run(0, candidate("203.0.113.10", 443), far_deadline(), &cancel).await;
    let fast_record = fast.run(1, candidate("203.0.113.11", 443), far_deadline(), &cancel).await;

    assert_eq!(slow_record.verdict, RecordVerdict::Accepted);
    assert_eq!(slow_record.stages.len(), 7);
    assert_eq!(slow_record.stages[3].status, StageStatus::Failed);
    assert_eq!(
        slow_record.stages[3].cause.as_ref().unwrap().kind,
        FailureKind::SpeedTest
    );
    assert!(fakes.iter().all(|fake| fake.calls() == 1));

    let aggregator = Aggregator::default();
    let slow_score = aggregator.score(&slow_record).unwrap();
    let fast_score = aggregator.score(&fast_record).unwrap();
    assert!(slow_score < fast_score);

    let ranked = aggregator.rank(&[slow_record, fast_record]);
    assert_eq!(ranked[0].record.seq, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_deadline_during_stability_keeps_earlier_results() {
    let (orchestrator, fakes) = scripted([
        Script::Pass,
        Script::Pass,
        Script::Pass,
        Script::Pass,
        Script::Sleep(Duration::from_secs(30)),
        Script::Pass,
        Script::Pass,
    ]);

    let deadline = Instant::now() + Duration::from_secs(2);
    let record = orchestrator
        .run(0, candidate("203.0.113.20", 443), deadline, &CancellationToken::new())
        .await;

    assert_eq!(record.verdict, RecordVerdict::Rejected);
    assert_eq!(record.cause.as_ref().unwrap().kind, FailureKind::GlobalDeadlineExceeded);
    let ids: Vec<StageId> = record.stages.iter().map(|r| r.stage).collect();
    assert_eq!(
        ids,
        vec![StageId::Connectivity, StageId::Protocol, StageId::Reputation, StageId::Speed]
    );
    assert_eq!(fakes[4].calls(), 1);
    assert_eq!(fakes[5].calls(), 0);
    assert_eq!(fakes[6].calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_results_are_a_prefix_and_nothing_runs_after_blocking_failure() {
    for failing in 0..7 {
        let mut scripts = [Script::Pass; 7];
        scripts[failing] = Script::Fail;
        let (orchestrator, fakes) = scripted(scripts);

        let record = orchestrator
            .run(failing, candidate("203.0.113.30", 443), far_deadline(), &CancellationToken::new())
            .await;

        let ran: Vec<StageId> = record.stages.iter().map(|r| r.stage).collect();
        let planned = orchestrator.stage_ids();
        assert_eq!(ran[..], planned[..ran.len()], "gap in results when stage {} fails", failing + 1);

        let blocking = policy(StageId::ALL[failing]).blocking;
        if blocking {
            assert_eq!(record.verdict, RecordVerdict::Rejected);
            assert_eq!(ran.len(), failing + 1);
            assert!(fakes[failing + 1..].iter().all(|fake| fake.calls() == 0));
        } else {
            assert_eq!(record.verdict, RecordVerdict::Accepted);
            assert_eq!(ran.len(), 7);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_disabled_stages_leave_no_gaps() {
    let fakes: Vec<Arc<FakeStage>> = StageId::ALL
        .iter()
        .map(|stage| FakeStage::new(*stage, Script::Pass))
        .collect();
    let orchestrator = fakes.iter().fold(Orchestrator::new(Arc::new(FakeEngine)), |o, fake| {
        let mut p = policy(fake.stage);
        if matches!(fake.stage, StageId::Reputation | StageId::Speed) {
            p = p.disabled();
        }
        o.with_stage(p, Arc::clone(fake) as Arc<dyn StageExecutor>)
    });

    let record = orchestrator
        .run(0, candidate("203.0.113.40", 443), far_deadline(), &CancellationToken::new())
        .await;
    let ran: Vec<StageId> = record.stages.iter().map(|r| r.stage).collect();
    assert_eq!(ran, orchestrator.stage_ids());
    assert_eq!(ran.len(), 5);
    assert_eq!(fakes[2].calls(), 0);
    assert_eq!(fakes[3].calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_in_flight_candidate() {
    let (orchestrator, _) = scripted([
        Script::Pass,
        Script::Sleep(Duration::from_secs(60)),
        Script::Pass,
        Script::Pass,
        Script::Pass,
        Script::Pass,
        Script::Pass,
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let record = orchestrator
        .run(0, candidate("203.0.113.50", 443), far_deadline(), &cancel)
        .await;
    assert_eq!(record.verdict, RecordVerdict::Rejected);
    assert_eq!(record.stages.len(), 1);
    let cause = record.cause.unwrap();
    assert_eq!(cause.kind, FailureKind::GlobalDeadlineExceeded);
    assert!(cause.message.contains("shutdown"));
}
