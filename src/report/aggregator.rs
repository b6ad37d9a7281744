//! Composite scoring, ranking and run statistics

use crate::config::ScoreWeights;
use crate::pipeline::{CandidateRecord, DroppedCandidate, RunOutput, StageId, StageStatus};
use crate::proxy::parser::{ParseFailure, ParseOutcome};
use crate::reputation::CacheStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

/// An accepted candidate with its composite score
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub record: CandidateRecord,
}

/// Counters for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Candidates handed to the scheduler
    pub total: usize,
    pub parse_failures: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Candidates that passed each stage, keyed by stage name
    pub stage_passes: BTreeMap<String, usize>,
    /// Rejections grouped by failure kind
    pub rejections: BTreeMap<String, usize>,
    pub cache: CacheStats,
}

/// Final result of a run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub stats: RunStats,
    /// Accepted candidates, best first
    pub ranked: Vec<ScoredRecord>,
    /// Rejected candidates in input order
    pub rejected: Vec<CandidateRecord>,
    pub dropped: Vec<DroppedCandidate>,
    pub parse_failures: Vec<ParseFailure>,
}

impl Report {
    /// Log the statistics block
    pub fn log_stats(&self) {
        let stats = &self.stats;
        info!("{}", "=".repeat(50));
        info!("VALIDATION STATISTICS ({})", self.run_id);
        info!("{}", "=".repeat(50));
        info!("Total candidates tested: {}", stats.total);
        info!("Unparsable descriptors: {}", stats.parse_failures);
        info!("Duplicate descriptors: {}", stats.duplicates);
        info!("Dropped at queue: {}", stats.dropped);
        for stage in StageId::ALL {
            if let Some(passed) = stats.stage_passes.get(stage.name()) {
                info!("Stage {}: {} passed", stage, passed);
            }
        }
        for (kind, count) in &stats.rejections {
            info!("Rejected ({}): {}", kind, count);
        }
        info!(
            "Reputation cache: {} hits, {} misses, {} coalesced, {} provider queries",
            stats.cache.hits, stats.cache.misses, stats.cache.coalesced, stats.cache.provider_queries
        );
        info!("Valid candidates: {}", stats.accepted);
        info!("{}", "=".repeat(50));
    }
}

/// Turns candidate records into a ranked report
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    weights: ScoreWeights,
}

impl Aggregator {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    /// Latency used for scoring and ordering: the tunnel handshake when
    /// measured, otherwise the TCP connect latency
    pub fn latency_ms(record: &CandidateRecord) -> Option<f64> {
        record
            .result(StageId::Protocol)
            .and_then(|r| r.metric("handshake_ms"))
            .or_else(|| record.result(StageId::Connectivity).and_then(|r| r.metric("latency_ms")))
    }

    /// Composite score of an accepted record, `None` for rejected ones
    ///
    /// `100 * (latency + stability + route +/- speed - advisory failures)`,
    /// never below zero. Components whose stage did not run contribute nothing;
    /// a speed stage that failed without a measurement takes the speed penalty.
    pub fn score(&self, record: &CandidateRecord) -> Option<f64> {
        if !record.is_accepted() {
            return None;
        }
        let w = &self.weights;

        let latency = Self::latency_ms(record)
            .map(|ms| w.latency_reference_ms / (w.latency_reference_ms + ms.max(0.0)))
            .unwrap_or(0.0);
        let stability = record
            .result(StageId::Stability)
            .and_then(|r| r.metric("success_rate"))
            .unwrap_or(0.0);
        let route = record
            .result(StageId::RouteQuality)
            .and_then(|r| r.metric("quality_score"))
            .unwrap_or(0.0);
        let speed = match record.result(StageId::Speed) {
            Some(r) => match r.flag("meets_floor") {
                Some(true) => w.speed_bonus,
                Some(false) => -w.speed_penalty,
                // a speed test that never measured counts as too slow
                None if r.is_failure() => -w.speed_penalty,
                None => 0.0,
            },
            None => 0.0,
        };
        let advisory_failures = record.stages.iter().filter(|r| r.is_failure()).count() as f64;

        let raw = w.latency * latency + w.stability * stability + w.route_quality * route + speed
            - w.advisory_penalty * advisory_failures;
        Some((raw * 100.0).max(0.0))
    }

    /// Score accepted records and order them: score descending, then latency
    /// ascending (unknown last), then input order
    pub fn rank(&self, records: &[CandidateRecord]) -> Vec<ScoredRecord> {
        let mut ranked: Vec<ScoredRecord> = records
            .iter()
            .filter_map(|record| {
                self.score(record).map(|score| ScoredRecord {
                    score,
                    latency_ms: Self::latency_ms(record),
                    record: record.clone(),
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| match (a.latency_ms, b.latency_ms) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                })
                .then_with(|| a.record.seq.cmp(&b.record.seq))
        });
        ranked
    }

    pub fn build_report(&self, run: RunOutput, parsed: &ParseOutcome, cache: CacheStats) -> Report {
        let ranked = self.rank(&run.records);

        let mut stats = RunStats {
            total: run.records.len() + run.dropped.len(),
            parse_failures: parsed.failures.len(),
            duplicates: parsed.duplicates,
            dropped: run.dropped.len(),
            accepted: ranked.len(),
            cache,
            ..RunStats::default()
        };
        for record in &run.records {
            for result in &record.stages {
                if result.status == StageStatus::Passed {
                    *stats.stage_passes.entry(result.stage.name().to_string()).or_default() += 1;
                }
            }
        }

        let rejected: Vec<CandidateRecord> = run.records.into_iter().filter(|r| !r.is_accepted()).collect();
        stats.rejected = rejected.len();
        for record in &rejected {
            if let Some(cause) = &record.cause {
                *stats.rejections.entry(cause.kind.to_string()).or_default() += 1;
            }
        }

        Report {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            stats,
            ranked,
            rejected,
            dropped: run.dropped,
            parse_failures: parsed.failures.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureCause, FailureKind};
    use crate::pipeline::{RecordVerdict, StageResult};
    use crate::proxy::parser::CandidateParser;

    fn result(stage: StageId, status: StageStatus, metrics: &[(&str, f64)]) -> StageResult {
        StageResult {
            stage,
            status,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), (*v).into())).collect(),
            cause: None,
            elapsed_ms: 0,
        }
    }

    fn record(seq: usize, stages: Vec<StageResult>) -> CandidateRecord {
        let candidate = CandidateParser::parse_line(&format!("trojan://pw@198.51.100.{}:443", seq + 1))
            .unwrap()
            .unwrap();
        CandidateRecord {
            seq,
            candidate,
            stages,
            verdict: RecordVerdict::Accepted,
            cause: None,
            resolved_ip: None,
        }
    }

    fn healthy(seq: usize, handshake_ms: f64) -> CandidateRecord {
        let mut speed = result(StageId::Speed, StageStatus::Passed, &[("throughput_mbps", 12.0)]);
        speed.metrics.insert("meets_floor".into(), true.into());
        record(
            seq,
            vec![
                result(StageId::Connectivity, StageStatus::Passed, &[("latency_ms", 40.0)]),
                result(StageId::Protocol, StageStatus::Passed, &[("handshake_ms", handshake_ms)]),
                result(StageId::Reputation, StageStatus::Passed, &[]),
                speed,
                result(StageId::Stability, StageStatus::Passed, &[("success_rate", 1.0)]),
                result(StageId::RouteQuality, StageStatus::Passed, &[("quality_score", 0.8)]),
                result(StageId::Tls, StageStatus::Passed, &[]),
            ],
        )
    }

    #[test]
    fn test_score_is_deterministic() {
        let aggregator = Aggregator::default();
        let r = healthy(0, 500.0);
        // 0.4 * 0.5 + 0.3 * 1.0 + 0.2 * 0.8 + 0.1
        let expected = 100.0 * (0.2 + 0.3 + 0.16 + 0.1);
        let score = aggregator.score(&r).unwrap();
        assert!((score - expected).abs() < 1e-9);
        assert_eq!(aggregator.score(&r), aggregator.score(&r.clone()));
    }

    #[test]
    fn test_slow_speed_lowers_score() {
        let aggregator = Aggregator::default();
        let fast = healthy(0, 200.0);
        let mut slow = healthy(1, 200.0);
        slow.stages[3].status = StageStatus::Failed;
        slow.stages[3].metrics.insert("meets_floor".into(), false.into());

        let fast_score = aggregator.score(&fast).unwrap();
        let slow_score = aggregator.score(&slow).unwrap();
        // bonus lost, penalty applied, one advisory failure
        assert!((fast_score - slow_score - 100.0 * (0.1 + 0.1 + 0.05)).abs() < 1e-9);
    }

    #[test]
    fn test_unmeasured_speed_failure_ranks_with_slow() {
        let aggregator = Aggregator::default();
        let mut slow = healthy(0, 200.0);
        slow.stages[3] = result(StageId::Speed, StageStatus::Failed, &[("throughput_mbps", 0.3)]);
        slow.stages[3].metrics.insert("meets_floor".into(), false.into());
        let mut timed_out = healthy(1, 200.0);
        timed_out.stages[3] = result(StageId::Speed, StageStatus::TimedOut, &[]);
        let fast = healthy(2, 200.0);

        let slow_score = aggregator.score(&slow).unwrap();
        assert_eq!(aggregator.score(&timed_out), Some(slow_score));
        assert!(aggregator.score(&fast).unwrap() > slow_score);

        let ranked = aggregator.rank(&[timed_out, slow, fast]);
        assert_eq!(ranked[0].record.seq, 2);
    }

    #[test]
    fn test_rejected_records_are_not_scored() {
        let mut r = healthy(0, 100.0);
        r.verdict = RecordVerdict::Rejected;
        r.cause = Some(FailureCause::new(FailureKind::Blacklisted, "listed"));
        assert!(Aggregator::default().score(&r).is_none());
        assert!(Aggregator::default().rank(&[r]).is_empty());
    }

    #[test]
    fn test_score_never_negative() {
        let mut weights = ScoreWeights::default();
        weights.advisory_penalty = 5.0;
        let mut r = healthy(0, 100.0);
        r.stages[6].status = StageStatus::TimedOut;
        assert_eq!(Aggregator::new(weights).score(&r), Some(0.0));
    }

    #[test]
    fn test_rank_ordering() {
        let aggregator = Aggregator::default();
        let best = healthy(2, 50.0);
        let tie_a = healthy(0, 300.0);
        let tie_b = healthy(1, 300.0);
        let ranked = aggregator.rank(&[tie_b.clone(), best, tie_a]);
        let seqs: Vec<usize> = ranked.iter().map(|r| r.record.seq).collect();
        assert_eq!(seqs, vec![2, 0, 1]);
    }

    #[test]
    fn test_equal_score_orders_by_latency() {
        // no latency component, so both score the same
        let mut weights = ScoreWeights::default();
        weights.latency = 0.0;
        let aggregator = Aggregator::new(weights);
        let quick = healthy(1, 80.0);
        let slow = healthy(0, 900.0);
        let ranked = aggregator.rank(&[slow, quick]);
        assert_eq!(ranked[0].record.seq, 1);
        assert_eq!(ranked[0].score, ranked[1].score);
    }

    #[test]
    fn test_build_report_stats() {
        let aggregator = Aggregator::default();
        let accepted = healthy(0, 100.0);
        let mut rejected = record(
            1,
            vec![result(StageId::Connectivity, StageStatus::Failed, &[])],
        );
        rejected.verdict = RecordVerdict::Rejected;
        rejected.cause = Some(FailureCause::new(FailureKind::Connectivity, "refused"));

        let run = RunOutput {
            records: vec![accepted, rejected],
            dropped: Vec::new(),
        };
        let parsed = CandidateParser::parse_string("bogus://x\ntrojan://pw@192.0.2.1:443\ntrojan://pw@192.0.2.1:443");
        let report = aggregator.build_report(run, &parsed, CacheStats::default());

        assert_eq!(report.stats.total, 2);
        assert_eq!(report.stats.accepted, 1);
        assert_eq!(report.stats.rejected, 1);
        assert_eq!(report.stats.parse_failures, 1);
        assert_eq!(report.stats.duplicates, 1);
        assert_eq!(report.stats.stage_passes["connectivity"], 1);
        assert_eq!(report.stats.stage_passes["tls"], 1);
        assert_eq!(report.stats.rejections["ConnectivityError"], 1);
        assert_eq!(report.ranked.len(), 1);
        assert_eq!(report.rejected[0].seq, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["run_id"].is_string());
        assert_eq!(json["stats"]["accepted"], 1);
    }
}
