//! Report rendering: annotated text list and JSON results

use crate::pipeline::{CandidateRecord, DroppedCandidate, RecordVerdict, StageId};
use crate::proxy::geo::GeoLocator;
use crate::proxy::parser::ParseFailure;
use crate::report::aggregator::{Aggregator, Report, RunStats, ScoredRecord};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Text list of accepted candidates
pub const VALID_FILE: &str = "valid.txt";

/// Structured results of the whole run
pub const RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StabilitySummary {
    pub checks: u32,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationSummary {
    pub blacklisted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TlsSummary {
    pub valid: bool,
    pub fingerprint: Option<String>,
}

/// Flat per-candidate view written to the JSON results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub uri: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub verdict: RecordVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Milliseconds
    pub latency: Option<f64>,
    /// Megabits per second
    pub speed: Option<f64>,
    pub stability: Option<StabilitySummary>,
    pub reputation: Option<ReputationSummary>,
    pub tls_validation: Option<TlsSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Serialize)]
struct ResultsDocument<'a> {
    #[serde(flatten)]
    report: ReportHeader<'a>,
    candidates: Vec<CandidateSummary>,
    dropped: &'a [DroppedCandidate],
    parse_failures: &'a [ParseFailure],
}

#[derive(Serialize)]
struct ReportHeader<'a> {
    run_id: &'a Uuid,
    generated_at: &'a DateTime<Utc>,
    stats: &'a RunStats,
}

/// Paths written by [`ReportWriter::write`]
#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub valid: PathBuf,
    pub results: PathBuf,
}

/// Renders a [`Report`] into the output files
#[derive(Clone, Default)]
pub struct ReportWriter {
    geo: Option<GeoLocator>,
}

impl ReportWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_geo(mut self, geo: GeoLocator) -> Self {
        self.geo = Some(geo);
        self
    }

    fn country(&self, record: &CandidateRecord) -> Option<String> {
        let geo = self.geo.as_ref()?;
        let ip = record.resolved_ip?;
        match geo.lookup(ip) {
            Ok(tag) => tag.label(),
            Err(e) => {
                debug!(%ip, error = %e, "geo lookup failed");
                None
            }
        }
    }

    /// Remark of the descriptor, else the endpoint's location
    pub fn comment(&self, record: &CandidateRecord) -> String {
        record
            .candidate
            .remark
            .clone()
            .filter(|r| !r.trim().is_empty())
            .or_else(|| self.country(record))
            .unwrap_or_else(|| "-".to_string())
    }

    /// `uri [latency|quality|protocol|comment]`
    pub fn text_line(&self, scored: &ScoredRecord) -> String {
        let latency = scored
            .latency_ms
            .map(|ms| format!("{:.0}ms", ms))
            .unwrap_or_else(|| "?".to_string());
        format!(
            "{} [{}|{:.1}|{}|{}]",
            scored.record.candidate.uri,
            latency,
            scored.score,
            scored.record.candidate.protocol(),
            self.comment(&scored.record)
        )
    }

    pub fn render_text(&self, report: &Report) -> String {
        report
            .ranked
            .iter()
            .map(|scored| self.text_line(scored))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn summary(&self, record: &CandidateRecord, score: Option<f64>) -> CandidateSummary {
        let stability = record.result(StageId::Stability).and_then(|r| {
            Some(StabilitySummary {
                checks: r.metric("checks")? as u32,
                success_rate: r.metric("success_rate").unwrap_or(0.0),
            })
        });
        let reputation = record
            .result(StageId::Reputation)
            .and_then(|r| r.flag("blacklisted"))
            .map(|blacklisted| ReputationSummary { blacklisted });
        let tls_validation = record.result(StageId::Tls).map(|r| TlsSummary {
            valid: r.flag("valid").unwrap_or(false),
            fingerprint: r.text("fingerprint").map(str::to_string),
        });

        CandidateSummary {
            uri: record.candidate.uri.clone(),
            protocol: record.candidate.protocol().to_string(),
            host: record.candidate.host.clone(),
            port: record.candidate.port,
            verdict: record.verdict,
            score,
            latency: Aggregator::latency_ms(record),
            speed: record.result(StageId::Speed).and_then(|r| r.metric("throughput_mbps")),
            stability,
            reputation,
            tls_validation,
            country: self.country(record),
            cause: record.cause.as_ref().map(ToString::to_string),
        }
    }

    /// Accepted candidates in rank order, then rejected ones in input order
    pub fn summaries(&self, report: &Report) -> Vec<CandidateSummary> {
        report
            .ranked
            .iter()
            .map(|scored| self.summary(&scored.record, Some(scored.score)))
            .chain(report.rejected.iter().map(|record| self.summary(record, None)))
            .collect()
    }

    pub fn render_json(&self, report: &Report) -> Result<String> {
        let document = ResultsDocument {
            report: ReportHeader {
                run_id: &report.run_id,
                generated_at: &report.generated_at,
                stats: &report.stats,
            },
            candidates: self.summaries(report),
            dropped: &report.dropped,
            parse_failures: &report.parse_failures,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Write `valid.txt` and `results.json` into `dir`, creating it if needed
    pub fn write<P: AsRef<Path>>(&self, report: &Report, dir: P) -> Result<WrittenReport> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let valid = dir.join(VALID_FILE);
        let mut text = self.render_text(report);
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(&valid, text)?;

        let results = dir.join(RESULTS_FILE);
        fs::write(&results, self.render_json(report)?)?;

        info!(valid = %valid.display(), results = %results.display(), accepted = report.ranked.len(), "report written");
        Ok(WrittenReport { valid, results })
    }
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("geo", &self.geo.is_some())
            .finish()
    }
}
