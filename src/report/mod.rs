//! Scoring and output of a finished run

pub mod aggregator;
pub mod output;

pub use aggregator::{Aggregator, Report, RunStats, ScoredRecord};
pub use output::{CandidateSummary, ReportWriter, WrittenReport, RESULTS_FILE, VALID_FILE};
