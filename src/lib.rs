//! Proxy Sieve - staged proxy configuration validator
//!
//! Parses VLESS, VMess, Trojan and Shadowsocks descriptors and pushes every
//! candidate through an ordered pipeline of checks (connectivity, protocol
//! handshake, reputation, speed, stability, route quality, TLS), producing a
//! ranked report of the usable ones.

pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod report;
pub mod reputation;

pub use config::ValidatorConfig;
pub use error::{FailureCause, FailureKind, ParseError, StageError};
pub use pipeline::{CandidateRecord, Orchestrator, RecordVerdict, Scheduler};
pub use proxy::{Candidate, CandidateParser, Protocol};
pub use report::{Aggregator, Report, ReportWriter};
pub use reputation::ReputationCache;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
