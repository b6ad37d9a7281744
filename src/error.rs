//! Error types for parsing, stage execution and infrastructure

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of why a stage (or a whole candidate) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connectivity,
    Protocol,
    Blacklisted,
    ReputationQuery,
    SpeedTest,
    Stability,
    RouteQuality,
    Tls,
    Timeout,
    GlobalDeadlineExceeded,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Connectivity => "ConnectivityError",
            FailureKind::Protocol => "ProtocolError",
            FailureKind::Blacklisted => "Blacklisted",
            FailureKind::ReputationQuery => "ReputationQueryError",
            FailureKind::SpeedTest => "SpeedTestError",
            FailureKind::Stability => "StabilityError",
            FailureKind::RouteQuality => "RouteQualityError",
            FailureKind::Tls => "TlsError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::GlobalDeadlineExceeded => "GlobalDeadlineExceeded",
            FailureKind::Internal => "InternalError",
        };
        write!(f, "{}", name)
    }
}

/// Recorded cause of a failed stage or rejected candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error produced while turning a descriptor string into a candidate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("descriptor has no scheme")]
    MissingScheme,

    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("invalid base64 payload")]
    InvalidBase64,

    #[error("missing host")]
    MissingHost,

    #[error("invalid port `{0}`")]
    InvalidPort(String),

    #[error("invalid user id `{0}`")]
    InvalidId(String),

    #[error("malformed {protocol} descriptor: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },
}

impl ParseError {
    pub(crate) fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Failure starting or talking to the external protocol engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn protocol engine: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("protocol engine did not open its local port within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("protocol engine exited early: {0}")]
    Exited(String),

    #[error("protocol engine rejected configuration: {0}")]
    Config(String),
}

/// Failure of a single reputation provider query
#[derive(Debug, Clone, Error)]
pub enum ReputationError {
    #[error("provider {provider} timed out")]
    Timeout { provider: String },

    #[error("provider {provider} lookup failed: {reason}")]
    Lookup { provider: String, reason: String },
}

/// Error returned by a stage executor
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Connectivity(String),

    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Blacklisted(String),

    #[error("{0}")]
    ReputationQuery(String),

    #[error("{0}")]
    SpeedTest(String),

    #[error("{0}")]
    Stability(String),

    #[error("{0}")]
    RouteQuality(String),

    #[error("{0}")]
    Tls(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl StageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Connectivity(_) => FailureKind::Connectivity,
            StageError::Protocol(_) | StageError::Engine(_) => FailureKind::Protocol,
            StageError::Blacklisted(_) => FailureKind::Blacklisted,
            StageError::ReputationQuery(_) => FailureKind::ReputationQuery,
            StageError::SpeedTest(_) => FailureKind::SpeedTest,
            StageError::Stability(_) => FailureKind::Stability,
            StageError::RouteQuality(_) => FailureKind::RouteQuality,
            StageError::Tls(_) => FailureKind::Tls,
        }
    }

    pub fn to_cause(&self) -> FailureCause {
        FailureCause::new(self.kind(), self.to_string())
    }
}

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_kind_mapping() {
        assert_eq!(
            StageError::Connectivity("refused".into()).kind(),
            FailureKind::Connectivity
        );
        assert_eq!(
            StageError::Engine(EngineError::Exited("code 23".into())).kind(),
            FailureKind::Protocol
        );
        assert_eq!(
            StageError::Blacklisted("zen.spamhaus.org".into()).kind(),
            FailureKind::Blacklisted
        );
    }

    #[test]
    fn test_failure_cause_display() {
        let cause = StageError::Connectivity("connection refused".into()).to_cause();
        assert_eq!(cause.to_string(), "ConnectivityError: connection refused");
    }

    #[test]
    fn test_failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::GlobalDeadlineExceeded).unwrap();
        assert_eq!(json, "\"global_deadline_exceeded\"");
    }
}
