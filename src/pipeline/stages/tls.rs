//! Stage 7: certificate validation and fingerprint pinning

use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use reqwest::tls::TlsInfo;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Fetches an HTTPS endpoint through the tunnel and inspects the leaf
/// certificate it receives
///
/// A tunnel that intercepts TLS shows up either as a verification failure or
/// as a fingerprint that differs from the configured pin for the probe host.
#[derive(Debug, Clone)]
pub struct TlsStage {
    probe_url: String,
    timeout: Duration,
    pins: HashMap<String, String>,
}

impl TlsStage {
    pub fn new(probe_url: &str, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.to_string(),
            timeout,
            pins: HashMap::new(),
        }
    }

    /// Expected SHA-256 fingerprints (hex) keyed by host
    pub fn with_pins(mut self, pins: HashMap<String, String>) -> Self {
        self.pins = pins
            .into_iter()
            .map(|(host, fp)| (host.to_ascii_lowercase(), normalize_fingerprint(&fp)))
            .collect();
        self
    }

    fn probe_host(&self) -> Option<String> {
        Url::parse(&self.probe_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
    }

    /// `Ok(Some(true))` when a pin exists and matches, `Ok(None)` when the
    /// host has no pin
    fn check_pin(&self, fingerprint: &str) -> Result<Option<bool>, StageError> {
        let Some(host) = self.probe_host() else {
            return Ok(None);
        };
        match self.pins.get(&host) {
            Some(expected) if *expected == fingerprint => Ok(Some(true)),
            Some(expected) => Err(StageError::Tls(format!(
                "certificate for {} has fingerprint {}, expected {}",
                host, fingerprint, expected
            ))),
            None => Ok(None),
        }
    }
}

/// Lowercase hex SHA-256 of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn normalize_fingerprint(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase()
}

#[async_trait]
impl StageExecutor for TlsStage {
    fn stage(&self) -> StageId {
        StageId::Tls
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        let client = ctx
            .session(candidate)
            .await?
            .client_builder(self.timeout)?
            .tls_info(true)
            .build()
            .map_err(|e| StageError::Tls(e.to_string()))?;

        let invalid = StageOutput::passed()
            .metric("valid", false)
            .metric("candidate_tls", candidate.uses_tls());

        let response = match client.get(&self.probe_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(candidate = %candidate, error = %e, "tls probe failed");
                return Ok(invalid.fail(StageError::Tls(format!("handshake failed: {}", e))));
            }
        };

        let der = response
            .extensions()
            .get::<TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(<[u8]>::to_vec);
        let Some(der) = der else {
            return Ok(invalid.fail(StageError::Tls("no certificate presented".to_string())));
        };

        let fingerprint = fingerprint(&der);
        let output = StageOutput::passed()
            .metric("candidate_tls", candidate.uses_tls())
            .metric("fingerprint", fingerprint.clone());

        match self.check_pin(&fingerprint) {
            Ok(pinned) => {
                debug!(candidate = %candidate, fingerprint = %fingerprint, "tls certificate verified");
                Ok(output
                    .metric("valid", true)
                    .metric("pinned", pinned.unwrap_or(false)))
            }
            Err(mismatch) => {
                warn!(candidate = %candidate, error = %mismatch, "tls fingerprint mismatch");
                Ok(output.metric("valid", false).metric("pinned", false).fail(mismatch))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::pipeline::stage::{StageResult, StageStatus};
    use crate::pipeline::stages::testing::{candidate, closed_port, direct_context, serve, Canned};

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_pin_matching() {
        let fp = fingerprint(b"certificate");
        let mut pins = HashMap::new();
        pins.insert("WWW.Example.com".to_string(), fp.to_uppercase());
        let stage = TlsStage::new("https://www.example.com/trace", Duration::from_secs(1)).with_pins(pins);

        assert_eq!(stage.check_pin(&fp).unwrap(), Some(true));
        let err = stage.check_pin(&fingerprint(b"forged")).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Tls);

        let unpinned = TlsStage::new("https://other.example.com/", Duration::from_secs(1));
        assert_eq!(unpinned.check_pin(&fp).unwrap(), None);
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("AB:cd:01"), "abcd01");
    }

    #[tokio::test]
    async fn test_plain_http_probe_has_no_certificate() {
        let base = serve(Canned::ok(b"ok")).await;
        let stage = TlsStage::new(&base, Duration::from_secs(2));
        let mut ctx = direct_context();

        let output = stage.execute(&candidate("127.0.0.1", 443), &mut ctx).await.unwrap();
        let result = StageResult::from_output(StageId::Tls, output, Duration::ZERO);
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.flag("valid"), Some(false));
        assert!(result.text("fingerprint").is_none());
        assert_eq!(result.cause.unwrap().kind, FailureKind::Tls);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_invalid() {
        let url = format!("https://127.0.0.1:{}/", closed_port().await);
        let stage = TlsStage::new(&url, Duration::from_secs(1));
        let mut ctx = direct_context();

        let output = stage.execute(&candidate("127.0.0.1", 443), &mut ctx).await.unwrap();
        let result = StageResult::from_output(StageId::Tls, output, Duration::ZERO);
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.flag("valid"), Some(false));
    }
}
