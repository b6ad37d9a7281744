//! Stage 1: TCP reachability and connect latency

use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tracing::debug;

/// Resolves the candidate host and opens a plain TCP connection to it
#[derive(Debug, Clone)]
pub struct ConnectivityStage {
    max_latency: Duration,
}

impl ConnectivityStage {
    pub fn new(max_latency: Duration) -> Self {
        Self { max_latency }
    }

    async fn resolve(candidate: &Candidate) -> Result<Vec<SocketAddr>, StageError> {
        let addrs: Vec<SocketAddr> = lookup_host((candidate.host.as_str(), candidate.port))
            .await
            .map_err(|e| StageError::Connectivity(format!("cannot resolve {}: {}", candidate.host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(StageError::Connectivity(format!(
                "{} has no addresses",
                candidate.host
            )));
        }
        Ok(addrs)
    }
}

#[async_trait]
impl StageExecutor for ConnectivityStage {
    fn stage(&self) -> StageId {
        StageId::Connectivity
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        let addrs = Self::resolve(candidate).await?;

        let mut last_error = None;
        for addr in addrs {
            let start = Instant::now();
            match TcpStream::connect(addr).await {
                Ok(_stream) => {
                    let latency = start.elapsed();
                    ctx.set_resolved_ip(addr.ip());
                    debug!(candidate = %candidate, ip = %addr.ip(), latency_ms = latency.as_millis() as u64, "tcp connect");

                    let output = StageOutput::passed()
                        .metric("latency_ms", latency.as_millis() as u64)
                        .metric("ip", addr.ip().to_string());
                    if latency > self.max_latency {
                        return Ok(output.fail(StageError::Connectivity(format!(
                            "connect latency {}ms exceeds {}ms",
                            latency.as_millis(),
                            self.max_latency.as_millis()
                        ))));
                    }
                    return Ok(output);
                }
                Err(e) => last_error = Some(format!("{}: {}", addr, e)),
            }
        }

        Err(StageError::Connectivity(
            last_error.unwrap_or_else(|| "no address to connect to".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::pipeline::stage::{StageResult, StageStatus};
    use crate::pipeline::stages::testing::{candidate, closed_port, direct_context};
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_host_passes() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut ctx = direct_context();

        let stage = ConnectivityStage::new(Duration::from_secs(2));
        let output = stage.execute(&candidate("127.0.0.1", port), &mut ctx).await.unwrap();
        let result = StageResult::from_output(StageId::Connectivity, output, Duration::ZERO);

        assert_eq!(result.status, StageStatus::Passed);
        assert!(result.metric("latency_ms").is_some());
        assert_eq!(result.text("ip"), Some("127.0.0.1"));
        assert_eq!(ctx.resolved_ip(), Some("127.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let port = closed_port().await;
        let mut ctx = direct_context();

        let stage = ConnectivityStage::new(Duration::from_secs(2));
        let err = stage.execute(&candidate("127.0.0.1", port), &mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connectivity);
        assert!(ctx.resolved_ip().is_none());
    }

    #[tokio::test]
    async fn test_latency_above_maximum_fails_with_metric() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut ctx = direct_context();

        let stage = ConnectivityStage::new(Duration::ZERO);
        let output = stage.execute(&candidate("127.0.0.1", port), &mut ctx).await.unwrap();
        let result = StageResult::from_output(StageId::Connectivity, output, Duration::ZERO);

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.metric("latency_ms").is_some());
        assert_eq!(result.cause.unwrap().kind, FailureKind::Connectivity);
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails() {
        let mut ctx = direct_context();
        let stage = ConnectivityStage::new(Duration::from_secs(2));
        let err = stage
            .execute(&candidate("no-such-host.invalid", 443), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connectivity);
    }
}
