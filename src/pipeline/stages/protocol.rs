//! Stage 2: protocol handshake through the engine

use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Starts the engine for the candidate and fetches the probe URL through it
#[derive(Debug, Clone)]
pub struct ProtocolStage {
    probe_url: String,
    timeout: Duration,
}

impl ProtocolStage {
    pub fn new(probe_url: &str, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl StageExecutor for ProtocolStage {
    fn stage(&self) -> StageId {
        StageId::Protocol
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        let client = ctx.session(candidate).await?.http_client(self.timeout)?;

        let start = Instant::now();
        let response = client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|e| StageError::Protocol(format!("handshake failed: {}", e)))?;
        let elapsed = start.elapsed();

        if !response.status().is_success() {
            return Err(StageError::Protocol(format!("HTTP status: {}", response.status())));
        }

        debug!(candidate = %candidate, handshake_ms = elapsed.as_millis() as u64, "protocol handshake");
        Ok(StageOutput::passed()
            .metric("handshake_ms", elapsed.as_millis() as u64)
            .metric("status", response.status().as_u16() as u32))
    }
}
