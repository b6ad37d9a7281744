//! Stage 5: repeated connection attempts

use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Pause between two attempts
pub const CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Fetches the probe URL several times over fresh connections
#[derive(Debug, Clone)]
pub struct StabilityStage {
    probe_url: String,
    checks: u32,
    required_rate: f64,
    timeout: Duration,
}

impl StabilityStage {
    pub fn new(probe_url: &str, checks: u32, required_rate: f64, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.to_string(),
            checks,
            required_rate,
            timeout,
        }
    }
}

#[async_trait]
impl StageExecutor for StabilityStage {
    fn stage(&self) -> StageId {
        StageId::Stability
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        if self.checks == 0 {
            return Ok(StageOutput::skipped().metric("checks", 0u32));
        }

        let builder = ctx.session(candidate).await?.client_builder(self.timeout)?;
        // no pooled connections, every attempt dials the tunnel again
        let client = builder
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| StageError::Stability(e.to_string()))?;

        let mut successes = 0u32;
        let mut total_latency = Duration::ZERO;
        for attempt in 0..self.checks {
            if attempt > 0 {
                tokio::select! {
                    _ = ctx.cancellation().cancelled() => {
                        return Err(StageError::Stability("cancelled between checks".to_string()));
                    }
                    _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                }
            }
            let start = Instant::now();
            match client.get(&self.probe_url).send().await {
                Ok(response) if response.status().is_success() => {
                    successes += 1;
                    total_latency += start.elapsed();
                }
                Ok(response) => {
                    debug!(candidate = %candidate, attempt, status = %response.status(), "stability check failed")
                }
                Err(e) => debug!(candidate = %candidate, attempt, error = %e, "stability check failed"),
            }
        }

        let rate = successes as f64 / self.checks as f64;
        let mut output = StageOutput::passed()
            .metric("checks", self.checks)
            .metric("successes", successes)
            .metric("success_rate", rate);
        if successes > 0 {
            output = output.metric("avg_latency_ms", (total_latency / successes).as_millis() as u64);
        }

        if rate < self.required_rate {
            return Ok(output.fail(StageError::Stability(format!(
                "{}/{} checks succeeded, {:.0}% required",
                successes,
                self.checks,
                self.required_rate * 100.0
            ))));
        }
        Ok(output)
    }
}
