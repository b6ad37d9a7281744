//! Stage 4: download throughput through the tunnel

use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Downloads the speed test payload and measures throughput
///
/// The download stops at the end of a window shorter than the stage timeout
/// and throughput is taken from the bytes received by then, so a slow tunnel
/// is measured instead of timing out.
#[derive(Debug, Clone)]
pub struct SpeedStage {
    url: String,
    min_mbps: f64,
    timeout: Duration,
}

impl SpeedStage {
    pub fn new(url: &str, min_mbps: f64, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            min_mbps,
            timeout,
        }
    }

    /// Measurement window for a stage allowed `timeout`
    pub fn download_window(timeout: Duration) -> Duration {
        timeout * 4 / 5
    }

    fn measured(&self, bytes: u64, elapsed: Duration, truncated: bool) -> StageOutput {
        let mbps = throughput_mbps(bytes, elapsed);
        let output = StageOutput::passed()
            .metric("throughput_mbps", mbps)
            .metric("bytes", bytes)
            .metric("duration_ms", elapsed.as_millis() as u64)
            .metric("truncated", truncated)
            .metric("meets_floor", mbps >= self.min_mbps);
        if mbps < self.min_mbps {
            return output.fail(StageError::SpeedTest(format!(
                "{:.2} Mbps below minimum {:.2} Mbps",
                mbps, self.min_mbps
            )));
        }
        output
    }
}

/// Megabits per second for `bytes` transferred in `elapsed`
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

#[async_trait]
impl StageExecutor for SpeedStage {
    fn stage(&self) -> StageId {
        StageId::Speed
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        let client = ctx.session(candidate).await?.http_client(self.timeout)?;

        let start = Instant::now();
        let window_end = start + Self::download_window(self.timeout);

        let mut response = match timeout_at(window_end, client.get(&self.url).send()).await {
            Ok(sent) => sent.map_err(|e| StageError::SpeedTest(format!("download failed: {}", e)))?,
            Err(_) => {
                debug!(candidate = %candidate, "speed test got no response within its window");
                return Ok(self.measured(0, start.elapsed(), true));
            }
        };
        if !response.status().is_success() {
            return Err(StageError::SpeedTest(format!("HTTP status: {}", response.status())));
        }

        let mut bytes = 0u64;
        let mut truncated = false;
        loop {
            match timeout_at(window_end, response.chunk()).await {
                Ok(Ok(Some(chunk))) => bytes += chunk.len() as u64,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    return Err(StageError::SpeedTest(format!("download interrupted: {}", e)));
                }
                Err(_) => {
                    truncated = true;
                    break;
                }
            }
        }
        let elapsed = start.elapsed();

        if bytes == 0 && !truncated {
            return Err(StageError::SpeedTest("empty download".to_string()));
        }

        debug!(candidate = %candidate, bytes, truncated, mbps = throughput_mbps(bytes, elapsed), "speed test");
        Ok(self.measured(bytes, elapsed, truncated))
    }
}
