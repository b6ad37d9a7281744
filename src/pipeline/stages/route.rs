//! Stage 6: latency to several reference hosts

use crate::config::RouteHost;
use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Probes every reference host concurrently through the tunnel
#[derive(Debug, Clone)]
pub struct RouteQualityStage {
    hosts: Vec<RouteHost>,
    max_latency: Duration,
    timeout: Duration,
}

impl RouteQualityStage {
    pub fn new(hosts: Vec<RouteHost>, max_latency: Duration, timeout: Duration) -> Self {
        Self {
            hosts,
            max_latency,
            timeout,
        }
    }

    async fn probe(client: &Client, host: &RouteHost) -> Option<Duration> {
        let start = Instant::now();
        match client.get(&host.url).send().await {
            Ok(response) if response.status().is_success() => Some(start.elapsed()),
            Ok(response) => {
                debug!(host = %host.name, status = %response.status(), "route probe rejected");
                None
            }
            Err(e) => {
                debug!(host = %host.name, error = %e, "route probe failed");
                None
            }
        }
    }
}

/// Reachable share scaled down by average latency relative to `max_latency`
pub fn quality_score(reachable: usize, tested: usize, avg_latency: Duration, max_latency: Duration) -> f64 {
    if tested == 0 || reachable == 0 {
        return 0.0;
    }
    let ratio = reachable as f64 / tested as f64;
    let slowness = if max_latency.is_zero() {
        1.0
    } else {
        (avg_latency.as_secs_f64() / max_latency.as_secs_f64()).min(1.0)
    };
    ratio * (1.0 - slowness)
}

#[async_trait]
impl StageExecutor for RouteQualityStage {
    fn stage(&self) -> StageId {
        StageId::RouteQuality
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        if self.hosts.is_empty() {
            return Ok(StageOutput::skipped().metric("hosts_tested", 0u32));
        }

        let client = ctx.session(candidate).await?.http_client(self.timeout)?;
        let latencies = join_all(self.hosts.iter().map(|host| Self::probe(&client, host))).await;

        let mut output = StageOutput::passed();
        let mut reachable = Vec::new();
        for (host, latency) in self.hosts.iter().zip(&latencies) {
            if let Some(latency) = latency {
                output = output.metric(
                    &format!("latency_ms.{}", host.name.to_ascii_lowercase()),
                    latency.as_millis() as u64,
                );
                reachable.push(*latency);
            }
        }

        let tested = self.hosts.len();
        output = output
            .metric("hosts_tested", tested as u32)
            .metric("hosts_reachable", reachable.len() as u32);

        if reachable.is_empty() {
            return Ok(output
                .metric("quality_score", 0.0)
                .fail(StageError::RouteQuality(format!("none of {} reference hosts reachable", tested))));
        }

        let avg = reachable.iter().sum::<Duration>() / reachable.len() as u32;
        let score = quality_score(reachable.len(), tested, avg, self.max_latency);
        debug!(candidate = %candidate, reachable = reachable.len(), tested, score, "route quality");

        Ok(output
            .metric("avg_latency_ms", avg.as_millis() as u64)
            .metric("quality_score", score))
    }
}
