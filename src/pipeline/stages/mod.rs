//! The seven stage executors

pub mod connectivity;
pub mod protocol;
pub mod reputation;
pub mod route;
pub mod speed;
pub mod stability;
pub mod tls;

pub use connectivity::ConnectivityStage;
pub use protocol::ProtocolStage;
pub use reputation::ReputationStage;
pub use route::RouteQualityStage;
pub use speed::SpeedStage;
pub use stability::StabilityStage;
pub use tls::TlsStage;

use crate::config::ValidatorConfig;
use crate::pipeline::stage::{StageExecutor, StageId};
use crate::reputation::ReputationCache;
use std::sync::Arc;

/// Executor for `stage` built from the run configuration
pub fn build_stage(
    stage: StageId,
    config: &ValidatorConfig,
    cache: &Arc<ReputationCache>,
) -> Arc<dyn StageExecutor> {
    match stage {
        StageId::Connectivity => Arc::new(ConnectivityStage::new(config.max_latency())),
        StageId::Protocol => Arc::new(ProtocolStage::new(&config.probe_url, config.http_timeout())),
        StageId::Reputation => Arc::new(
            ReputationStage::new(Arc::clone(cache), config.reputation.inconclusive)
                .with_budget(config.reputation_budget()),
        ),
        StageId::Speed => Arc::new(SpeedStage::new(
            &config.speed_test_url,
            config.min_speed_mbps,
            config.stages.speed.timeout(),
        )),
        StageId::Stability => Arc::new(StabilityStage::new(
            &config.probe_url,
            config.stability_checks,
            config.stability_success_rate,
            config.http_timeout(),
        )),
        StageId::RouteQuality => Arc::new(RouteQualityStage::new(
            config.route_quality_hosts.clone(),
            config.max_latency(),
            config.http_timeout(),
        )),
        StageId::Tls => Arc::new(
            TlsStage::new(&config.tls_probe_url, config.http_timeout())
                .with_pins(config.pinned_fingerprints.clone()),
        ),
    }
}

/// Executors for every enabled stage, in pipeline order
pub fn build_stages(config: &ValidatorConfig, cache: &Arc<ReputationCache>) -> Vec<Arc<dyn StageExecutor>> {
    config
        .stages
        .enabled()
        .into_iter()
        .map(|stage| build_stage(stage, config, cache))
        .collect()
}
