//! Stage 3: blacklist reputation of the candidate's address

use crate::config::InconclusivePolicy;
use crate::error::StageError;
use crate::pipeline::stage::{StageContext, StageExecutor, StageId, StageOutput};
use crate::proxy::models::Candidate;
use crate::reputation::{ReputationCache, Verdict};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Looks the candidate up in the run's shared reputation cache
///
/// The key is the address resolved by stage 1, falling back to the
/// descriptor's host when connectivity was not checked. A lookup still
/// pending when the budget runs out counts as inconclusive.
#[derive(Debug, Clone)]
pub struct ReputationStage {
    cache: Arc<ReputationCache>,
    inconclusive: InconclusivePolicy,
    budget: Option<Duration>,
}

impl ReputationStage {
    pub fn new(cache: Arc<ReputationCache>, inconclusive: InconclusivePolicy) -> Self {
        Self {
            cache,
            inconclusive,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    async fn verdict(&self, key: &str) -> Verdict {
        let Some(budget) = self.budget else {
            return self.cache.lookup(key).await;
        };
        match tokio::time::timeout(budget, self.cache.lookup(key)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(key, ?budget, "reputation lookup ran out of time");
                Verdict::inconclusive("reputation lookup exceeded its budget")
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ReputationStage {
    fn stage(&self) -> StageId {
        StageId::Reputation
    }

    async fn execute(
        &self,
        candidate: &Candidate,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, StageError> {
        let key = match ctx.resolved_ip() {
            Some(ip) => ip.to_string(),
            None => candidate.host.clone(),
        };

        let verdict = self.verdict(&key).await;
        let listed_by = verdict.listed_by();

        let output = StageOutput::passed()
            .metric("blacklisted", verdict.is_blacklisted())
            .metric("inconclusive", verdict.is_inconclusive())
            .metric("providers_listed", listed_by.len() as u32);

        if verdict.is_blacklisted() {
            info!(candidate = %candidate, key = %key, providers = ?listed_by, "address is blacklisted");
            return Ok(output.fail(StageError::Blacklisted(format!(
                "{} listed by {}",
                key,
                listed_by.join(", ")
            ))));
        }

        if verdict.is_inconclusive() {
            warn!(candidate = %candidate, key = %key, "reputation inconclusive");
            if self.inconclusive == InconclusivePolicy::Fail {
                return Ok(output.fail(StageError::ReputationQuery(format!(
                    "no provider answered for {}",
                    key
                ))));
            }
        }

        Ok(output)
    }
}
