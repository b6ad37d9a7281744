//! IP/host reputation checking
//!
//! - DNSBL providers behind the [`ReputationProvider`] trait
//! - a run-scoped [`ReputationCache`] with TTL expiry and single-flight lookups
//! - an injectable [`RetryPolicy`] for provider failures

pub mod cache;
pub mod provider;
pub mod retry;

pub use cache::{CacheStats, ProviderOutcome, ReputationCache, ReputationCacheEntry, ReputationStatus, Verdict};
pub use provider::{DnsblProvider, ReputationProvider};
pub use retry::RetryPolicy;
