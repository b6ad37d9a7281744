//! DNS-based blacklist providers

use crate::error::ReputationError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// A source of blacklist verdicts for a host or IP
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(true)` if the key is listed, `Ok(false)` if it is not.
    /// `Err` means the provider could not answer.
    async fn is_listed(&self, key: &str) -> Result<bool, ReputationError>;
}

/// DNSBL zone queried through an async resolver
pub struct DnsblProvider {
    zone: String,
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsblProvider {
    pub fn new(zone: &str, timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        // retries are driven by the cache's RetryPolicy
        opts.attempts = 1;
        opts.cache_size = 0;

        Self {
            zone: zone.trim_matches('.').to_string(),
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            timeout,
        }
    }

    /// Name queried for `key`: reversed IPv4 octets, reversed IPv6 nibbles,
    /// or the hostname itself, followed by the zone
    pub fn query_name(&self, key: &str) -> String {
        let prefix = match key.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                let [a, b, c, d] = ip.octets();
                format!("{}.{}.{}.{}", d, c, b, a)
            }
            Ok(IpAddr::V6(ip)) => ip
                .octets()
                .iter()
                .rev()
                .flat_map(|byte| [byte & 0x0f, byte >> 4])
                .map(|nibble| format!("{:x}", nibble))
                .collect::<Vec<_>>()
                .join("."),
            Err(_) => key.trim_matches('.').to_ascii_lowercase(),
        };
        format!("{}.{}.", prefix, self.zone)
    }
}

/// Whether a DNSBL answer means "listed"
///
/// Listings are answered inside 127.0.0.0/8; 127.255.255.0/24 is what
/// Spamhaus returns for refused or malformed queries.
fn classify_answer(addr: Ipv4Addr) -> Option<bool> {
    let [a, b, c, _] = addr.octets();
    match (a, b, c) {
        (127, 255, 255) => None,
        (127, _, _) => Some(true),
        _ => Some(false),
    }
}

#[async_trait]
impl ReputationProvider for DnsblProvider {
    fn name(&self) -> &str {
        &self.zone
    }

    async fn is_listed(&self, key: &str) -> Result<bool, ReputationError> {
        let query = self.query_name(key);
        let lookup = tokio::time::timeout(self.timeout, self.resolver.ipv4_lookup(query.as_str()))
            .await
            .map_err(|_| ReputationError::Timeout {
                provider: self.zone.clone(),
            })?;

        match lookup {
            Ok(answers) => {
                let mut listed = false;
                for answer in answers.iter() {
                    match classify_answer(answer.0) {
                        Some(hit) => listed |= hit,
                        None => {
                            return Err(ReputationError::Lookup {
                                provider: self.zone.clone(),
                                reason: format!("query refused ({})", answer.0),
                            })
                        }
                    }
                }
                Ok(listed)
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(ReputationError::Lookup {
                    provider: self.zone.clone(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}
