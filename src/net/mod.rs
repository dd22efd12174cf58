//! Outbound plumbing shared by the source and destination adapters:
//! per-service rate limiters, proxy pools, and route-aware HTTP clients.

pub mod http;
pub mod proxy;
pub mod rate_limit;

use std::sync::Arc;

use crate::config::Config;
use proxy::ProxyPool;
use rate_limit::RateLimiter;

/// Service name of the source feed.
pub const SOURCE_SERVICE: &str = "discord";

/// Service name of the destination.
pub const DESTINATION_SERVICE: &str = "telegram";

/// Limiter and proxy pool of one service, shared by every channel using it.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub limiter: Arc<RateLimiter>,
    pub proxies: Arc<ProxyPool>,
}

impl ServiceContext {
    pub fn new(limiter: RateLimiter, proxies: ProxyPool) -> Self {
        Self {
            limiter: Arc::new(limiter),
            proxies: Arc::new(proxies),
        }
    }

    /// Unlimited, direct-only context.
    pub fn unrestricted(service: &str) -> Self {
        Self::new(RateLimiter::unlimited(service), ProxyPool::empty(service))
    }

    /// Build the context of `service` from config.
    pub fn from_config(service: &str, config: &Config) -> Self {
        let limits = match service {
            SOURCE_SERVICE => config.rate_limits.discord.clone(),
            DESTINATION_SERVICE => config.rate_limits.telegram.clone(),
            _ => Default::default(),
        };
        Self::new(
            RateLimiter::new(service, limits),
            ProxyPool::from_config(service, config.proxies_for(service), &config.proxies.healthcheck),
        )
    }
}
