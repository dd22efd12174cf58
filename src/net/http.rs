//! reqwest clients per egress route, plus retry hint parsing shared by the
//! service adapters.
//!
//! A reqwest client binds its proxy at build time, so each proxy endpoint
//! gets its own client. Clients are built on first use and reused.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::ProxyError;
use crate::net::proxy::Route;

/// Idle pooled connections are dropped after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Upper bound on any server-supplied retry hint.
const MAX_RETRY_HINT_SECS: f64 = 3600.0;

pub struct HttpClients {
    timeout: Duration,
    direct: Mutex<Option<reqwest::Client>>,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpClients {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            direct: Mutex::new(None),
            proxied: Mutex::new(HashMap::new()),
        }
    }

    /// Client for a route, built on first use.
    pub fn for_route(&self, route: &Route) -> Result<reqwest::Client, ProxyError> {
        match route {
            Route::Direct => {
                let mut direct = self.direct.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(ref client) = *direct {
                    return Ok(client.clone());
                }
                let client = self.builder().build().map_err(|e| ProxyError::InvalidEndpoint {
                    endpoint: "direct".into(),
                    reason: e.to_string(),
                })?;
                *direct = Some(client.clone());
                Ok(client)
            }
            Route::Proxy(endpoint) => {
                let mut proxied = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(client) = proxied.get(endpoint.url()) {
                    return Ok(client.clone());
                }
                let client = self
                    .builder()
                    .proxy(endpoint.to_reqwest()?)
                    .build()
                    .map_err(|e| ProxyError::InvalidEndpoint {
                        endpoint: endpoint.url().to_string(),
                        reason: e.to_string(),
                    })?;
                proxied.insert(endpoint.url().to_string(), client.clone());
                Ok(client)
            }
        }
    }

    fn builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
    }
}

/// Retry hint from a `Retry-After` header given in seconds.
pub fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(retry_after_secs)
}

/// Retry hint in seconds, capped at an hour. Negative or non-finite values
/// are ignored.
pub fn retry_after_secs(value: f64) -> Option<Duration> {
    (value.is_finite() && value >= 0.0)
        .then(|| Duration::from_secs_f64(value.min(MAX_RETRY_HINT_SECS)))
}
