//! Egress proxy pools with health tracking.
//!
//! Each service has its own pool. An endpoint is either healthy or cooling
//! down; it leaves cooldown only after the cooldown has elapsed *and* a fresh
//! health check passes. Rotation is round-robin over healthy endpoints, and
//! an empty or fully cooling pool routes directly.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{HealthCheckConfig, ProxyEndpointConfig};
use crate::error::ProxyError;
use crate::net::http::HttpClients;

/// One configured proxy.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    url: String,
    username: Option<String>,
    password: Option<SecretString>,
}

impl ProxyEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<SecretString>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Build from config, checking that reqwest accepts the URL.
    pub fn from_config(config: &ProxyEndpointConfig) -> Result<Self, ProxyError> {
        let endpoint = match config {
            ProxyEndpointConfig::Url(url) => Self::new(url.trim()),
            ProxyEndpointConfig::Full {
                url,
                username,
                password,
            } => {
                let endpoint = Self::new(url.trim());
                match username.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
                    Some(user) => endpoint.with_credentials(user, password.clone()),
                    None => endpoint,
                }
            }
        };
        endpoint.to_reqwest()?;
        Ok(endpoint)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// reqwest proxy for all schemes, with basic auth when configured.
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, ProxyError> {
        let proxy = reqwest::Proxy::all(&self.url).map_err(|e| ProxyError::InvalidEndpoint {
            endpoint: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(match self.username {
            Some(ref user) => {
                let password = self.password.as_ref().map(|p| p.expose_secret()).unwrap_or_default();
                proxy.basic_auth(user, password)
            }
            None => proxy,
        })
    }
}

/// How an outbound request leaves the process.
#[derive(Debug, Clone, Default)]
pub enum Route {
    #[default]
    Direct,
    Proxy(ProxyEndpoint),
}

impl Route {
    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        match self {
            Self::Direct => None,
            Self::Proxy(endpoint) => Some(endpoint),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Proxy(endpoint) => f.write_str(endpoint.url()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    CoolingDown { until: Instant },
}

#[derive(Debug)]
struct Slot {
    endpoint: ProxyEndpoint,
    health: Health,
    last_checked: Option<Instant>,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    cursor: usize,
}

/// Proxy pool of one service.
#[derive(Debug)]
pub struct ProxyPool {
    service: String,
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(service: impl Into<String>, endpoints: Vec<ProxyEndpoint>, cooldown: Duration) -> Self {
        let slots = endpoints
            .into_iter()
            .map(|endpoint| Slot {
                endpoint,
                health: Health::Healthy,
                last_checked: None,
            })
            .collect();
        Self {
            service: service.into(),
            cooldown,
            state: Mutex::new(PoolState { slots, cursor: 0 }),
        }
    }

    /// A pool with no endpoints; every request routes directly.
    pub fn empty(service: impl Into<String>) -> Self {
        Self::new(service, Vec::new(), Duration::ZERO)
    }

    /// Build from config. Endpoints reqwest cannot parse are logged and left out.
    pub fn from_config(
        service: impl Into<String>,
        endpoints: &[ProxyEndpointConfig],
        health: &HealthCheckConfig,
    ) -> Self {
        let service = service.into();
        let endpoints = endpoints
            .iter()
            .filter_map(|config| match ProxyEndpoint::from_config(config) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    error!(service = %service, error = %e, "Skipping proxy endpoint");
                    None
                }
            })
            .collect();
        Self::new(service, endpoints, Duration::from_secs(health.cooldown_secs))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn healthy_count(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.health == Health::Healthy)
            .count()
    }

    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.lock().slots.iter().map(|slot| slot.endpoint.clone()).collect()
    }

    /// Next healthy endpoint in rotation, or a direct route when none is.
    pub fn next_route(&self) -> Route {
        let mut state = self.lock();
        let count = state.slots.len();
        for offset in 0..count {
            let index = (state.cursor + offset) % count;
            if state.slots[index].health == Health::Healthy {
                state.cursor = (index + 1) % count;
                return Route::Proxy(state.slots[index].endpoint.clone());
            }
        }
        Route::Direct
    }

    /// Take an endpoint out of rotation for the cooldown period.
    pub fn mark_unhealthy(&self, url: &str, reason: &str) {
        let until = Instant::now() + self.cooldown;
        let mut state = self.lock();
        if let Some(slot) = state.slots.iter_mut().find(|slot| slot.endpoint.url == url) {
            slot.health = Health::CoolingDown { until };
            slot.last_checked = Some(Instant::now());
            warn!(
                service = %self.service,
                proxy = %url,
                cooldown_secs = self.cooldown.as_secs(),
                reason,
                "Proxy marked unhealthy"
            );
        }
    }

    /// Record a passed health check.
    pub fn mark_healthy(&self, url: &str) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.iter_mut().find(|slot| slot.endpoint.url == url) {
            if slot.health != Health::Healthy {
                info!(service = %self.service, proxy = %url, "Proxy back in rotation");
            }
            slot.health = Health::Healthy;
            slot.last_checked = Some(Instant::now());
        }
    }

    /// Cooling endpoints whose cooldown has elapsed and need a fresh check.
    pub fn due_for_check(&self) -> Vec<ProxyEndpoint> {
        let now = Instant::now();
        self.lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot.health, Health::CoolingDown { until } if until <= now))
            .map(|slot| slot.endpoint.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Health checks ───────────────────────────────────────────────────

/// Checks whether a proxy can reach the outside world.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, endpoint: &ProxyEndpoint) -> Result<(), ProxyError>;

    /// Whether `check` actually tests anything.
    fn is_active(&self) -> bool {
        true
    }
}

/// `GET` against a probe URL through the proxy.
pub struct HttpProbe {
    url: Option<String>,
    clients: HttpClients,
}

impl HttpProbe {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            url: config.url.clone().filter(|u| !u.trim().is_empty()),
            clients: HttpClients::new(Duration::from_secs(config.timeout_secs)),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    /// Without a probe URL every endpoint passes, so an evicted proxy
    /// rejoins the rotation as soon as its cooldown ends.
    async fn check(&self, endpoint: &ProxyEndpoint) -> Result<(), ProxyError> {
        let Some(ref url) = self.url else {
            return Ok(());
        };
        let failed = |reason: String| ProxyError::HealthCheckFailed {
            endpoint: endpoint.url().to_string(),
            reason,
        };

        let client = self.clients.for_route(&Route::Proxy(endpoint.clone()))?;
        let response = client.get(url).send().await.map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("status {}", response.status())));
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.url.is_some()
    }
}

/// Probe the given endpoints concurrently and record the results.
/// Returns how many passed.
pub async fn check_endpoints(pool: &ProxyPool, probe: &dyn HealthProbe, endpoints: Vec<ProxyEndpoint>) -> usize {
    let results = join_all(endpoints.iter().map(|endpoint| probe.check(endpoint))).await;
    let mut passed = 0;
    for (endpoint, result) in endpoints.iter().zip(results) {
        match result {
            Ok(()) => {
                pool.mark_healthy(endpoint.url());
                passed += 1;
            }
            Err(e) => pool.mark_unhealthy(endpoint.url(), &e.to_string()),
        }
    }
    passed
}

/// Probe every endpoint once at startup. Failures only start a cooldown.
pub async fn verify_pool(pool: &ProxyPool, probe: &dyn HealthProbe) {
    if pool.is_empty() {
        return;
    }
    if !probe.is_active() {
        warn!(
            service = %pool.service(),
            "No proxy health check URL configured; evicted proxies return after their cooldown unchecked"
        );
    }
    let total = pool.len();
    let passed = check_endpoints(pool, probe, pool.endpoints()).await;
    info!(service = %pool.service(), passed, total, "Proxy startup check complete");
}

/// Spawn the background health checker.
///
/// Every `interval` it re-checks endpoints whose cooldown has elapsed. Stops
/// when `shutdown` is cancelled.
pub fn spawn_health_checks(
    pools: Vec<Arc<ProxyPool>>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            pools = pools.len(),
            interval_secs = interval.as_secs(),
            "Proxy health checker started"
        );
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Proxy health checker shutting down");
                    return;
                }
                _ = tick.tick() => {}
            }

            for pool in &pools {
                let due = pool.due_for_check();
                if !due.is_empty() {
                    check_endpoints(pool, probe.as_ref(), due).await;
                }
            }
        }
    })
}
