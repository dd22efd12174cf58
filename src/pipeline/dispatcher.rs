//! Dispatcher: sends one message's units in order and advances its cursor.
//!
//! Per unit the dispatcher takes a rate limiter permit and a proxy route,
//! then sends. Outcomes map to policy:
//! - transient failure: retry with exponential backoff, bounded attempts
//! - throttled: put the service into cooldown, then retry
//! - proxy unusable: evict the proxy, retry on the next route
//! - permanent: abandon the rest of the message
//!
//! The cursor moves only once every unit has been acknowledged.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{DeliveryError, SendError};
use crate::net::ServiceContext;
use crate::pipeline::types::{DeliverableUnit, Destination, MessageId};
use crate::state::StateStore;

/// Retry and pacing knobs.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Random pause between units of one message, never before the first.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Attempts per unit against transient failures.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Throttling signals tolerated per unit before giving up on it.
    pub max_throttles: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_throttles: 10,
        }
    }
}

impl DispatchSettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(runtime.min_delay_ms),
            max_delay: Duration::from_millis(runtime.max_delay_ms.max(runtime.min_delay_ms)),
            ..Self::default()
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Delivers formatted units to one destination service.
pub struct Dispatcher {
    destination: Arc<dyn Destination>,
    service: ServiceContext,
    state: Arc<StateStore>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        destination: Arc<dyn Destination>,
        service: ServiceContext,
        state: Arc<StateStore>,
        settings: DispatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            destination,
            service,
            state,
            settings,
            shutdown,
        }
    }

    /// Send every unit of one message to `chat`, then advance `channel`'s
    /// cursor to `message_id`.
    ///
    /// On shutdown the unit in flight finishes and the rest are dropped.
    pub async fn deliver(
        &self,
        channel: &str,
        chat: &str,
        message_id: MessageId,
        units: &[DeliverableUnit],
    ) -> Result<(), DeliveryError> {
        let total = units.len();

        for (index, unit) in units.iter().enumerate() {
            let cancelled = DeliveryError::Cancelled {
                delivered: index,
                total,
            };
            if self.shutdown.is_cancelled() {
                return Err(cancelled);
            }
            if index > 0 {
                if let Some(delay) = self.inter_unit_delay() {
                    if !self.pause(delay).await {
                        return Err(cancelled);
                    }
                }
            }
            self.send_unit(chat, unit, index + 1, total).await?;
        }

        self.state.advance(channel, message_id).await?;
        info!(
            service = self.destination.service(),
            channel,
            chat,
            message_id = %message_id,
            units = total,
            "Message forwarded"
        );
        Ok(())
    }

    async fn send_unit(
        &self,
        chat: &str,
        unit: &DeliverableUnit,
        position: usize,
        total: usize,
    ) -> Result<(), DeliveryError> {
        let mut failures = 0u32;
        let mut throttles = 0u32;
        let mut evictions = 0usize;

        loop {
            let permit = tokio::select! {
                permit = self.service.limiter.acquire() => permit,
                _ = self.shutdown.cancelled() => {
                    return Err(DeliveryError::Cancelled { delivered: position - 1, total });
                }
            };
            let route = self.service.proxies.next_route();

            let result = match unit {
                DeliverableUnit::Text(block) => self.destination.send_text(chat, block, &route).await,
                DeliverableUnit::Attachment(summary) => {
                    self.destination.send_attachment(chat, summary, &route).await
                }
            };
            drop(permit);

            let reason = match result {
                Ok(()) => {
                    debug!(chat, unit = position, total, kind = unit.label(), route = %route, "Unit sent");
                    return Ok(());
                }
                Err(SendError::Permanent { reason }) => {
                    error!(
                        service = self.destination.service(),
                        chat,
                        unit = position,
                        total,
                        reason = %reason,
                        "Unit permanently rejected"
                    );
                    return Err(DeliveryError::Permanent {
                        unit: position,
                        total,
                        reason,
                    });
                }
                Err(SendError::Throttled { retry_after }) => {
                    throttles += 1;
                    if throttles > self.settings.max_throttles {
                        return Err(DeliveryError::RetriesExhausted {
                            unit: position,
                            total,
                            attempts: throttles,
                            reason: "throttled too many times".into(),
                        });
                    }
                    let pause = self.service.limiter.enter_cooldown(retry_after).await;
                    warn!(
                        chat,
                        unit = position,
                        total,
                        cooldown_ms = pause.as_millis() as u64,
                        "Destination throttled; retrying unit after cooldown"
                    );
                    continue;
                }
                Err(SendError::ProxyUnhealthy { proxy, reason }) if evictions < self.service.proxies.len() => {
                    evictions += 1;
                    self.service.proxies.mark_unhealthy(&proxy, &reason);
                    continue;
                }
                Err(SendError::ProxyUnhealthy { reason, .. }) | Err(SendError::Transient { reason }) => reason,
            };

            failures += 1;
            if failures >= self.settings.max_attempts {
                error!(
                    service = self.destination.service(),
                    chat,
                    unit = position,
                    total,
                    attempts = failures,
                    reason = %reason,
                    "Giving up on unit"
                );
                return Err(DeliveryError::RetriesExhausted {
                    unit: position,
                    total,
                    attempts: failures,
                    reason,
                });
            }
            let backoff = self.settings.backoff(failures);
            warn!(
                chat,
                unit = position,
                total,
                attempt = failures,
                backoff_ms = backoff.as_millis() as u64,
                reason = %reason,
                "Transient send failure; retrying"
            );
            if !self.pause(backoff).await {
                return Err(DeliveryError::Cancelled {
                    delivered: position - 1,
                    total,
                });
            }
        }
    }

    fn inter_unit_delay(&self) -> Option<Duration> {
        let min = self.settings.min_delay.as_millis() as u64;
        let max = self.settings.max_delay.as_millis() as u64;
        if max == 0 {
            return None;
        }
        let ms = rand::thread_rng().gen_range(min.min(max)..=max);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Sleep unless shutdown comes first. Returns `false` when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::config::{ParseMode, RateLimitConfig};
    use crate::net::proxy::{ProxyEndpoint, ProxyPool, Route};
    use crate::net::rate_limit::RateLimiter;
    use crate::pipeline::types::{AttachmentSummary, TextBlock};

    /// Destination with scripted outcomes that records every attempt.
    struct ScriptedDestination {
        script: Mutex<VecDeque<Result<(), SendError>>>,
        attempts: Mutex<Vec<(String, String, Option<MessageId>)>>,
        state: Arc<StateStore>,
    }

    impl ScriptedDestination {
        fn new(state: Arc<StateStore>, script: Vec<Result<(), SendError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
                state,
            }
        }

        /// Unit texts in attempt order.
        fn sent(&self) -> Vec<String> {
            self.attempts.lock().unwrap().iter().map(|a| a.0.clone()).collect()
        }

        fn routes(&self) -> Vec<String> {
            self.attempts.lock().unwrap().iter().map(|a| a.1.clone()).collect()
        }

        fn record(&self, text: &str, route: &Route) -> Result<(), SendError> {
            self.attempts
                .lock()
                .unwrap()
                .push((text.to_string(), route.to_string(), self.state.get("chan")));
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    #[async_trait]
    impl Destination for ScriptedDestination {
        fn service(&self) -> &str {
            "telegram"
        }

        async fn send_text(&self, _chat: &str, block: &TextBlock, route: &Route) -> Result<(), SendError> {
            self.record(&block.text, route)
        }

        async fn send_attachment(
            &self,
            _chat: &str,
            unit: &AttachmentSummary,
            route: &Route,
        ) -> Result<(), SendError> {
            self.record(&unit.url, route)
        }
    }

    fn units(n: usize) -> Vec<DeliverableUnit> {
        (1..=n)
            .map(|i| {
                DeliverableUnit::Text(TextBlock {
                    text: format!("u{i}"),
                    parse_mode: ParseMode::Html,
                    disable_preview: true,
                })
            })
            .collect()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        state: Arc<StateStore>,
        destination: Arc<ScriptedDestination>,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
    }

    async fn harness(script: Vec<Result<(), SendError>>, service: ServiceContext, settings: DispatchSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());
        let destination = Arc::new(ScriptedDestination::new(state.clone(), script));
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            destination.clone(),
            service,
            state.clone(),
            settings,
            shutdown.clone(),
        );
        Harness {
            _dir: dir,
            state,
            destination,
            dispatcher,
            shutdown,
        }
    }

    fn transient() -> Result<(), SendError> {
        Err(SendError::Transient {
            reason: "502 Bad Gateway".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order_with_delays_then_advances() {
        let settings = DispatchSettings {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
            ..DispatchSettings::default()
        };
        let h = harness(vec![], ServiceContext::unrestricted("telegram"), settings).await;
        let start = Instant::now();

        h.dispatcher.deliver("chan", "chat", MessageId(42), &units(3)).await.unwrap();

        assert_eq!(h.destination.sent(), vec!["u1", "u2", "u3"]);
        // No delay before the first unit.
        assert_eq!(Instant::now().duration_since(start), Duration::from_millis(1000));
        assert_eq!(h.state.get("chan"), Some(MessageId(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_on_third_of_five_retries_after_cooldown() {
        let service = ServiceContext::new(
            RateLimiter::new(
                "telegram",
                RateLimitConfig {
                    cooldown_seconds: Some(1),
                    ..RateLimitConfig::default()
                },
            ),
            ProxyPool::empty("telegram"),
        );
        let script = vec![
            Ok(()),
            Ok(()),
            Err(SendError::Throttled {
                retry_after: Some(Duration::from_secs(3)),
            }),
        ];
        let h = harness(script, service, DispatchSettings::default()).await;
        let start = Instant::now();

        h.dispatcher.deliver("chan", "chat", MessageId(7), &units(5)).await.unwrap();

        assert_eq!(h.destination.sent(), vec!["u1", "u2", "u3", "u3", "u4", "u5"]);
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(3));
        // Cursor untouched while any unit was outstanding.
        let attempts = h.destination.attempts.lock().unwrap().clone();
        assert!(attempts.iter().all(|(_, _, cursor)| cursor.is_none()));
        assert_eq!(h.state.get("chan"), Some(MessageId(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_abandons_rest_without_cursor() {
        let script = vec![
            Ok(()),
            Err(SendError::Permanent {
                reason: "chat not found".into(),
            }),
        ];
        let h = harness(script, ServiceContext::unrestricted("telegram"), DispatchSettings::default()).await;

        let err = h
            .dispatcher
            .deliver("chan", "chat", MessageId(9), &units(4))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Permanent { unit: 2, total: 4, .. }));
        assert_eq!(h.destination.sent(), vec!["u1", "u2"]);
        assert_eq!(h.state.get("chan"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let h = harness(
            vec![transient(), transient()],
            ServiceContext::unrestricted("telegram"),
            DispatchSettings::default(),
        )
        .await;
        let start = Instant::now();

        h.dispatcher.deliver("chan", "chat", MessageId(3), &units(1)).await.unwrap();

        assert_eq!(h.destination.sent(), vec!["u1", "u1", "u1"]);
        // 1s then 2s of backoff.
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(3));
        assert_eq!(h.state.get("chan"), Some(MessageId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_keeps_cursor() {
        let h = harness(
            vec![transient(), transient(), transient()],
            ServiceContext::unrestricted("telegram"),
            DispatchSettings::default(),
        )
        .await;

        let err = h
            .dispatcher
            .deliver("chan", "chat", MessageId(3), &units(2))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::RetriesExhausted { unit: 1, attempts: 3, .. }));
        assert_eq!(h.state.get("chan"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_proxy_is_evicted_and_direct_used() {
        let pool = ProxyPool::new(
            "telegram",
            vec![ProxyEndpoint::new("http://proxy.local:8080")],
            Duration::from_secs(60),
        );
        let service = ServiceContext::new(RateLimiter::unlimited("telegram"), pool);
        let script = vec![Err(SendError::ProxyUnhealthy {
            proxy: "http://proxy.local:8080".into(),
            reason: "connect timeout".into(),
        })];
        let h = harness(script, service.clone(), DispatchSettings::default()).await;

        h.dispatcher.deliver("chan", "chat", MessageId(5), &units(1)).await.unwrap();

        assert_eq!(h.destination.routes(), vec!["http://proxy.local:8080", "direct"]);
        assert_eq!(service.proxies.healthy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_before_next_unit() {
        let h = harness(vec![], ServiceContext::unrestricted("telegram"), DispatchSettings::default()).await;
        h.shutdown.cancel();

        let err = h
            .dispatcher
            .deliver("chan", "chat", MessageId(5), &units(2))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Cancelled { delivered: 0, total: 2 }));
        assert!(h.destination.sent().is_empty());
        assert_eq!(h.state.get("chan"), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(2), Duration::from_secs(2));
        assert_eq!(settings.backoff(3), Duration::from_secs(4));
        assert_eq!(settings.backoff(10), Duration::from_secs(30));
    }
}
