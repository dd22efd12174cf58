//! Per-service dispatch budgets.
//!
//! Each service gets one limiter shared by every channel that talks to it.
//! A limiter enforces:
//! - at most `per_second` starts in any rolling 1-second window
//! - at most `per_minute` starts in any rolling 60-second window
//! - at most `concurrency` permits held at once
//! - a cooldown after a throttling signal, which clears both windows when it ends
//!
//! Unset fields impose no cap. Waiting never fails; callers are suspended
//! until capacity frees up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

const SHORT_WINDOW: Duration = Duration::from_secs(1);
const LONG_WINDOW: Duration = Duration::from_secs(60);

/// Cooldown used when a throttling signal carries no delay and none is
/// configured.
const DEFAULT_THROTTLE_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Windows {
    short: VecDeque<Instant>,
    long: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl Windows {
    /// Reserve a start at `now`, or return the instant to retry at.
    fn reserve(&mut self, now: Instant, config: &RateLimitConfig) -> Result<(), Instant> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(until);
            }
            self.cooldown_until = None;
            self.short.clear();
            self.long.clear();
        }

        prune(&mut self.short, now, SHORT_WINDOW);
        prune(&mut self.long, now, LONG_WINDOW);

        if let Some(limit) = config.per_second {
            if self.short.len() >= limit as usize {
                return Err(self.short[0] + SHORT_WINDOW);
            }
        }
        if let Some(limit) = config.per_minute {
            if self.long.len() >= limit as usize {
                return Err(self.long[0] + LONG_WINDOW);
            }
        }

        if config.per_second.is_some() {
            self.short.push_back(now);
        }
        if config.per_minute.is_some() {
            self.long.push_back(now);
        }
        Ok(())
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while window
        .front()
        .is_some_and(|start| now.saturating_duration_since(*start) >= span)
    {
        window.pop_front();
    }
}

/// Held for the duration of one dispatch attempt.
#[derive(Debug)]
pub struct Permit {
    _slot: Option<OwnedSemaphorePermit>,
}

/// Rate limiter for one target service.
#[derive(Debug)]
pub struct RateLimiter {
    service: String,
    config: RateLimitConfig,
    slots: Option<Arc<Semaphore>>,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(service: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            service: service.into(),
            slots: config.concurrency.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// A limiter with no budgets at all.
    pub fn unlimited(service: impl Into<String>) -> Self {
        Self::new(service, RateLimitConfig::default())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wait for capacity and return a permit that frees its concurrency slot
    /// on drop.
    pub async fn acquire(&self) -> Permit {
        let slot = match self.slots {
            Some(ref slots) => slots.clone().acquire_owned().await.ok(),
            None => None,
        };

        if let Some(jitter) = self.jitter() {
            sleep(jitter).await;
        }

        loop {
            let retry_at = {
                let mut windows = self.windows.lock().await;
                match windows.reserve(Instant::now(), &self.config) {
                    Ok(()) => break,
                    Err(at) => at,
                }
            };
            debug!(service = %self.service, "Rate limit reached; waiting for capacity");
            sleep_until(retry_at).await;
        }

        Permit { _slot: slot }
    }

    /// Suspend all dispatch for this service after a throttling signal.
    ///
    /// The pause lasts the longer of `retry_after` and the configured
    /// `cooldown_seconds`. Overlapping cooldowns extend, never shorten.
    /// Returns the pause applied.
    pub async fn enter_cooldown(&self, retry_after: Option<Duration>) -> Duration {
        let configured = self.config.cooldown_seconds.map(Duration::from_secs);
        let pause = match (retry_after, configured) {
            (None, None) => DEFAULT_THROTTLE_COOLDOWN,
            (signal, configured) => signal.unwrap_or_default().max(configured.unwrap_or_default()),
        };

        let until = Instant::now() + pause;
        let mut windows = self.windows.lock().await;
        windows.cooldown_until = Some(windows.cooldown_until.map_or(until, |current| current.max(until)));

        warn!(
            service = %self.service,
            cooldown_ms = pause.as_millis() as u64,
            "Throttled; pausing dispatch"
        );
        pause
    }

    /// Time left in the current cooldown, if any.
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let windows = self.windows.lock().await;
        windows
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    fn jitter(&self) -> Option<Duration> {
        let min = self.config.jitter_min_ms.unwrap_or(0);
        let max = self.config.jitter_max_ms.unwrap_or(min).max(min);
        if max == 0 {
            return None;
        }
        let ms = rand::thread_rng().gen_range(min..=max);
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(per_second: Option<u32>, per_minute: Option<u32>, concurrency: Option<usize>) -> RateLimitConfig {
        RateLimitConfig {
            per_second,
            per_minute,
            concurrency,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited("telegram");
        let start = Instant::now();
        for _ in 0..100 {
            let _permit = limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn per_second_budget_is_enforced() {
        let limiter = RateLimiter::new("telegram", config(Some(3), None, None));
        let start = Instant::now();
        let mut starts = Vec::new();
        for _ in 0..7 {
            let _permit = limiter.acquire().await;
            starts.push(Instant::now().duration_since(start));
        }
        // Three per rolling second.
        assert_eq!(&starts[..3], &[Duration::ZERO; 3]);
        assert_eq!(&starts[3..6], &[SHORT_WINDOW; 3]);
        assert_eq!(starts[6], SHORT_WINDOW * 2);

        for window in starts.windows(4) {
            assert!(window[3] - window[0] >= SHORT_WINDOW);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_minute_budget_is_enforced() {
        let limiter = RateLimiter::new("discord", config(None, Some(2), None));
        let start = Instant::now();
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        let _c = limiter.acquire().await;
        assert_eq!(Instant::now().duration_since(start), LONG_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_bounds_in_flight() {
        let limiter = Arc::new(RateLimiter::new("telegram", config(None, None, Some(2))));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await;
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suspends_then_resets_windows() {
        let limiter = RateLimiter::new(
            "telegram",
            RateLimitConfig {
                per_second: Some(1),
                cooldown_seconds: Some(5),
                ..RateLimitConfig::default()
            },
        );
        let start = Instant::now();
        let _first = limiter.acquire().await;

        let applied = limiter.enter_cooldown(Some(Duration::from_secs(2))).await;
        assert_eq!(applied, Duration::from_secs(5));
        assert!(limiter.cooldown_remaining().await.is_some());

        let _second = limiter.acquire().await;
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(5));
        assert!(limiter.cooldown_remaining().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_longer_than_configured_wins() {
        let limiter = RateLimiter::new(
            "telegram",
            RateLimitConfig {
                cooldown_seconds: Some(1),
                ..RateLimitConfig::default()
            },
        );
        assert_eq!(
            limiter.enter_cooldown(Some(Duration::from_secs(30))).await,
            Duration::from_secs(30)
        );
        let start = Instant::now();
        let _permit = limiter.acquire().await;
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_without_hints_uses_default_pause() {
        let limiter = RateLimiter::unlimited("discord");
        assert_eq!(limiter.enter_cooldown(None).await, DEFAULT_THROTTLE_COOLDOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_delays_within_bounds() {
        let limiter = RateLimiter::new(
            "telegram",
            RateLimitConfig {
                jitter_min_ms: Some(100),
                jitter_max_ms: Some(200),
                ..RateLimitConfig::default()
            },
        );
        let start = Instant::now();
        let _permit = limiter.acquire().await;
        let waited = Instant::now().duration_since(start);
        assert!(waited >= Duration::from_millis(100) && waited <= Duration::from_millis(200));
    }
}
