//! Poller: fetch → filter → format → dispatch, per channel, every interval.
//!
//! Channels are polled concurrently; messages within a channel are handled
//! strictly in ascending id order. Two positions are tracked per channel:
//! the persisted cursor (last fully delivered message, owned by the state
//! store) and an in-memory poll position that also moves past rejected,
//! unformattable and abandoned messages so they are not fetched again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelDefaults, ChannelMapping, RuntimeConfig, StartPoint, merge_filters, merge_text};
use crate::error::{DeliveryError, SourceError};
use crate::net::ServiceContext;
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::filter::{FilterDecision, FilterEngine};
use crate::pipeline::format::Formatter;
use crate::pipeline::types::{FetchRequest, MessageId, RawMessage, SourceFeed};
use crate::state::StateStore;

/// Largest page the source API serves.
pub const MAX_PAGE_SIZE: usize = 100;

/// A channel mapping with its merged filter and text settings.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub mapping: ChannelMapping,
    pub filter: FilterEngine,
    pub formatter: Formatter,
}

impl ChannelContext {
    pub fn new(mapping: &ChannelMapping, defaults: &ChannelDefaults) -> Self {
        let filters = merge_filters(&defaults.filters, &mapping.filters);
        let text = merge_text(&defaults.text, &mapping.text);
        Self {
            filter: FilterEngine::new(&filters),
            formatter: Formatter::new(text, mapping.display_name()),
            mapping: mapping.clone(),
        }
    }

    pub fn source(&self) -> &str {
        &self.mapping.source
    }

    pub fn destination(&self) -> &str {
        &self.mapping.destination
    }
}

/// Fetch bounds and start policy.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub page_size: usize,
    pub max_messages: usize,
    pub max_fetch: Duration,
    pub start_from: StartPoint,
}

impl PollSettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            interval: Duration::from_secs(runtime.poll_interval_secs.max(1)),
            page_size: MAX_PAGE_SIZE,
            max_messages: runtime.max_messages_per_channel.max(1),
            max_fetch: Duration::from_secs(runtime.max_fetch_seconds),
            start_from: runtime.start_from,
        }
    }
}

/// Counters of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub fetched: usize,
    pub forwarded: usize,
    pub rejected: usize,
    /// Pinned, system, unformattable or abandoned messages.
    pub skipped: usize,
    /// Channels whose fetch failed or whose batch was halted.
    pub failed_channels: usize,
}

impl CycleSummary {
    fn merge(&mut self, other: CycleSummary) {
        self.fetched += other.fetched;
        self.forwarded += other.forwarded;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.failed_channels += other.failed_channels;
    }
}

/// Drives polling for every configured channel.
pub struct Poller {
    source: Arc<dyn SourceFeed>,
    source_service: ServiceContext,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateStore>,
    channels: Vec<ChannelContext>,
    settings: PollSettings,
    /// In-memory poll position per channel. An entry with `None` means the
    /// channel was baselined while empty.
    positions: Mutex<HashMap<String, Option<MessageId>>>,
    shutdown: CancellationToken,
}

impl Poller {
    pub fn new(
        source: Arc<dyn SourceFeed>,
        source_service: ServiceContext,
        dispatcher: Arc<Dispatcher>,
        state: Arc<StateStore>,
        channels: Vec<ChannelContext>,
        settings: PollSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            source_service,
            dispatcher,
            state,
            channels,
            settings,
            positions: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Current poll position of a channel: the later of the persisted cursor
    /// and the in-memory position.
    pub fn position(&self, channel: &str) -> Option<MessageId> {
        let memory = self
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .copied()
            .flatten();
        memory.max(self.state.get(channel))
    }

    fn is_initialised(&self, channel: &str) -> bool {
        self.state.get(channel).is_some()
            || self
                .positions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(channel)
    }

    fn set_position(&self, channel: &str, id: Option<MessageId>) {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = positions.entry(channel.to_string()).or_default();
        if id > *entry {
            *entry = id;
        }
    }

    /// Spawn the poll loop. It stops taking new cycles as soon as `shutdown`
    /// is cancelled.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                channels = self.channels.len(),
                interval_secs = self.settings.interval.as_secs(),
                "Poller started"
            );
            let mut tick = tokio::time::interval(self.settings.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("Poller shutting down");
                        return;
                    }
                    _ = tick.tick() => {}
                }
                self.poll_cycle().await;
            }
        })
    }

    /// Run one cycle over every channel.
    pub async fn poll_cycle(&self) -> CycleSummary {
        let started = Instant::now();
        let outcomes = join_all(self.channels.iter().map(|channel| self.poll_channel(channel))).await;

        let mut summary = CycleSummary::default();
        for outcome in outcomes {
            summary.merge(outcome);
        }

        let level_info = summary.forwarded > 0 || summary.failed_channels > 0;
        if level_info {
            info!(
                fetched = summary.fetched,
                forwarded = summary.forwarded,
                rejected = summary.rejected,
                skipped = summary.skipped,
                failed_channels = summary.failed_channels,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Poll cycle complete"
            );
        } else {
            debug!(
                fetched = summary.fetched,
                rejected = summary.rejected,
                skipped = summary.skipped,
                "Poll cycle complete"
            );
        }
        summary
    }

    async fn poll_channel(&self, channel: &ChannelContext) -> CycleSummary {
        let source = channel.source();
        let mut summary = CycleSummary::default();

        if !self.is_initialised(source) {
            match self.settings.start_from {
                StartPoint::Latest => {
                    return match self.baseline(channel).await {
                        Ok(()) | Err(SourceError::Cancelled) => summary,
                        Err(e) => {
                            self.log_fetch_error(channel, &e);
                            summary.failed_channels = 1;
                            summary
                        }
                    };
                }
                StartPoint::Beginning => self.set_position(source, None),
            }
        }

        let after = self.position(source).unwrap_or(MessageId(0));
        let messages = match self.fetch_channel(channel, after).await {
            Ok(messages) => messages,
            Err(SourceError::Cancelled) => {
                debug!(channel = %source, "Fetch interrupted by shutdown");
                return summary;
            }
            Err(e) => {
                self.log_fetch_error(channel, &e);
                summary.failed_channels = 1;
                return summary;
            }
        };
        summary.fetched = messages.len();

        for message in messages {
            if self.shutdown.is_cancelled() {
                break;
            }
            let id = message.id;

            if message.pinned || message.system {
                debug!(channel = %source, message_id = %id, "Skipping pinned or system message");
                summary.skipped += 1;
                self.set_position(source, Some(id));
                continue;
            }

            if let FilterDecision::Reject(_) = channel.filter.evaluate(&message) {
                summary.rejected += 1;
                self.set_position(source, Some(id));
                continue;
            }

            let units = match channel.formatter.format(&message) {
                Ok(units) => units,
                Err(e) => {
                    warn!(channel = %source, message_id = %id, error = %e, "Skipping message that failed to format");
                    summary.skipped += 1;
                    self.set_position(source, Some(id));
                    continue;
                }
            };

            match self
                .dispatcher
                .deliver(source, channel.destination(), id, &units)
                .await
            {
                Ok(()) => {
                    summary.forwarded += 1;
                    self.set_position(source, Some(id));
                }
                Err(DeliveryError::Permanent { unit, total, reason }) => {
                    error!(
                        channel = %source,
                        chat = %channel.destination(),
                        message_id = %id,
                        unit,
                        total,
                        reason = %reason,
                        "Abandoning message after permanent delivery failure"
                    );
                    summary.skipped += 1;
                    self.set_position(source, Some(id));
                }
                Err(DeliveryError::State(e)) => {
                    // Delivered, but the cursor did not persist.
                    error!(channel = %source, message_id = %id, error = %e, "Failed to persist cursor");
                    summary.forwarded += 1;
                    self.set_position(source, Some(id));
                }
                Err(e @ DeliveryError::RetriesExhausted { .. }) => {
                    warn!(
                        channel = %source,
                        message_id = %id,
                        error = %e,
                        "Halting channel batch; message will be retried next cycle"
                    );
                    summary.failed_channels = 1;
                    break;
                }
                Err(DeliveryError::Cancelled { delivered, total }) => {
                    info!(channel = %source, message_id = %id, delivered, total, "Delivery interrupted by shutdown");
                    break;
                }
            }
        }

        summary
    }

    /// Record the newest existing message as the starting position without
    /// forwarding anything.
    async fn baseline(&self, channel: &ChannelContext) -> Result<(), SourceError> {
        let request = FetchRequest {
            channel: channel.source(),
            guild_id: channel.mapping.guild_id.as_deref(),
            after: None,
            limit: 1,
        };
        let newest = self.fetch_page(&request).await?.into_iter().map(|m| m.id).max();
        self.set_position(channel.source(), newest);
        info!(
            channel = %channel.source(),
            baseline = ?newest.map(|id| id.to_string()),
            "Channel baselined; forwarding messages newer than this"
        );
        Ok(())
    }

    /// Fetch messages newer than `after`, paging until a short page, the
    /// message cap or the time budget. Returned in ascending id order.
    pub async fn fetch_channel(
        &self,
        channel: &ChannelContext,
        after: MessageId,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let started = Instant::now();
        let mut messages: Vec<RawMessage> = Vec::new();
        let mut cursor = after;

        while messages.len() < self.settings.max_messages {
            if started.elapsed() >= self.settings.max_fetch && !messages.is_empty() {
                debug!(channel = %channel.source(), "Fetch time budget exhausted");
                break;
            }
            let limit = self
                .settings
                .page_size
                .min(self.settings.max_messages - messages.len());
            let request = FetchRequest {
                channel: channel.source(),
                guild_id: channel.mapping.guild_id.as_deref(),
                after: Some(cursor),
                limit,
            };
            let mut page = self.fetch_page(&request).await?;
            page.retain(|m| m.id > cursor);
            page.sort_by_key(|m| m.id);

            let short = page.len() < limit;
            if let Some(last) = page.last() {
                cursor = last.id;
            }
            messages.extend(page);
            if short {
                break;
            }
        }

        messages.truncate(self.settings.max_messages);
        debug!(channel = %channel.source(), count = messages.len(), "Fetched messages");
        Ok(messages)
    }

    /// One page through the source limiter and proxy pool. Waiting for a
    /// permit and the request itself both give way to shutdown.
    async fn fetch_page(&self, request: &FetchRequest<'_>) -> Result<Vec<RawMessage>, SourceError> {
        let permit = tokio::select! {
            permit = self.source_service.limiter.acquire() => permit,
            _ = self.shutdown.cancelled() => return Err(SourceError::Cancelled),
        };
        let route = self.source_service.proxies.next_route();
        let result = tokio::select! {
            result = self.source.list_messages_since(request, &route) => result,
            _ = self.shutdown.cancelled() => Err(SourceError::Cancelled),
        };
        drop(permit);

        match result {
            Err(SourceError::Throttled { retry_after }) => {
                self.source_service.limiter.enter_cooldown(retry_after).await;
                Err(SourceError::Throttled { retry_after })
            }
            Err(SourceError::ProxyUnhealthy { proxy, reason }) => {
                self.source_service.proxies.mark_unhealthy(&proxy, &reason);
                Err(SourceError::ProxyUnhealthy { proxy, reason })
            }
            other => other,
        }
    }

    fn log_fetch_error(&self, channel: &ChannelContext, error: &SourceError) {
        let service = self.source.service();
        match error {
            SourceError::ChannelNotFound { .. } => error!(
                service,
                channel = %channel.source(),
                chat = %channel.destination(),
                "Source channel not found or not accessible"
            ),
            SourceError::Throttled { .. } => {
                warn!(service, channel = %channel.source(), error = %error, "Fetch throttled; retrying next cycle")
            }
            SourceError::Cancelled => {}
            _ => error!(service, channel = %channel.source(), error = %error, "Fetch failed; retrying next cycle"),
        }
    }
}
