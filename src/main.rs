use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use forward_monitor::channels::{DiscordSource, TelegramDestination};
use forward_monitor::config::{Config, DEFAULT_CONFIG_PATH};
use forward_monitor::net::proxy::{self, HealthProbe, HttpProbe};
use forward_monitor::net::{DESTINATION_SERVICE, SOURCE_SERVICE, ServiceContext};
use forward_monitor::pipeline::dispatcher::{DispatchSettings, Dispatcher};
use forward_monitor::pipeline::poller::{ChannelContext, PollSettings, Poller};
use forward_monitor::state::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = std::env::var("FORWARD_MONITOR_CONFIG")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    eprintln!("📡 Forward Monitor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Channels: {}", config.channels.len());
    eprintln!("   State: {}", config.runtime.state_file.display());

    let telegram_token = config
        .telegram
        .token
        .clone()
        .context("telegram.token is not set")?;
    let discord_token = config
        .discord
        .token
        .clone()
        .context("discord.token is not set")?;

    // ── Services ────────────────────────────────────────────────────────
    let source_service = ServiceContext::from_config(SOURCE_SERVICE, &config);
    let destination_service = ServiceContext::from_config(DESTINATION_SERVICE, &config);

    let probe: Arc<dyn HealthProbe> = Arc::new(HttpProbe::new(&config.proxies.healthcheck));
    proxy::verify_pool(&source_service.proxies, probe.as_ref()).await;
    proxy::verify_pool(&destination_service.proxies, probe.as_ref()).await;

    let destination = Arc::new(TelegramDestination::new(telegram_token, &config.telegram));
    let bot = destination
        .get_me(&destination_service.proxies.next_route())
        .await
        .context("Telegram credential check (getMe) failed")?;
    tracing::info!(bot_id = bot.id, bot = ?bot.username, "Telegram bot authenticated");

    let source = Arc::new(DiscordSource::new(discord_token, &config.discord));

    // ── State ───────────────────────────────────────────────────────────
    let state = Arc::new(
        StateStore::load(config.runtime.state_file.clone())
            .await
            .context("loading cursor state")?,
    );

    // ── Pipeline ────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();

    let health_handle = proxy::spawn_health_checks(
        vec![
            Arc::clone(&source_service.proxies),
            Arc::clone(&destination_service.proxies),
        ],
        probe,
        Duration::from_secs(config.proxies.healthcheck.interval_secs),
        shutdown.clone(),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        destination,
        destination_service,
        Arc::clone(&state),
        DispatchSettings::from_runtime(&config.runtime),
        shutdown.clone(),
    ));

    let channels = config
        .channels
        .iter()
        .map(|mapping| ChannelContext::new(mapping, &config.defaults))
        .collect();

    let poller = Arc::new(Poller::new(
        source,
        source_service,
        dispatcher,
        state,
        channels,
        PollSettings::from_runtime(&config.runtime),
        shutdown.clone(),
    ));
    let poll_handle = poller.spawn();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    shutdown.cancel();

    let _ = poll_handle.await;
    let _ = health_handle.await;
    tracing::info!("Forward Monitor stopped");
    Ok(())
}
