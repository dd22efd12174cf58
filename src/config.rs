//! Configuration types.
//!
//! Loaded once at startup from a YAML file, with secrets and paths
//! overridable from the environment. Per-channel overrides are merged over
//! the defaults by [`merge_filters`] and [`merge_text`]: every override field
//! that is present replaces the default field wholesale.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::pipeline::types::MessageType;

/// Default config file looked up when nothing else is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub discord: DiscordConfig,
    pub runtime: RuntimeConfig,
    pub defaults: ChannelDefaults,
    pub channels: Vec<ChannelMapping>,
    pub rate_limits: RateLimits,
    pub proxies: ProxyConfig,
}

/// Destination (Telegram Bot API) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub token: Option<SecretString>,
    pub api_base: String,
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// How the Discord token is presented in the `Authorization` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Bot,
    User,
    Bearer,
}

/// Source (Discord REST API) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub token: Option<SecretString>,
    pub token_type: TokenType,
    pub api_base: String,
    pub request_timeout_secs: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_type: TokenType::Bot,
            api_base: "https://discord.com/api/v10".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Where polling starts for a channel that has no persisted cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPoint {
    /// Record the newest message as a baseline and forward only what follows.
    #[default]
    Latest,
    /// Forward the channel history from the oldest message on.
    Beginning,
}

/// Poll loop and pacing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub poll_interval_secs: u64,
    pub state_file: PathBuf,
    /// Lower bound of the random pause between two units of one message.
    pub min_delay_ms: u64,
    /// Upper bound of the random pause between two units of one message.
    pub max_delay_ms: u64,
    pub max_messages_per_channel: usize,
    pub max_fetch_seconds: u64,
    pub start_from: StartPoint,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            state_file: PathBuf::from("monitor_state.json"),
            min_delay_ms: 500,
            max_delay_ms: 2000,
            max_messages_per_channel: 200,
            max_fetch_seconds: 20,
            start_from: StartPoint::Latest,
        }
    }
}

/// Defaults applied to every channel before its overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    pub filters: FilterConfig,
    pub text: TextConfig,
}

/// Effective filter set for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Keywords of which at least one must appear.
    pub whitelist: Vec<String>,
    /// Keywords that reject a message when any appears.
    pub blacklist: Vec<String>,
    pub allowed_senders: Vec<String>,
    pub blocked_senders: Vec<String>,
    pub allowed_types: Vec<MessageType>,
    pub blocked_types: Vec<MessageType>,
}

/// Per-channel filter overrides. `Some` replaces the default field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterOverrides {
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
    pub allowed_senders: Option<Vec<String>>,
    pub blocked_senders: Option<Vec<String>>,
    pub allowed_types: Option<Vec<MessageType>>,
    pub blocked_types: Option<Vec<MessageType>>,
}

/// Destination parse mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    #[default]
    #[serde(alias = "HTML")]
    Html,
    #[serde(alias = "MarkdownV2", alias = "markdownv2")]
    MarkdownV2,
    #[serde(alias = "plain", alias = "none")]
    Text,
}

impl ParseMode {
    /// Value for the Bot API `parse_mode` field, `None` for plain text.
    pub fn api_value(self) -> Option<&'static str> {
        match self {
            Self::Html => Some("HTML"),
            Self::MarkdownV2 => Some("MarkdownV2"),
            Self::Text => None,
        }
    }
}

/// How attachment captions are laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStyle {
    /// Title, kind and size on a single line.
    #[default]
    Compact,
    /// Title only.
    Minimal,
    /// Title, kind and size each on their own line.
    OnePerLine,
}

/// A literal find/replace rule. An empty `replace` deletes the match.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplacementRule {
    #[serde(alias = "from", alias = "search")]
    pub find: String,
    #[serde(default, alias = "to")]
    pub replace: String,
}

/// Text decoration and formatting profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    /// Chip tokens, joined into one line. `{channel}` and `{author}` expand.
    pub chips: Vec<String>,
    pub headers: Vec<String>,
    pub footers: Vec<String>,
    pub replacements: Vec<ReplacementRule>,
    pub parse_mode: ParseMode,
    pub max_length: usize,
    pub ellipsis: String,
    pub attachment_style: AttachmentStyle,
    pub disable_preview: bool,
    pub source_link_label: String,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            chips: Vec::new(),
            headers: Vec::new(),
            footers: Vec::new(),
            replacements: Vec::new(),
            parse_mode: ParseMode::Html,
            max_length: 4000,
            ellipsis: "…".to_string(),
            attachment_style: AttachmentStyle::Compact,
            disable_preview: true,
            source_link_label: "Open in Discord".to_string(),
        }
    }
}

/// Per-channel text overrides. `Some` replaces the default field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TextOverrides {
    pub chips: Option<Vec<String>>,
    pub headers: Option<Vec<String>>,
    pub footers: Option<Vec<String>>,
    pub replacements: Option<Vec<ReplacementRule>>,
    pub parse_mode: Option<ParseMode>,
    pub max_length: Option<usize>,
    pub ellipsis: Option<String>,
    pub attachment_style: Option<AttachmentStyle>,
    pub disable_preview: Option<bool>,
    pub source_link_label: Option<String>,
}

/// Source channel → destination chat relationship.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelMapping {
    /// Source channel identifier.
    #[serde(alias = "discord", alias = "discord_channel_id", deserialize_with = "deserialize_id")]
    pub source: String,
    /// Destination chat identifier.
    #[serde(alias = "telegram", alias = "telegram_chat_id", deserialize_with = "deserialize_id")]
    pub destination: String,
    #[serde(default, alias = "display_name")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub filters: FilterOverrides,
    #[serde(default)]
    pub text: TextOverrides,
}

impl ChannelMapping {
    /// Label used in chips and logs.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.source)
    }
}

/// Per-service throughput budget. Unset fields impose no cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_second: Option<u32>,
    pub per_minute: Option<u32>,
    pub concurrency: Option<usize>,
    pub jitter_min_ms: Option<u64>,
    pub jitter_max_ms: Option<u64>,
    pub cooldown_seconds: Option<u64>,
}

/// Rate limits keyed by target service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub discord: RateLimitConfig,
    pub telegram: RateLimitConfig,
}

/// One egress proxy. Accepts either a bare URL or a full mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProxyEndpointConfig {
    Url(String),
    Full {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default, deserialize_with = "deserialize_secret")]
        password: Option<SecretString>,
    },
}

impl ProxyEndpointConfig {
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) | Self::Full { url, .. } => url,
        }
    }
}

/// Health-check parameters shared by all proxy pools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe URL fetched through the proxy. `None` treats every probe as passing.
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub cooldown_secs: u64,
    pub interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 5,
            cooldown_secs: 60,
            interval_secs: 15,
        }
    }
}

/// Proxy pools keyed by target service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub healthcheck: HealthCheckConfig,
    pub discord: Vec<ProxyEndpointConfig>,
    pub telegram: Vec<ProxyEndpointConfig>,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file. Relative `state_file` paths resolve against the
    /// file's directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&raw)?;
        if config.runtime.state_file.is_relative() {
            if let Some(parent) = path.parent() {
                config.runtime.state_file = parent.join(&config.runtime.state_file);
            }
        }
        Ok(config)
    }

    /// Parse a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Override secrets and paths from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.token = Some(SecretString::from(token.trim().to_string()));
            }
        }
        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            if !token.trim().is_empty() {
                self.discord.token = Some(SecretString::from(token.trim().to_string()));
            }
        }
        if let Ok(path) = std::env::var("FORWARD_MONITOR_STATE_FILE") {
            if !path.trim().is_empty() {
                self.runtime.state_file = PathBuf::from(path.trim());
            }
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        use secrecy::ExposeSecret;

        let token_present =
            |t: &Option<SecretString>| t.as_ref().is_some_and(|s| !s.expose_secret().trim().is_empty());
        if !token_present(&self.telegram.token) {
            return Err(ConfigError::MissingRequired {
                key: "telegram.token".into(),
                hint: "Set it in the config file or TELEGRAM_BOT_TOKEN.".into(),
            });
        }
        if !token_present(&self.discord.token) {
            return Err(ConfigError::MissingRequired {
                key: "discord.token".into(),
                hint: "Set it in the config file or DISCORD_TOKEN.".into(),
            });
        }
        if self.channels.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "channels".into(),
                hint: "Add at least one source → destination mapping.".into(),
            });
        }

        let mut seen = HashSet::new();
        for (index, channel) in self.channels.iter().enumerate() {
            if channel.source.trim().is_empty() || channel.destination.trim().is_empty() {
                return Err(invalid(
                    format!("channels[{index}]"),
                    "source and destination must not be empty",
                ));
            }
            if !seen.insert(channel.source.as_str()) {
                return Err(invalid(
                    format!("channels[{index}].source"),
                    format!("duplicate source channel {}", channel.source),
                ));
            }
            if merge_text(&self.defaults.text, &channel.text).max_length == 0 {
                return Err(invalid(format!("channels[{index}].text.max_length"), "must be positive"));
            }
        }

        if self.defaults.text.max_length == 0 {
            return Err(invalid("defaults.text.max_length", "must be positive"));
        }
        if self.runtime.min_delay_ms > self.runtime.max_delay_ms {
            return Err(invalid(
                "runtime.max_delay_ms",
                "must be greater than or equal to runtime.min_delay_ms",
            ));
        }
        if self.runtime.max_messages_per_channel == 0 {
            return Err(invalid("runtime.max_messages_per_channel", "must be positive"));
        }

        for (service, limits) in [("discord", &self.rate_limits.discord), ("telegram", &self.rate_limits.telegram)] {
            limits.validate(service)?;
        }
        Ok(())
    }

    /// Proxy endpoints configured for a target service.
    pub fn proxies_for(&self, service: &str) -> &[ProxyEndpointConfig] {
        match service {
            "discord" => &self.proxies.discord,
            "telegram" => &self.proxies.telegram,
            _ => &[],
        }
    }
}

impl RateLimitConfig {
    fn validate(&self, service: &str) -> Result<(), ConfigError> {
        if self.per_second == Some(0) {
            return Err(invalid(format!("rate_limits.{service}.per_second"), "must be positive"));
        }
        if self.per_minute == Some(0) {
            return Err(invalid(format!("rate_limits.{service}.per_minute"), "must be positive"));
        }
        if self.concurrency == Some(0) {
            return Err(invalid(format!("rate_limits.{service}.concurrency"), "must be positive"));
        }
        if let (Some(min), Some(max)) = (self.jitter_min_ms, self.jitter_max_ms) {
            if min > max {
                return Err(invalid(
                    format!("rate_limits.{service}.jitter_max_ms"),
                    "must be greater than or equal to jitter_min_ms",
                ));
            }
        }
        Ok(())
    }
}

/// Merge channel filter overrides over the defaults.
///
/// Each present override field replaces the corresponding default field as a
/// whole; lists are never combined element-wise.
pub fn merge_filters(defaults: &FilterConfig, overrides: &FilterOverrides) -> FilterConfig {
    FilterConfig {
        whitelist: pick(&overrides.whitelist, &defaults.whitelist),
        blacklist: pick(&overrides.blacklist, &defaults.blacklist),
        allowed_senders: pick(&overrides.allowed_senders, &defaults.allowed_senders),
        blocked_senders: pick(&overrides.blocked_senders, &defaults.blocked_senders),
        allowed_types: pick(&overrides.allowed_types, &defaults.allowed_types),
        blocked_types: pick(&overrides.blocked_types, &defaults.blocked_types),
    }
}

/// Merge channel text overrides over the defaults, field by field.
pub fn merge_text(defaults: &TextConfig, overrides: &TextOverrides) -> TextConfig {
    TextConfig {
        chips: pick(&overrides.chips, &defaults.chips),
        headers: pick(&overrides.headers, &defaults.headers),
        footers: pick(&overrides.footers, &defaults.footers),
        replacements: pick(&overrides.replacements, &defaults.replacements),
        parse_mode: overrides.parse_mode.unwrap_or(defaults.parse_mode),
        max_length: overrides.max_length.unwrap_or(defaults.max_length),
        ellipsis: pick(&overrides.ellipsis, &defaults.ellipsis),
        attachment_style: overrides.attachment_style.unwrap_or(defaults.attachment_style),
        disable_preview: overrides.disable_preview.unwrap_or(defaults.disable_preview),
        source_link_label: pick(&overrides.source_link_label, &defaults.source_link_label),
    }
}

fn pick<T: Clone>(value: &Option<T>, fallback: &T) -> T {
    value.as_ref().unwrap_or(fallback).clone()
}

fn invalid(key: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

/// Channel and chat ids may be written as YAML integers or strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Str(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s.trim().to_string(),
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(RawId::into_string)
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<RawId> = Option::deserialize(deserializer)?;
    Ok(raw.map(RawId::into_string).filter(|s| !s.is_empty()))
}
