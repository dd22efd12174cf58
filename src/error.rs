//! Error types for the forwarder.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Formatting error: {0}")]
    Format(#[from] FormatError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted cursor state errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while fetching from the source feed.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Channel {channel} not found or not accessible")]
    ChannelNotFound { channel: String },

    #[error("Source rate limited, retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    #[error("Fetch failed for channel {channel}: {reason}")]
    Fetch { channel: String, reason: String },

    #[error("Invalid response from source: {0}")]
    InvalidResponse(String),

    #[error("Proxy {proxy} unusable: {reason}")]
    ProxyUnhealthy { proxy: String, reason: String },

    #[error("Fetch cancelled by shutdown")]
    Cancelled,
}

/// Outcome of a single send attempt against the destination.
///
/// The dispatcher decides retry policy from the variant.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("transient failure: {reason}")]
    Transient { reason: String },

    #[error("throttled by destination, retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    #[error("permanently rejected: {reason}")]
    Permanent { reason: String },

    #[error("proxy {proxy} unusable: {reason}")]
    ProxyUnhealthy { proxy: String, reason: String },
}

/// Failure of a whole delivery sequence for one message.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Unit {unit} of {total} permanently rejected: {reason}")]
    Permanent {
        unit: usize,
        total: usize,
        reason: String,
    },

    #[error("Unit {unit} of {total} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        unit: usize,
        total: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Delivery cancelled by shutdown after {delivered} of {total} units")]
    Cancelled { delivered: usize, total: usize },

    #[error("Cursor update failed: {0}")]
    State(#[from] StateError),
}

/// Proxy pool / health check errors.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid proxy endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Health check for {endpoint} failed: {reason}")]
    HealthCheckFailed { endpoint: String, reason: String },
}

/// Formatting errors. A message that fails to format is skipped.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Message {id} produced no deliverable content")]
    Empty { id: String },

    #[error("Length limit {limit} too small to hold markup for message {id}")]
    LimitTooSmall { id: String, limit: usize },
}
