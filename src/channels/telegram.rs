//! Telegram destination: sends text and media through the Bot API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::{ParseMode, TelegramConfig};
use crate::error::SendError;
use crate::net::DESTINATION_SERVICE;
use crate::net::http::{HttpClients, retry_after_header, retry_after_secs};
use crate::net::proxy::Route;
use crate::pipeline::types::{AttachmentKind, AttachmentSummary, Destination, TextBlock};

/// Telegram Bot API destination.
pub struct TelegramDestination {
    bot_token: SecretString,
    api_base: String,
    clients: HttpClients,
}

/// Bot identity returned by `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
    #[serde(default)]
    retry_after: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<f64>,
}

impl TelegramDestination {
    pub fn new(bot_token: SecretString, config: &TelegramConfig) -> Self {
        Self {
            bot_token,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            clients: HttpClients::new(Duration::from_secs(config.request_timeout_secs.max(1))),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token.expose_secret())
    }

    /// Verify the bot token. Fails on any non-ok answer.
    pub async fn get_me(&self, route: &Route) -> Result<BotIdentity, SendError> {
        let client = self.client(route)?;
        let resp = client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| transport_error(route, e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|e| transport_error(route, e))?;

        let parsed: Option<ApiResponse<BotIdentity>> = serde_json::from_str(&body).ok();
        match parsed {
            Some(ApiResponse {
                ok: true,
                result: Some(identity),
                ..
            }) if status.is_success() => Ok(identity),
            _ => Err(classify(status, &headers, &body).unwrap_or_else(|| SendError::Permanent {
                reason: "getMe returned no bot identity".into(),
            })),
        }
    }

    /// POST one Bot API call and classify the answer.
    async fn call(&self, method: &str, body: &serde_json::Value, route: &Route) -> Result<(), SendError> {
        let client = self.client(route)?;
        let resp = client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(route, e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.map_err(|e| transport_error(route, e))?;
        match classify(status, &headers, &text) {
            None => Ok(()),
            Some(error) => {
                tracing::debug!(method, status = %status, error = %error, "Telegram call failed");
                Err(error)
            }
        }
    }

    fn client(&self, route: &Route) -> Result<reqwest::Client, SendError> {
        self.clients.for_route(route).map_err(|e| SendError::ProxyUnhealthy {
            proxy: route.to_string(),
            reason: e.to_string(),
        })
    }

    /// Send media by URL with a caption.
    async fn send_media_by_url(
        &self,
        chat_id: &str,
        unit: &AttachmentSummary,
        route: &Route,
    ) -> Result<(), SendError> {
        let (method, field) = match unit.kind {
            AttachmentKind::Image => ("sendPhoto", "photo"),
            AttachmentKind::Video => ("sendVideo", "video"),
            _ => ("sendAudio", "audio"),
        };
        let mut body = serde_json::json!({ "chat_id": chat_id });
        body[field] = serde_json::Value::String(unit.url.clone());
        if !unit.caption.is_empty() {
            body["caption"] = serde_json::Value::String(unit.caption.clone());
            if let Some(mode) = unit.parse_mode.api_value() {
                body["parse_mode"] = serde_json::Value::String(mode.into());
            }
        }
        self.call(method, &body, route).await
    }
}

#[async_trait]
impl Destination for TelegramDestination {
    fn service(&self) -> &str {
        DESTINATION_SERVICE
    }

    async fn send_text(&self, chat: &str, block: &TextBlock, route: &Route) -> Result<(), SendError> {
        let body = message_body(chat, &block.text, block.parse_mode, block.disable_preview);
        self.call("sendMessage", &body, route).await
    }

    async fn send_attachment(
        &self,
        chat: &str,
        unit: &AttachmentSummary,
        route: &Route,
    ) -> Result<(), SendError> {
        if unit.kind.is_media() {
            match self.send_media_by_url(chat, unit, route).await {
                Err(SendError::Permanent { reason }) => {
                    tracing::warn!(
                        chat = %chat,
                        kind = unit.kind.label(),
                        reason = %reason,
                        "Telegram refused media; sending as link"
                    );
                }
                other => return other,
            }
        }
        let body = message_body(chat, &unit.text, unit.parse_mode, false);
        self.call("sendMessage", &body, route).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn message_body(chat_id: &str, text: &str, mode: ParseMode, disable_preview: bool) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": chat_id,
        "text": text,
        "disable_web_page_preview": disable_preview,
    });
    if let Some(mode) = mode.api_value() {
        body["parse_mode"] = serde_json::Value::String(mode.into());
    }
    body
}

/// Map a Bot API answer to a send error. `None` means success.
fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> Option<SendError> {
    let parsed: Option<ApiResponse<serde_json::Value>> = serde_json::from_str(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = parsed
            .as_ref()
            .and_then(|r| r.parameters.as_ref().and_then(|p| p.retry_after).or(r.retry_after))
            .and_then(retry_after_secs)
            .or_else(|| retry_after_header(headers));
        return Some(SendError::Throttled { retry_after });
    }
    if status.is_server_error() {
        return Some(SendError::Transient {
            reason: format!("HTTP {status}: {description}"),
        });
    }
    if !status.is_success() {
        return Some(SendError::Permanent {
            reason: format!("HTTP {status}: {description}"),
        });
    }
    match parsed {
        Some(r) if r.ok => None,
        _ => Some(SendError::Permanent {
            reason: format!("Bot API returned not ok: {description}"),
        }),
    }
}

fn transport_error(route: &Route, error: reqwest::Error) -> SendError {
    match route.proxy() {
        Some(proxy) if error.is_connect() || error.is_timeout() => SendError::ProxyUnhealthy {
            proxy: proxy.url().to_string(),
            reason: error.to_string(),
        },
        _ => SendError::Transient {
            reason: error.to_string(),
        },
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> TelegramDestination {
        TelegramDestination::new(SecretString::from("fake-token"), &TelegramConfig::default())
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            destination().api_url("sendMessage"),
            "https://api.telegram.org/botfake-token/sendMessage"
        );
    }

    #[test]
    fn telegram_message_body_carries_mode_and_preview() {
        let body = message_body("-100", "<b>hi</b>", ParseMode::Html, true);
        assert_eq!(body["chat_id"], "-100");
        assert_eq!(body["parse_mode"], "HTML");
        assert_eq!(body["disable_web_page_preview"], true);

        let plain = message_body("-100", "hi", ParseMode::Text, false);
        assert!(plain.get("parse_mode").is_none());
    }

    #[test]
    fn telegram_classifies_success() {
        let ok = classify(StatusCode::OK, &HeaderMap::new(), r#"{"ok":true,"result":{}}"#);
        assert!(ok.is_none());
    }

    #[test]
    fn telegram_classifies_throttle_from_parameters() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":7}}"#;
        match classify(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body) {
            Some(SendError::Throttled { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn telegram_classifies_throttle_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        match classify(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down") {
            Some(SendError::Throttled { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn telegram_classifies_server_error_as_transient() {
        let err = classify(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "bad gateway");
        assert!(matches!(err, Some(SendError::Transient { .. })));
    }

    #[test]
    fn telegram_classifies_client_error_as_permanent() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        match classify(StatusCode::BAD_REQUEST, &HeaderMap::new(), body) {
            Some(SendError::Permanent { reason }) => assert!(reason.contains("chat not found")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn telegram_not_ok_body_is_permanent() {
        let err = classify(StatusCode::OK, &HeaderMap::new(), r#"{"ok":false}"#);
        assert!(matches!(err, Some(SendError::Permanent { .. })));
    }

    #[tokio::test]
    async fn telegram_unreachable_api_is_transient_on_direct_route() {
        let config = TelegramConfig {
            api_base: "http://127.0.0.1:9".into(),
            request_timeout_secs: 1,
            ..TelegramConfig::default()
        };
        let dest = TelegramDestination::new(SecretString::from("t"), &config);
        let block = TextBlock {
            text: "hi".into(),
            parse_mode: ParseMode::Text,
            disable_preview: true,
        };
        let err = dest.send_text("1", &block, &Route::Direct).await.unwrap_err();
        assert!(matches!(err, SendError::Transient { .. }));
    }
}
