//! Discord source: pages channel history over the REST API.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::{DiscordConfig, TokenType};
use crate::error::SourceError;
use crate::net::SOURCE_SERVICE;
use crate::net::http::{HttpClients, retry_after_header, retry_after_secs};
use crate::net::proxy::Route;
use crate::pipeline::types::{
    Attachment, AttachmentKind, Author, FetchRequest, MessageId, RawMessage, SourceFeed,
};

const USER_AGENT: &str = "DiscordBot (https://github.com, 1.0)";

/// Regular message types: 0 is a plain message, 19 a reply.
const REGULAR_MESSAGE_TYPES: [u8; 2] = [0, 19];

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?(\d+)>").expect("static regex"));
static ROLE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@&(\d+)>").expect("static regex"));
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#(\d+)>").expect("static regex"));
static CUSTOM_EMOJI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<a?:(\w+):\d+>").expect("static regex"));

/// Discord REST source.
pub struct DiscordSource {
    token: SecretString,
    token_type: TokenType,
    api_base: String,
    clients: HttpClients,
}

impl DiscordSource {
    pub fn new(token: SecretString, config: &DiscordConfig) -> Self {
        Self {
            token,
            token_type: config.token_type,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            clients: HttpClients::new(Duration::from_secs(config.request_timeout_secs.max(1))),
        }
    }

    fn messages_url(&self, channel: &str) -> String {
        format!("{}/channels/{channel}/messages", self.api_base)
    }

    fn authorization(&self) -> String {
        let token = self.token.expose_secret();
        match self.token_type {
            TokenType::Bot => format!("Bot {token}"),
            TokenType::Bearer => format!("Bearer {token}"),
            TokenType::User => token.to_string(),
        }
    }

    fn request_error(&self, channel: &str, route: &Route, error: reqwest::Error) -> SourceError {
        match route.proxy() {
            Some(proxy) if error.is_connect() || error.is_timeout() => SourceError::ProxyUnhealthy {
                proxy: proxy.url().to_string(),
                reason: error.to_string(),
            },
            _ => SourceError::Fetch {
                channel: channel.to_string(),
                reason: error.to_string(),
            },
        }
    }
}

#[async_trait]
impl SourceFeed for DiscordSource {
    fn service(&self) -> &str {
        SOURCE_SERVICE
    }

    async fn list_messages_since(
        &self,
        request: &FetchRequest<'_>,
        route: &Route,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let client = self.clients.for_route(route).map_err(|e| SourceError::ProxyUnhealthy {
            proxy: route.to_string(),
            reason: e.to_string(),
        })?;

        let mut query = vec![("limit", request.limit.clamp(1, 100).to_string())];
        if let Some(after) = request.after {
            query.push(("after", after.to_string()));
        }

        let resp = client
            .get(self.messages_url(request.channel))
            .header("Authorization", self.authorization())
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json")
            .query(&query)
            .send()
            .await
            .map_err(|e| self.request_error(request.channel, route, e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::ChannelNotFound {
                channel: request.channel.to_string(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_hint = retry_after_header(resp.headers());
            let body: Option<RateLimitBody> = resp.json().await.ok();
            let retry_after = body
                .and_then(|b| b.retry_after)
                .and_then(retry_after_secs)
                .or(header_hint);
            return Err(SourceError::Throttled { retry_after });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Fetch {
                channel: request.channel.to_string(),
                reason: format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            });
        }

        let payloads: Vec<MessagePayload> = resp
            .json()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

        let mut messages: Vec<RawMessage> = payloads
            .into_iter()
            .filter_map(|p| into_raw_message(p, request.channel, request.guild_id))
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }
}

// ── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    id: String,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default)]
    author: UserPayload,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    embeds: Vec<EmbedPayload>,
    #[serde(default)]
    mentions: Vec<UserPayload>,
    #[serde(default)]
    mention_channels: Vec<ChannelMentionPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct UserPayload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

impl UserPayload {
    fn display(&self) -> Option<&str> {
        self.global_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(Some(self.username.as_str()).filter(|n| !n.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct ChannelMentionPayload {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    url: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedPayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image: Option<EmbedMedia>,
    #[serde(default)]
    thumbnail: Option<EmbedMedia>,
    #[serde(default)]
    video: Option<EmbedMedia>,
}

#[derive(Debug, Deserialize)]
struct EmbedMedia {
    #[serde(default)]
    url: Option<String>,
}

fn into_raw_message(payload: MessagePayload, channel: &str, guild_id: Option<&str>) -> Option<RawMessage> {
    let id: MessageId = match payload.id.parse() {
        Ok(id) => id,
        Err(_) => {
            tracing::warn!(channel = %channel, id = %payload.id, "Skipping message with malformed id");
            return None;
        }
    };
    let channel_id = payload
        .channel_id
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| channel.to_string());

    let content = clean_content(payload.content.as_deref().unwrap_or(""), &payload);

    let mut attachments: Vec<Attachment> = payload
        .attachments
        .into_iter()
        .filter(|a| !a.url.trim().is_empty())
        .map(|a| Attachment {
            kind: AttachmentKind::infer(a.content_type.as_deref(), a.filename.as_deref()),
            url: a.url,
            title: a.filename,
            description: a.description,
            size: a.size,
        })
        .collect();
    attachments.extend(payload.embeds.into_iter().filter_map(embed_attachment));

    let origin_url = Some(format!(
        "https://discord.com/channels/{}/{channel_id}/{id}",
        guild_id.unwrap_or("@me")
    ));

    Some(RawMessage {
        id,
        author: Author {
            display_name: payload
                .author
                .global_name
                .clone()
                .filter(|n| !n.trim().is_empty()),
            id: payload.author.id,
            username: payload.author.username,
        },
        channel_id,
        content,
        attachments,
        created_at: payload.timestamp.unwrap_or_else(Utc::now),
        origin_url,
        pinned: payload.pinned,
        system: !REGULAR_MESSAGE_TYPES.contains(&payload.kind),
    })
}

fn embed_attachment(embed: EmbedPayload) -> Option<Attachment> {
    let url = [
        embed.url,
        embed.image.and_then(|m| m.url),
        embed.video.and_then(|m| m.url),
        embed.thumbnail.and_then(|m| m.url),
    ]
    .into_iter()
    .flatten()
    .find(|u| !u.trim().is_empty())?;

    Some(Attachment {
        url,
        kind: AttachmentKind::Embed,
        title: embed.title.filter(|t| !t.trim().is_empty()),
        description: embed.description.filter(|d| !d.trim().is_empty()),
        size: None,
    })
}

/// Resolve mentions and custom emoji, decode entities, and trim lines.
fn clean_content(content: &str, payload: &MessagePayload) -> String {
    let users: HashMap<&str, &str> = payload
        .mentions
        .iter()
        .filter_map(|u| u.display().map(|name| (u.id.as_str(), name)))
        .collect();
    let channels: HashMap<&str, &str> = payload
        .mention_channels
        .iter()
        .filter(|c| !c.name.is_empty())
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect();

    let text = USER_MENTION.replace_all(content, |caps: &Captures| {
        format!("@{}", users.get(&caps[1]).copied().unwrap_or("user"))
    });
    let text = ROLE_MENTION.replace_all(&text, "@role-$1");
    let text = CHANNEL_MENTION.replace_all(&text, |caps: &Captures| match channels.get(&caps[1]) {
        Some(name) => format!("#{name}"),
        None => format!("#channel-{}", &caps[1]),
    });
    let text = CUSTOM_EMOJI.replace_all(&text, ":$1:");
    let text = html_escape::decode_html_entities(&text);

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    lines.join("\n").trim_end().to_string()
}
