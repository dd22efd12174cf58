//! Shared types for the delivery pipeline.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ParseMode;
use crate::error::{SendError, SourceError};
use crate::net::proxy::Route;

// ── Identifiers ─────────────────────────────────────────────────────

/// Source message identifier. Snowflake ids sort by creation time, so the
/// numeric order is the delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ── Raw message ─────────────────────────────────────────────────────

/// What an attachment or embed descriptor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
    Embed,
    Other,
}

impl AttachmentKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Embed => "embed",
            Self::Other => "attachment",
        }
    }

    /// Infer the kind of a file from its MIME type, falling back to the
    /// filename extension.
    pub fn infer(content_type: Option<&str>, filename: Option<&str>) -> Self {
        if let Some(ct) = content_type.map(|c| c.trim().to_ascii_lowercase()) {
            if ct.starts_with("image/") {
                return Self::Image;
            }
            if ct.starts_with("video/") {
                return Self::Video;
            }
            if ct.starts_with("audio/") {
                return Self::Audio;
            }
            if ct == "application/pdf" || ct.starts_with("text/plain") {
                return Self::File;
            }
        }

        let extension = filename
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => Self::Image,
            "mp4" | "mov" | "mkv" | "webm" => Self::Video,
            "mp3" | "wav" | "ogg" | "flac" | "m4a" => Self::Audio,
            "pdf" | "txt" | "doc" | "docx" | "xls" | "xlsx" | "csv" | "zip" => Self::File,
            _ => Self::Other,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio)
    }
}

/// One attachment or embed of a source message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
    /// Filename for files, title for embeds.
    pub title: Option<String>,
    /// Embed description, if any.
    pub description: Option<String>,
    pub size: Option<u64>,
}

/// Message author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
}

impl Author {
    /// Name shown in chips.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }

    /// Lowercased identities matched by sender filters.
    pub fn identities(&self) -> Vec<String> {
        let mut ids = vec![self.id.to_lowercase(), self.username.to_lowercase()];
        if let Some(ref name) = self.display_name {
            ids.push(name.to_lowercase());
        }
        ids.retain(|s| !s.is_empty());
        ids
    }
}

/// A message fetched from the source feed. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub channel_id: String,
    pub author: Author,
    /// Body text after mention cleanup, still in source markup.
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    /// Link back to the message on the source platform.
    pub origin_url: Option<String>,
    pub pinned: bool,
    /// Join notices, pin notices and other platform-generated messages.
    pub system: bool,
}

// ── Message classification ──────────────────────────────────────────

/// Shape-derived message type used by type filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Attachment,
    Image,
    Video,
    Audio,
    #[serde(alias = "document")]
    File,
    Embed,
    Other,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Attachment => "attachment",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Embed => "embed",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RawMessage {
    /// Every type this message carries, in stable order.
    ///
    /// No kind takes precedence over another: a text post with an image and
    /// an embed is `text`, `attachment`, `image` and `embed` at once.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut types = Vec::new();
        if !self.content.trim().is_empty() {
            types.push(MessageType::Text);
        }
        for attachment in &self.attachments {
            let specific = match attachment.kind {
                AttachmentKind::Image => MessageType::Image,
                AttachmentKind::Video => MessageType::Video,
                AttachmentKind::Audio => MessageType::Audio,
                AttachmentKind::File => MessageType::File,
                AttachmentKind::Other => MessageType::Other,
                AttachmentKind::Embed => {
                    types.push(MessageType::Embed);
                    continue;
                }
            };
            types.push(MessageType::Attachment);
            types.push(specific);
        }
        types.sort();
        types.dedup();
        types
    }

    /// Lowercased text searched by keyword filters: body, titles and
    /// descriptions of attachments and embeds.
    pub fn searchable_text(&self) -> String {
        let mut parts = vec![self.content.as_str()];
        for attachment in &self.attachments {
            if let Some(ref title) = attachment.title {
                parts.push(title);
            }
            if let Some(ref description) = attachment.description {
                parts.push(description);
            }
        }
        parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

// ── Deliverable units ───────────────────────────────────────────────

/// A block of destination markup within the length bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub text: String,
    pub parse_mode: ParseMode,
    pub disable_preview: bool,
}

/// A link to one attachment plus a short caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSummary {
    pub kind: AttachmentKind,
    pub url: String,
    /// Caption in destination markup, without the link.
    pub caption: String,
    /// Caption and link in destination markup, for sending as plain text.
    pub text: String,
    pub parse_mode: ParseMode,
}

/// One atomically sent piece of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverableUnit {
    Text(TextBlock),
    Attachment(AttachmentSummary),
}

impl DeliverableUnit {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Attachment(_) => "attachment",
        }
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Parameters of one page request against the source feed.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub channel: &'a str,
    pub guild_id: Option<&'a str>,
    /// Only messages strictly newer than this id.
    pub after: Option<MessageId>,
    pub limit: usize,
}

/// Source feed capability: list messages newer than a cursor.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Service name used for rate limit and proxy pool lookups.
    fn service(&self) -> &str;

    /// Fetch one page of messages in ascending id order.
    async fn list_messages_since(
        &self,
        request: &FetchRequest<'_>,
        route: &Route,
    ) -> Result<Vec<RawMessage>, SourceError>;
}

/// Destination capability: send formatted units.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Service name used for rate limit and proxy pool lookups.
    fn service(&self) -> &str;

    async fn send_text(&self, chat: &str, block: &TextBlock, route: &Route) -> Result<(), SendError>;

    async fn send_attachment(
        &self,
        chat: &str,
        unit: &AttachmentSummary,
        route: &Route,
    ) -> Result<(), SendError>;
}
