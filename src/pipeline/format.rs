//! Formatter: raw message → ordered deliverable units.
//!
//! Output order is fixed: the text blocks of the body in split order, then
//! one attachment summary per attachment or embed in source order.

use crate::config::{AttachmentStyle, TextConfig};
use crate::error::FormatError;
use crate::pipeline::markup::{self, Node};
use crate::pipeline::types::{
    Attachment, AttachmentKind, AttachmentSummary, DeliverableUnit, RawMessage, TextBlock,
};

/// Separator between chip tokens on the chip line.
const CHIP_SEPARATOR: &str = " • ";

/// Caption budget for media sent with a caption.
const MAX_CAPTION_CHARS: usize = 1000;

/// Embed descriptions are cut to this many characters in captions.
const MAX_EMBED_DESCRIPTION_CHARS: usize = 200;

/// Formats messages of one channel mapping.
#[derive(Debug, Clone)]
pub struct Formatter {
    config: TextConfig,
    channel_label: String,
}

impl Formatter {
    /// `config` is the merged text configuration of the channel and
    /// `channel_label` fills the `{channel}` placeholder.
    pub fn new(config: TextConfig, channel_label: impl Into<String>) -> Self {
        Self {
            config,
            channel_label: channel_label.into(),
        }
    }

    pub fn config(&self) -> &TextConfig {
        &self.config
    }

    /// Format a message. Same message and configuration always yield the
    /// same units.
    pub fn format(&self, message: &RawMessage) -> Result<Vec<DeliverableUnit>, FormatError> {
        let cfg = &self.config;

        let mut body = markup::parse(&message.content);
        markup::apply_replacements(&mut body, &cfg.replacements);
        let has_body = !markup::plain_text(&body).trim().is_empty();

        if !has_body && message.attachments.is_empty() {
            return Err(FormatError::Empty {
                id: message.id.to_string(),
            });
        }

        let mut leading = Vec::new();
        for header in &cfg.headers {
            push_decoration(&mut leading, self.decoration(header, message));
        }
        let mut chips: Vec<String> = Vec::new();
        for chip in &cfg.chips {
            push_decoration(&mut chips, self.decoration(chip, message));
        }
        push_decoration(&mut leading, chips.join(CHIP_SEPARATOR));

        let mut trailing = Vec::new();
        for footer in &cfg.footers {
            push_decoration(&mut trailing, self.decoration(footer, message));
        }

        let mut lines: Vec<Vec<Node>> = leading.iter().map(|line| markup::parse(line)).collect();
        if has_body {
            lines.push(body);
        }
        lines.extend(trailing.iter().map(|line| markup::parse(line)));
        if let Some(ref url) = message.origin_url {
            lines.push(vec![self.origin_link(url)]);
        }

        let mut units = Vec::new();
        let atoms = markup::render(&join_lines(lines), cfg.parse_mode);
        let blocks = markup::split(&atoms, cfg.max_length, &cfg.ellipsis)
            .map_err(|e| e.into_format_error(message.id.to_string()))?;
        units.extend(blocks.into_iter().map(|text| {
            DeliverableUnit::Text(TextBlock {
                text,
                parse_mode: cfg.parse_mode,
                disable_preview: cfg.disable_preview,
            })
        }));

        units.extend(
            message
                .attachments
                .iter()
                .enumerate()
                .map(|(index, attachment)| DeliverableUnit::Attachment(self.summarize(attachment, index))),
        );

        Ok(units)
    }

    /// Expand placeholders, apply replacements and trim a decorative line.
    fn decoration(&self, template: &str, message: &RawMessage) -> String {
        let expanded = template
            .replace("{channel}", &self.channel_label)
            .replace("{author}", message.author.name());
        markup::replace_all(&expanded, &self.config.replacements)
            .trim()
            .to_string()
    }

    fn origin_link(&self, url: &str) -> Node {
        let label = self.config.source_link_label.trim();
        let label = if label.is_empty() { url } else { label };
        Node::Link {
            label: vec![Node::Text(label.to_string())],
            url: url.to_string(),
        }
    }

    fn summarize(&self, attachment: &Attachment, index: usize) -> AttachmentSummary {
        let mode = self.config.parse_mode;
        let caption = truncate(&self.caption(attachment, index), MAX_CAPTION_CHARS);
        let caption = markup::escape(&caption, mode);
        let text = format!("{caption}\n{}", markup::escape(&attachment.url, mode));
        AttachmentSummary {
            kind: attachment.kind,
            url: attachment.url.clone(),
            caption,
            text,
            parse_mode: mode,
        }
    }

    /// Plain-text caption laid out per the configured style.
    fn caption(&self, attachment: &Attachment, index: usize) -> String {
        let rules = &self.config.replacements;
        let title = attachment
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| fallback_title(&attachment.url, index));
        let title = markup::replace_all(&title, rules);
        let icon = icon(attachment.kind);
        let size = attachment.size.map(human_size);

        let mut caption = match self.config.attachment_style {
            AttachmentStyle::Minimal => return title,
            AttachmentStyle::Compact => {
                let mut parts = vec![format!("{icon} {title}"), attachment.kind.label().to_string()];
                parts.extend(size);
                parts.join(" · ")
            }
            AttachmentStyle::OnePerLine => {
                let mut parts = vec![format!("{icon} {title}"), attachment.kind.label().to_string()];
                parts.extend(size);
                parts.join("\n")
            }
        };

        if let Some(description) = attachment.description.as_deref() {
            let description = markup::replace_all(description.trim(), rules);
            if !description.is_empty() {
                caption.push('\n');
                caption.push_str(&truncate(&description, MAX_EMBED_DESCRIPTION_CHARS));
            }
        }
        caption
    }
}

/// Keep a decorative line unless it is empty or repeats the previous one.
fn push_decoration(lines: &mut Vec<String>, line: String) {
    if line.is_empty() || lines.last() == Some(&line) {
        return;
    }
    lines.push(line);
}

fn join_lines(lines: Vec<Vec<Node>>) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (i, line) in lines.into_iter().enumerate() {
        if i > 0 {
            nodes.push(Node::Text("\n".into()));
        }
        nodes.extend(line);
    }
    nodes
}

fn icon(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Image => "🖼",
        AttachmentKind::Video => "🎬",
        AttachmentKind::Audio => "🎵",
        AttachmentKind::File => "📄",
        AttachmentKind::Embed => "🔗",
        AttachmentKind::Other => "📎",
    }
}

/// Last path segment of the URL, or a numbered placeholder.
fn fallback_title(url: &str, index: usize) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("attachment {}", index + 1))
}

/// Human-readable byte size, e.g. `1.5 MB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
