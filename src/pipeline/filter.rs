//! Admission filters applied before formatting.
//!
//! Rules are evaluated in a fixed order and the first match decides:
//! 1. blocked sender
//! 2. blocked type
//! 3. type whitelist miss
//! 4. keyword blacklist hit (case-insensitive substring)
//! 5. keyword whitelist miss
//! 6. sender whitelist miss

use std::fmt;

use tracing::debug;

use crate::config::FilterConfig;
use crate::pipeline::types::{MessageType, RawMessage};

/// Why a message was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    BlockedSender { sender: String },
    BlockedType { kind: MessageType },
    TypeNotAllowed { types: Vec<MessageType> },
    Blacklisted { keyword: String },
    WhitelistMiss,
    SenderNotAllowed { sender: String },
}

impl RejectReason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::BlockedSender { .. } => "blocked_sender",
            Self::BlockedType { .. } => "blocked_type",
            Self::TypeNotAllowed { .. } => "type_not_allowed",
            Self::Blacklisted { .. } => "blacklist",
            Self::WhitelistMiss => "whitelist",
            Self::SenderNotAllowed { .. } => "sender_not_allowed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockedSender { sender } => write!(f, "sender {sender} is blocked"),
            Self::BlockedType { kind } => write!(f, "message type {kind} is blocked"),
            Self::TypeNotAllowed { types } => {
                let names: Vec<_> = types.iter().map(|t| t.as_str()).collect();
                if names.is_empty() {
                    write!(f, "empty message is not an allowed type")
                } else {
                    write!(f, "message types [{}] not in allowed types", names.join(", "))
                }
            }
            Self::Blacklisted { keyword } => write!(f, "matched blacklisted keyword \"{keyword}\""),
            Self::WhitelistMiss => write!(f, "no whitelisted keyword present"),
            Self::SenderNotAllowed { sender } => write!(f, "sender {sender} is not in allowed senders"),
        }
    }
}

/// Filter verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Admit,
    Reject(RejectReason),
}

impl FilterDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Pre-normalised filter set for one channel.
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
    allowed_senders: Vec<String>,
    blocked_senders: Vec<String>,
    allowed_types: Vec<MessageType>,
    blocked_types: Vec<MessageType>,
}

impl FilterEngine {
    /// Build an engine from an already merged filter config.
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            whitelist: normalise(&config.whitelist),
            blacklist: normalise(&config.blacklist),
            allowed_senders: normalise(&config.allowed_senders),
            blocked_senders: normalise(&config.blocked_senders),
            allowed_types: config.allowed_types.clone(),
            blocked_types: config.blocked_types.clone(),
        }
    }

    /// An engine that admits everything.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Evaluate a message against the filter set.
    pub fn evaluate(&self, message: &RawMessage) -> FilterDecision {
        let decision = self.decide(message);
        if let FilterDecision::Reject(ref reason) = decision {
            debug!(
                message_id = %message.id,
                sender = %message.author.username,
                rule = reason.label(),
                reason = %reason,
                "Message rejected by filter"
            );
        }
        decision
    }

    fn decide(&self, message: &RawMessage) -> FilterDecision {
        let identities = message.author.identities();

        if let Some(sender) = identities.iter().find(|id| self.blocked_senders.contains(id)) {
            return reject(RejectReason::BlockedSender {
                sender: sender.clone(),
            });
        }

        let types = message.message_types();
        if let Some(kind) = types.iter().find(|t| self.blocked_types.contains(t)) {
            return reject(RejectReason::BlockedType { kind: *kind });
        }
        if !self.allowed_types.is_empty() && !types.iter().any(|t| self.allowed_types.contains(t)) {
            return reject(RejectReason::TypeNotAllowed { types });
        }

        if !self.blacklist.is_empty() || !self.whitelist.is_empty() {
            let text = message.searchable_text();
            if let Some(keyword) = self.blacklist.iter().find(|k| text.contains(k.as_str())) {
                return reject(RejectReason::Blacklisted {
                    keyword: keyword.clone(),
                });
            }
            if !self.whitelist.is_empty() && !self.whitelist.iter().any(|k| text.contains(k.as_str())) {
                return reject(RejectReason::WhitelistMiss);
            }
        }

        if !self.allowed_senders.is_empty()
            && !identities.iter().any(|id| self.allowed_senders.contains(id))
        {
            return reject(RejectReason::SenderNotAllowed {
                sender: message.author.username.clone(),
            });
        }

        FilterDecision::Admit
    }
}

fn reject(reason: RejectReason) -> FilterDecision {
    FilterDecision::Reject(reason)
}

fn normalise(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let v = value.trim().to_lowercase();
        if !v.is_empty() && !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::pipeline::types::{Attachment, AttachmentKind, Author, MessageId};

    fn make_message(username: &str, content: &str, attachments: Vec<Attachment>) -> RawMessage {
        RawMessage {
            id: MessageId(10),
            channel_id: "chan".into(),
            author: Author {
                id: "77".into(),
                username: username.into(),
                display_name: None,
            },
            content: content.into(),
            attachments,
            created_at: Utc::now(),
            origin_url: None,
            pinned: false,
            system: false,
        }
    }

    fn image() -> Attachment {
        Attachment {
            url: "https://cdn.example/cat.png".into(),
            kind: AttachmentKind::Image,
            title: Some("cat.png".into()),
            description: None,
            size: Some(2048),
        }
    }

    #[test]
    fn admits_with_empty_filters() {
        let engine = FilterEngine::permissive();
        let msg = make_message("alice", "anything", vec![]);
        assert!(engine.evaluate(&msg).is_admitted());
    }

    #[test]
    fn rejects_blacklisted_keyword_case_insensitive() {
        let engine = FilterEngine::new(&FilterConfig {
            blacklist: vec!["maintenance".into()],
            ..FilterConfig::default()
        });
        let msg = make_message("alice", "Scheduled MAINTENANCE tonight", vec![]);
        match engine.evaluate(&msg) {
            FilterDecision::Reject(reason) => {
                assert_eq!(reason.label(), "blacklist");
                assert!(reason.to_string().contains("maintenance"));
            }
            other => panic!("Expected reject, got {:?}", other),
        }
    }

    #[test]
    fn whitelist_requires_a_keyword() {
        let engine = FilterEngine::new(&FilterConfig {
            whitelist: vec!["release".into()],
            ..FilterConfig::default()
        });
        assert!(engine.evaluate(&make_message("a", "New release out", vec![])).is_admitted());
        assert_eq!(
            engine.evaluate(&make_message("a", "just chatting", vec![])),
            FilterDecision::Reject(RejectReason::WhitelistMiss)
        );
    }

    #[test]
    fn whitelist_matches_attachment_titles() {
        let engine = FilterEngine::new(&FilterConfig {
            whitelist: vec!["cat".into()],
            ..FilterConfig::default()
        });
        assert!(engine.evaluate(&make_message("a", "", vec![image()])).is_admitted());
    }

    #[test]
    fn blocked_sender_matches_id_or_name() {
        let engine = FilterEngine::new(&FilterConfig {
            blocked_senders: vec!["77".into()],
            ..FilterConfig::default()
        });
        assert!(!engine.evaluate(&make_message("alice", "hi", vec![])).is_admitted());

        let engine = FilterEngine::new(&FilterConfig {
            blocked_senders: vec!["ALICE".into()],
            ..FilterConfig::default()
        });
        assert!(!engine.evaluate(&make_message("alice", "hi", vec![])).is_admitted());
    }

    #[test]
    fn sender_whitelist_rejects_unknown() {
        let engine = FilterEngine::new(&FilterConfig {
            allowed_senders: vec!["bob".into()],
            ..FilterConfig::default()
        });
        assert!(!engine.evaluate(&make_message("alice", "hi", vec![])).is_admitted());
        assert!(engine.evaluate(&make_message("Bob", "hi", vec![])).is_admitted());
    }

    #[test]
    fn blocked_type_rejects_image_posts() {
        let engine = FilterEngine::new(&FilterConfig {
            blocked_types: vec![MessageType::Image],
            ..FilterConfig::default()
        });
        let decision = engine.evaluate(&make_message("a", "look", vec![image()]));
        assert_eq!(
            decision,
            FilterDecision::Reject(RejectReason::BlockedType {
                kind: MessageType::Image
            })
        );
    }

    #[test]
    fn type_whitelist_rejects_text_only() {
        let engine = FilterEngine::new(&FilterConfig {
            allowed_types: vec![MessageType::Image],
            ..FilterConfig::default()
        });
        assert!(!engine.evaluate(&make_message("a", "words", vec![])).is_admitted());
        assert!(engine.evaluate(&make_message("a", "words", vec![image()])).is_admitted());
    }

    #[test]
    fn blocked_sender_wins_over_everything() {
        let engine = FilterEngine::new(&FilterConfig {
            blocked_senders: vec!["alice".into()],
            blocked_types: vec![MessageType::Text],
            blacklist: vec!["spam".into()],
            ..FilterConfig::default()
        });
        let decision = engine.evaluate(&make_message("alice", "spam", vec![]));
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::BlockedSender { .. })
        ));
    }

    #[test]
    fn type_rules_checked_before_keywords() {
        let engine = FilterEngine::new(&FilterConfig {
            allowed_types: vec![MessageType::Video],
            blacklist: vec!["spam".into()],
            ..FilterConfig::default()
        });
        let decision = engine.evaluate(&make_message("a", "spam", vec![]));
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::TypeNotAllowed { .. })
        ));
    }

    #[test]
    fn blacklist_checked_before_whitelist() {
        let engine = FilterEngine::new(&FilterConfig {
            whitelist: vec!["release".into()],
            blacklist: vec!["delayed".into()],
            ..FilterConfig::default()
        });
        let decision = engine.evaluate(&make_message("a", "release delayed", vec![]));
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::Blacklisted { .. })
        ));
    }

    #[test]
    fn keyword_rules_checked_before_sender_whitelist() {
        let engine = FilterEngine::new(&FilterConfig {
            whitelist: vec!["release".into()],
            allowed_senders: vec!["bob".into()],
            ..FilterConfig::default()
        });
        let decision = engine.evaluate(&make_message("alice", "chatter", vec![]));
        assert_eq!(decision, FilterDecision::Reject(RejectReason::WhitelistMiss));
    }

    #[test]
    fn blank_filter_entries_are_ignored() {
        let engine = FilterEngine::new(&FilterConfig {
            blacklist: vec!["  ".into(), "".into()],
            ..FilterConfig::default()
        });
        assert!(engine.evaluate(&make_message("a", "anything", vec![])).is_admitted());
    }
}
