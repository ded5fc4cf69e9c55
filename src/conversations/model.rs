//! Conversation threads and their messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A thread of messages exchanged with one participant address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    /// Always lowercase; see [`normalize_address`].
    pub participant_address: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Timeline in append order.
    pub messages: Vec<ConversationMessage>,
}

/// One entry in a conversation's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    /// Minted at append time; later used as a reply target.
    pub message_id: Option<String>,
    /// Identifier carried over from records that predate `message_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub body: String,
    pub subject: Option<String>,
    pub sender_display_name: String,
    /// Staff reply rather than inbound contact.
    pub is_from_operator: bool,
    pub read: bool,
    pub reply_to_message_id: Option<String>,
    /// SHA-256 of the raw mail this entry was ingested from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
}

impl ConversationMessage {
    /// A new unread inbound message with a freshly minted id.
    pub fn inbound(body: impl Into<String>, sender_display_name: impl Into<String>) -> Self {
        Self {
            message_id: Some(Uuid::new_v4().to_string()),
            legacy_id: None,
            created_at: Utc::now(),
            body: body.into(),
            subject: None,
            sender_display_name: sender_display_name.into(),
            is_from_operator: false,
            read: false,
            reply_to_message_id: None,
            source_hash: None,
        }
    }

    /// A staff reply. Operator messages start out read.
    pub fn operator(body: impl Into<String>, sender_display_name: impl Into<String>) -> Self {
        Self {
            is_from_operator: true,
            read: true,
            ..Self::inbound(body, sender_display_name)
        }
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to_message_id = reply_to;
        self
    }

    pub fn with_source_hash(mut self, hash: impl Into<String>) -> Self {
        self.source_hash = Some(hash.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// The identifier a reply should point at: `message_id`, else `legacy_id`.
    pub fn reply_target(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .or(self.legacy_id.as_deref())
    }
}

/// Token from an inbound `In-Reply-To` header, classified for lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyReference {
    /// Parses as a message id minted by this system.
    Structured(Uuid),
    /// Anything else; matched by string equality against message ids and
    /// legacy ids.
    Plain(String),
}

impl ReplyReference {
    /// Classify a raw header value. Angle brackets and surrounding whitespace
    /// are dropped. Returns `None` for an empty token.
    pub fn parse(raw: &str) -> Option<Self> {
        let token: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '<' && *c != '>')
            .collect();
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        match Uuid::parse_str(token) {
            Ok(id) => Some(Self::Structured(id)),
            Err(_) => Some(Self::Plain(token.to_string())),
        }
    }

    /// The bare token, as stored in `reply_to_message_id`.
    pub fn token(&self) -> String {
        match self {
            Self::Structured(id) => id.to_string(),
            Self::Plain(s) => s.clone(),
        }
    }
}

/// Selects the message to flag as read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSelector {
    Id(String),
    /// For rows without a `message_id`.
    CreatedAt(DateTime<Utc>),
}

/// Outcome of [`ConversationStore::append_message`](crate::store::ConversationStore::append_message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub modified: bool,
}

/// Outcome of [`ConversationStore::mark_message_read`](crate::store::ConversationStore::mark_message_read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    pub matched: bool,
}

/// Canonical form of a participant address: trimmed and lowercased.
///
/// Applied on every write and every lookup so the form-submission path and
/// the ingestion path agree.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
