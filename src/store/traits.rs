//! Store traits: The persistence seams the ingestion core talks to.
//!
//! Conversations, the ingestion audit log and operator sessions live behind
//! separate traits so a run can be handed exactly what it touches. The libSQL
//! backend implements all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::conversations::model::{
    AppendResult, Conversation, ConversationMessage, MessageSelector, ReadResult, ReplyReference,
};
use crate::error::DatabaseError;

/// Conversation threads keyed by participant address.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Conversation holding a message that `reference` points at.
    ///
    /// `Structured` matches `message_id` only; `Plain` matches `message_id`
    /// or `legacy_id`.
    async fn find_by_reply_reference(
        &self,
        reference: &ReplyReference,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Most recently updated conversation for `address` (ties broken by
    /// `created_at`, newest first).
    async fn find_most_recent_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Append to a conversation's timeline and advance its `updated_at`.
    async fn append_message(
        &self,
        conversation_id: Uuid,
        message: &ConversationMessage,
    ) -> Result<AppendResult, DatabaseError>;

    /// Flag one message as read.
    async fn mark_message_read(
        &self,
        conversation_id: Uuid,
        selector: &MessageSelector,
    ) -> Result<ReadResult, DatabaseError>;

    /// Whether a message ingested from the same raw mail is already present.
    async fn has_source_hash(
        &self,
        conversation_id: Uuid,
        source_hash: &str,
    ) -> Result<bool, DatabaseError>;

    /// Start a new thread. Only the form-submission path calls this.
    async fn create_conversation(
        &self,
        address: &str,
        display_name: Option<&str>,
    ) -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, DatabaseError>;
}

/// A fresh audit record, written once routing has been decided.
#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub uid: Option<u32>,
    pub raw: String,
    pub sender_address: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub reply_reference: Option<String>,
    pub matched_conversation_id: Option<Uuid>,
    pub matched_reply_message_id: Option<String>,
    pub skipped: bool,
    pub error: Option<String>,
}

/// Outcome backfill applied once the append attempt resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomePatch {
    pub appended: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

/// One persisted audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionLogEntry {
    pub id: String,
    pub uid: Option<u32>,
    pub raw: String,
    pub sender_address: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub reply_reference: Option<String>,
    pub matched_conversation_id: Option<String>,
    pub matched_reply_message_id: Option<String>,
    pub appended: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// A page of audit records plus the overall count.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub items: Vec<IngestionLogEntry>,
    pub total: u64,
}

/// Append-only audit trail of routing decisions.
#[async_trait]
pub trait IngestionLog: Send + Sync {
    /// Insert a record, returning its id.
    async fn record(&self, entry: &NewLogEntry) -> Result<String, DatabaseError>;

    async fn update_outcome(&self, id: &str, patch: &OutcomePatch) -> Result<(), DatabaseError>;

    /// Records sorted by `processed_at` descending. `page` is 1-based.
    async fn list_entries(&self, page: u32, limit: u32) -> Result<LogPage, DatabaseError>;

    /// Delete records processed before `cutoff`; returns how many went.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>;
}

/// An authenticated operator session.
#[derive(Debug, Clone)]
pub struct OperatorSession {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Operator sessions, issued by the login path and checked by the HTTP surface.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The session for `token` if it exists and has not expired at `now`.
    async fn find_active_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OperatorSession>, DatabaseError>;

    async fn create_session(
        &self,
        user_id: &str,
        ttl: chrono::Duration,
    ) -> Result<OperatorSession, DatabaseError>;
}
