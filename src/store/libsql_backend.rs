//! libSQL backend: Implements the conversation, audit-log and session
//! stores over a single reused connection. Supports local file and
//! in-memory databases.
//!
//! Reads go straight to the connection. Writes take `write_lock` first, so a
//! transaction opened by one task never picks up another task's statements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversations::model::{
    AppendResult, Conversation, ConversationMessage, MessageSelector, ReadResult, ReplyReference,
    normalize_address,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ConversationStore, IngestionLog, IngestionLogEntry, LogPage, NewLogEntry, OperatorSession,
    OutcomePatch, SessionStore,
};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync`, but a transaction on it is scoped to
/// the connection rather than the task. Overlapping runs share one backend,
/// so every write goes through [`LibSqlBackend::writer`].
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Exclusive write access; hold the guard until the write (or the whole
    /// transaction) is finished.
    async fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Load a conversation and its full timeline.
    async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_conversation: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("load_conversation: {e}"))),
        };
        let mut conversation = row_to_conversation(&row)?;
        conversation.messages = self.load_messages(id).await?;
        Ok(Some(conversation))
    }

    async fn load_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE conversation_id = ?1 ORDER BY seq ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_messages: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => messages.push(
                    row_to_message(&row)
                        .map_err(|e| DatabaseError::Query(format!("load_messages row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("load_messages: {e}"))),
            }
        }
        Ok(messages)
    }

    /// First `conversation_id` returned by a single-column query.
    async fn first_conversation_id(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width so that TEXT ordering matches time
/// ordering in `ORDER BY` and `MAX()`.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad id {s:?}: {e}")))
}

const CONVERSATION_COLUMNS: &str = "id, participant_address, display_name, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "message_id, legacy_id, created_at, body, subject, sender_display_name, is_from_operator, read, reply_to_message_id, source_hash";

const LOG_COLUMNS: &str = "id, uid, raw, sender_address, sender_name, subject, reply_reference, matched_conversation_id, matched_reply_message_id, appended, skipped, error, processed_at";

/// Map a row to a Conversation with an empty timeline.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("conversation row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let created: String = row.get(3).map_err(parse)?;
    let updated: String = row.get(4).map_err(parse)?;

    Ok(Conversation {
        id: parse_uuid(&id)?,
        participant_address: row.get(1).map_err(parse)?,
        display_name: row.get(2).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        messages: Vec::new(),
    })
}

/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<ConversationMessage, libsql::Error> {
    let created: String = row.get(2)?;
    Ok(ConversationMessage {
        message_id: row.get(0).ok(),
        legacy_id: row.get(1).ok(),
        created_at: parse_datetime(&created),
        body: row.get(3)?,
        subject: row.get(4).ok(),
        sender_display_name: row.get(5)?,
        is_from_operator: row.get::<i64>(6)? != 0,
        read: row.get::<i64>(7)? != 0,
        reply_to_message_id: row.get(8).ok(),
        source_hash: row.get(9).ok(),
    })
}

/// Column order matches LOG_COLUMNS.
fn row_to_log_entry(row: &libsql::Row) -> Result<IngestionLogEntry, libsql::Error> {
    let processed: String = row.get(12)?;
    Ok(IngestionLogEntry {
        id: row.get(0)?,
        uid: row
            .get::<i64>(1)
            .ok()
            .and_then(|v| u32::try_from(v).ok()),
        raw: row.get(2)?,
        sender_address: row.get(3).ok(),
        sender_name: row.get(4).ok(),
        subject: row.get(5).ok(),
        reply_reference: row.get(6).ok(),
        matched_conversation_id: row.get(7).ok(),
        matched_reply_message_id: row.get(8).ok(),
        appended: row.get::<i64>(9)? != 0,
        skipped: row.get::<i64>(10)? != 0,
        error: row.get(11).ok(),
        processed_at: parse_datetime(&processed),
    })
}

// ── Conversations ───────────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn find_by_reply_reference(
        &self,
        reference: &ReplyReference,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let found = match reference {
            ReplyReference::Structured(id) => {
                self.first_conversation_id(
                    "SELECT conversation_id FROM conversation_messages WHERE message_id = ?1 ORDER BY seq ASC LIMIT 1",
                    params![id.to_string()],
                    "find_by_reply_reference",
                )
                .await?
            }
            ReplyReference::Plain(token) => {
                self.first_conversation_id(
                    "SELECT conversation_id FROM conversation_messages WHERE message_id = ?1 OR legacy_id = ?1 ORDER BY seq ASC LIMIT 1",
                    params![token.as_str()],
                    "find_by_reply_reference",
                )
                .await?
            }
        };

        match found {
            Some(id) => self.load_conversation(&id).await,
            None => Ok(None),
        }
    }

    async fn find_most_recent_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let found = self
            .first_conversation_id(
                "SELECT id FROM conversations WHERE participant_address = ?1 ORDER BY updated_at DESC, created_at DESC LIMIT 1",
                params![normalize_address(address)],
                "find_most_recent_by_address",
            )
            .await?;

        match found {
            Some(id) => self.load_conversation(&id).await,
            None => Ok(None),
        }
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        message: &ConversationMessage,
    ) -> Result<AppendResult, DatabaseError> {
        let id = conversation_id.to_string();
        let _write = self.writer().await;
        let now = fmt_ts(Utc::now());

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message begin: {e}")))?;

        // MAX keeps updated_at from moving backwards under clock skew.
        let touched = tx
            .execute(
                "UPDATE conversations SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
                params![now, id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message touch: {e}")))?;

        if touched == 0 {
            // Nothing was written. A ROLLBACK would abort statements other
            // tasks still have pending on the shared connection.
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("append_message commit: {e}")))?;
            debug!(conversation_id = %conversation_id, "Append target not found");
            return Ok(AppendResult { modified: false });
        }

        tx.execute(
            "INSERT INTO conversation_messages (conversation_id, message_id, legacy_id, created_at, body, subject, sender_display_name, is_from_operator, read, reply_to_message_id, source_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.as_str(),
                opt_text(message.message_id.as_deref()),
                opt_text(message.legacy_id.as_deref()),
                fmt_ts(message.created_at),
                message.body.as_str(),
                opt_text(message.subject.as_deref()),
                message.sender_display_name.as_str(),
                flag(message.is_from_operator),
                flag(message.read),
                opt_text(message.reply_to_message_id.as_deref()),
                opt_text(message.source_hash.as_deref()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_message insert: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message commit: {e}")))?;

        debug!(
            conversation_id = %conversation_id,
            message_id = message.message_id.as_deref().unwrap_or("-"),
            "Message appended"
        );
        Ok(AppendResult { modified: true })
    }

    async fn mark_message_read(
        &self,
        conversation_id: Uuid,
        selector: &MessageSelector,
    ) -> Result<ReadResult, DatabaseError> {
        let id = conversation_id.to_string();
        let _write = self.writer().await;
        let matched = match selector {
            MessageSelector::Id(message_id) => self
                .conn()
                .execute(
                    "UPDATE conversation_messages SET read = 1 WHERE conversation_id = ?1 AND (message_id = ?2 OR legacy_id = ?2)",
                    params![id.as_str(), message_id.as_str()],
                )
                .await,
            MessageSelector::CreatedAt(created_at) => self
                .conn()
                .execute(
                    "UPDATE conversation_messages SET read = 1 WHERE conversation_id = ?1 AND created_at = ?2",
                    params![id.as_str(), fmt_ts(*created_at)],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("mark_message_read: {e}")))?;

        if matched > 0 {
            self.conn()
                .execute(
                    "UPDATE conversations SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
                    params![fmt_ts(Utc::now()), id.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("mark_message_read touch: {e}")))?;
        }

        Ok(ReadResult { matched: matched > 0 })
    }

    async fn has_source_hash(
        &self,
        conversation_id: Uuid,
        source_hash: &str,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .count(
                "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1 AND source_hash = ?2",
                params![conversation_id.to_string(), source_hash],
            )
            .await?;
        Ok(n > 0)
    }

    async fn create_conversation(
        &self,
        address: &str,
        display_name: Option<&str>,
    ) -> Result<Conversation, DatabaseError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            participant_address: normalize_address(address),
            display_name: display_name.map(str::to_string),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };

        let _write = self.writer().await;
        self.conn()
            .execute(
                "INSERT INTO conversations (id, participant_address, display_name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id.to_string(),
                    conversation.participant_address.as_str(),
                    opt_text(display_name),
                    fmt_ts(now),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;

        debug!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        self.load_conversation(&id.to_string()).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY updated_at DESC, created_at DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversations: {e}")))?;

        let mut conversations = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => conversations.push(row_to_conversation(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_conversations: {e}"))),
            }
        }
        for conversation in &mut conversations {
            conversation.messages = self.load_messages(&conversation.id.to_string()).await?;
        }
        Ok(conversations)
    }
}

// ── Ingestion log ───────────────────────────────────────────────────

#[async_trait]
impl IngestionLog for LibSqlBackend {
    async fn record(&self, entry: &NewLogEntry) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let conversation_id = entry.matched_conversation_id.map(|c| c.to_string());
        let uid = entry
            .uid
            .map_or(libsql::Value::Null, |u| libsql::Value::Integer(i64::from(u)));

        let _write = self.writer().await;
        self.conn()
            .execute(
                &format!("INSERT INTO ingestion_log ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12)"),
                params![
                    id.as_str(),
                    uid,
                    entry.raw.as_str(),
                    opt_text(entry.sender_address.as_deref()),
                    opt_text(entry.sender_name.as_deref()),
                    opt_text(entry.subject.as_deref()),
                    opt_text(entry.reply_reference.as_deref()),
                    opt_text(conversation_id.as_deref()),
                    opt_text(entry.matched_reply_message_id.as_deref()),
                    flag(entry.skipped),
                    opt_text(entry.error.as_deref()),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record: {e}")))?;

        Ok(id)
    }

    async fn update_outcome(&self, id: &str, patch: &OutcomePatch) -> Result<(), DatabaseError> {
        let _write = self.writer().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE ingestion_log SET appended = ?1, skipped = ?2, error = ?3 WHERE id = ?4",
                params![
                    flag(patch.appended),
                    flag(patch.skipped),
                    opt_text(patch.error.as_deref()),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_outcome: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "ingestion_log".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_entries(&self, page: u32, limit: u32) -> Result<LogPage, DatabaseError> {
        let page = page.max(1);
        let limit = limit.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM ingestion_log ORDER BY processed_at DESC LIMIT ?1 OFFSET ?2"
                ),
                params![i64::from(limit), offset],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_entries: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_log_entry(&row) {
                Ok(entry) => items.push(entry),
                Err(e) => tracing::warn!("Skipping ingestion log row: {e}"),
            }
        }

        let total = self.count("SELECT COUNT(*) FROM ingestion_log", ()).await?;
        Ok(LogPage {
            items,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let _write = self.writer().await;
        self.conn()
            .execute(
                "DELETE FROM ingestion_log WHERE processed_at < ?1",
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_older_than: {e}")))
    }
}

// ── Sessions ────────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn find_active_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OperatorSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT token, user_id, created_at, expires_at FROM operator_sessions WHERE token = ?1 AND expires_at > ?2",
                params![token, fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_active_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parse = |e: libsql::Error| DatabaseError::Query(format!("session row parse: {e}"));
                let created: String = row.get(2).map_err(parse)?;
                let expires: String = row.get(3).map_err(parse)?;
                Ok(Some(OperatorSession {
                    token: row.get(0).map_err(parse)?,
                    user_id: row.get(1).map_err(parse)?,
                    created_at: parse_datetime(&created),
                    expires_at: parse_datetime(&expires),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_active_session: {e}"))),
        }
    }

    async fn create_session(
        &self,
        user_id: &str,
        ttl: chrono::Duration,
    ) -> Result<OperatorSession, DatabaseError> {
        let now = Utc::now();
        let session = OperatorSession {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        let _write = self.writer().await;
        self.conn()
            .execute(
                "INSERT INTO operator_sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.token.as_str(),
                    session.user_id.as_str(),
                    fmt_ts(session.created_at),
                    fmt_ts(session.expires_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_session: {e}")))?;

        Ok(session)
    }
}
