//! Ingestion run: One pass over the unseen messages of a mailbox.
//!
//! `connect → open → search → {fetch → parse → resolve → append → flag}* → close`
//!
//! Setup failures abort the run. Anything that goes wrong with one message
//! is recorded against that message and the loop moves on.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IngestPolicy;
use crate::conversations::model::{ConversationMessage, normalize_address};
use crate::conversations::resolver::{self, Resolution};
use crate::error::IngestError;
use crate::mail::gateway::{Mailbox, MailboxConnector};
use crate::mail::parser::{self, ParsedMessage};
use crate::store::{ConversationStore, IngestionLog, NewLogEntry, OutcomePatch};

/// What a run reports back to its trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Every UID the search returned, whatever became of it.
    pub processed: usize,
    pub appended: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Per-message result.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Appended,
    Skipped,
    Failed(String),
}

/// One ingestion run over borrowed collaborators.
pub struct Ingestor<'a> {
    pub connector: &'a dyn MailboxConnector,
    pub conversations: &'a dyn ConversationStore,
    pub log: &'a dyn IngestionLog,
    pub mailbox: &'a str,
    pub policy: IngestPolicy,
}

impl Ingestor<'_> {
    /// Process the current batch of unseen messages.
    ///
    /// The connection is closed on every path once it exists.
    pub async fn run(&self) -> Result<RunSummary, IngestError> {
        let mut mailbox = self.connector.connect().await?;
        let result = self.run_batch(mailbox.as_mut()).await;
        if let Err(e) = mailbox.close().await {
            warn!("Failed to close mailbox: {e}");
        }
        result
    }

    async fn run_batch(&self, mailbox: &mut dyn Mailbox) -> Result<RunSummary, IngestError> {
        mailbox.open_mailbox(self.mailbox).await?;
        let uids = mailbox.search_unseen().await?;
        info!(mailbox = self.mailbox, count = uids.len(), "Processing unseen messages");

        let mut summary = RunSummary::default();
        for uid in uids {
            summary.processed += 1;
            match self.process(mailbox, uid).await {
                Outcome::Appended => summary.appended += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Failed(reason) => {
                    warn!(uid, "Message failed: {reason}");
                    summary.errors.push(format!("uid {uid}: {reason}"));
                }
            }
        }
        Ok(summary)
    }

    async fn process(&self, mailbox: &mut dyn Mailbox, uid: u32) -> Outcome {
        // A failed fetch leaves the message unseen; there is nothing to flag.
        let raw = match mailbox.fetch(uid).await {
            Ok(raw) => raw,
            Err(e) => {
                let reason = format!("fetch failed: {e}");
                self.record(&NewLogEntry {
                    uid: Some(uid),
                    error: Some(reason.clone()),
                    ..Default::default()
                })
                .await;
                return Outcome::Failed(reason);
            }
        };
        let raw_text = String::from_utf8_lossy(&raw.body).into_owned();

        let parsed = match parser::parse(&raw.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let reason = format!("parse failed: {e}");
                self.record(&NewLogEntry {
                    uid: Some(uid),
                    raw: raw_text,
                    error: Some(reason.clone()),
                    ..Default::default()
                })
                .await;
                self.flag_after_failure(mailbox, uid).await;
                return Outcome::Failed(reason);
            }
        };

        let mut entry = NewLogEntry {
            uid: Some(uid),
            raw: raw_text,
            sender_address: Some(normalize_address(&parsed.sender_address))
                .filter(|a| !a.is_empty()),
            sender_name: parsed.sender_name.clone(),
            subject: parsed.subject.clone(),
            reply_reference: parsed.reply_reference.clone(),
            ..Default::default()
        };

        let resolution = match resolver::resolve(&parsed, self.conversations).await {
            Ok(resolution) => resolution,
            Err(e) => {
                let reason = format!("resolve failed: {e}");
                entry.error = Some(reason.clone());
                self.record(&entry).await;
                self.flag_after_failure(mailbox, uid).await;
                return Outcome::Failed(reason);
            }
        };

        let Resolution {
            conversation: Some(conversation),
            reply_to_message_id,
            strategy,
        } = resolution
        else {
            debug!(uid, sender = %parsed.sender_address, "No conversation matched");
            entry.skipped = true;
            self.record(&entry).await;
            flag_seen(mailbox, uid).await;
            return Outcome::Skipped;
        };

        entry.matched_conversation_id = Some(conversation.id);
        entry.matched_reply_message_id = reply_to_message_id.clone();

        match self
            .conversations
            .has_source_hash(conversation.id, &parsed.content_hash)
            .await
        {
            Ok(true) => {
                info!(uid, conversation_id = %conversation.id, "Duplicate of an appended message, skipping");
                entry.skipped = true;
                self.record(&entry).await;
                flag_seen(mailbox, uid).await;
                return Outcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => warn!(uid, "Duplicate check failed, appending anyway: {e}"),
        }

        let log_id = self.record(&entry).await;
        let message = inbound_message(&parsed, reply_to_message_id);

        let failure = match self.conversations.append_message(conversation.id, &message).await {
            Ok(result) if result.modified => None,
            Ok(_) => Some(format!("conversation {} was not modified", conversation.id)),
            Err(e) => Some(format!("append failed: {e}")),
        };

        match failure {
            None => {
                info!(uid, conversation_id = %conversation.id, ?strategy, "Message appended");
                self.update_outcome(
                    log_id.as_deref(),
                    OutcomePatch {
                        appended: true,
                        ..Default::default()
                    },
                )
                .await;
                flag_seen(mailbox, uid).await;
                Outcome::Appended
            }
            Some(reason) => {
                self.update_outcome(
                    log_id.as_deref(),
                    OutcomePatch {
                        error: Some(reason.clone()),
                        ..Default::default()
                    },
                )
                .await;
                self.flag_after_failure(mailbox, uid).await;
                Outcome::Failed(reason)
            }
        }
    }

    async fn record(&self, entry: &NewLogEntry) -> Option<String> {
        match self.log.record(entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(uid = ?entry.uid, "Failed to write ingestion log entry: {e}");
                None
            }
        }
    }

    async fn update_outcome(&self, log_id: Option<&str>, patch: OutcomePatch) {
        let Some(id) = log_id else { return };
        if let Err(e) = self.log.update_outcome(id, &patch).await {
            warn!(log_id = id, "Failed to update ingestion log entry: {e}");
        }
    }

    async fn flag_after_failure(&self, mailbox: &mut dyn Mailbox, uid: u32) {
        if self.policy.flag_seen_on_failure {
            flag_seen(mailbox, uid).await;
        }
    }
}

async fn flag_seen(mailbox: &mut dyn Mailbox, uid: u32) {
    if let Err(e) = mailbox.mark_seen(uid).await {
        warn!(uid, "Failed to flag message seen: {e}");
    }
}

/// The timeline entry for an inbound message.
fn inbound_message(parsed: &ParsedMessage, reply_to: Option<String>) -> ConversationMessage {
    // Text converted from HTML has lost its quote containers; use the HTML.
    let text = parsed.has_plain_text.then_some(parsed.body_text.as_str());
    let body = parser::extract_reply(text, parsed.body_html.as_deref());
    let sender = parsed
        .sender_name
        .clone()
        .unwrap_or_else(|| parsed.sender_address.clone());
    ConversationMessage::inbound(body, sender)
        .with_subject(parsed.subject.clone())
        .with_reply_to(reply_to)
        .with_source_hash(parsed.content_hash.clone())
}
