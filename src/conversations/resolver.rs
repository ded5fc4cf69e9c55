//! Conversation resolver: Decides which thread an inbound message belongs to.
//!
//! Strict priority, first hit wins:
//! 1. the `In-Reply-To` reference, as a minted message id or a plain token
//! 2. the sender address, most recently updated thread first
//! 3. nothing; the caller skips the message
//!
//! The resolver never creates conversations.

use tracing::debug;

use crate::conversations::model::{Conversation, ReplyReference, normalize_address};
use crate::error::DatabaseError;
use crate::mail::parser::ParsedMessage;
use crate::store::ConversationStore;

/// Outcome of looking up a reply reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceMatch {
    /// The reference parsed as a minted message id and was found.
    Structured(Conversation),
    /// The reference matched a message id or legacy id by string equality.
    StringMatch(Conversation),
    NoMatch,
}

/// Which rule produced a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StructuredReference,
    StringReference,
    ParticipantAddress,
    Unmatched,
}

/// Where an inbound message goes and what it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub conversation: Option<Conversation>,
    pub reply_to_message_id: Option<String>,
    pub strategy: Strategy,
}

impl Resolution {
    fn unmatched() -> Self {
        Self {
            conversation: None,
            reply_to_message_id: None,
            strategy: Strategy::Unmatched,
        }
    }
}

/// Look up the conversation a reply reference points at.
pub async fn match_reference(
    reference: &ReplyReference,
    store: &dyn ConversationStore,
) -> Result<ReferenceMatch, DatabaseError> {
    let found = store.find_by_reply_reference(reference).await?;
    Ok(match (reference, found) {
        (ReplyReference::Structured(_), Some(c)) => ReferenceMatch::Structured(c),
        (ReplyReference::Plain(_), Some(c)) => ReferenceMatch::StringMatch(c),
        (_, None) => ReferenceMatch::NoMatch,
    })
}

/// Resolve a parsed message against the store.
///
/// Same message and unchanged store give the same result.
pub async fn resolve(
    parsed: &ParsedMessage,
    store: &dyn ConversationStore,
) -> Result<Resolution, DatabaseError> {
    if let Some(reference) = parsed
        .reply_reference
        .as_deref()
        .and_then(ReplyReference::parse)
    {
        let (conversation, strategy) = match match_reference(&reference, store).await? {
            ReferenceMatch::Structured(c) => (Some(c), Strategy::StructuredReference),
            ReferenceMatch::StringMatch(c) => (Some(c), Strategy::StringReference),
            ReferenceMatch::NoMatch => (None, Strategy::Unmatched),
        };
        if let Some(conversation) = conversation {
            debug!(conversation_id = %conversation.id, ?strategy, "Resolved by reply reference");
            return Ok(Resolution {
                conversation: Some(conversation),
                reply_to_message_id: Some(reference.token()),
                strategy,
            });
        }
    }

    let address = normalize_address(&parsed.sender_address);
    if address.is_empty() {
        return Ok(Resolution::unmatched());
    }

    match store.find_most_recent_by_address(&address).await? {
        Some(conversation) => {
            debug!(conversation_id = %conversation.id, "Resolved by participant address");
            let reply_to_message_id = latest_operator_reply(&conversation);
            Ok(Resolution {
                conversation: Some(conversation),
                reply_to_message_id,
                strategy: Strategy::ParticipantAddress,
            })
        }
        None => Ok(Resolution::unmatched()),
    }
}

/// Id of the newest operator message. Equal timestamps keep timeline order.
pub fn latest_operator_reply(conversation: &Conversation) -> Option<String> {
    let mut replies: Vec<_> = conversation
        .messages
        .iter()
        .filter(|m| m.is_from_operator)
        .collect();
    replies.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    replies
        .first()
        .and_then(|m| m.reply_target())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::model::ConversationMessage;
    use crate::store::LibSqlBackend;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn inbound(from: &str, reply: Option<&str>) -> ParsedMessage {
        ParsedMessage {
            sender_address: from.to_string(),
            sender_name: None,
            subject: None,
            body_text: "hi".into(),
            has_plain_text: true,
            body_html: None,
            reply_reference: reply.map(str::to_string),
            content_hash: "h".into(),
        }
    }

    async fn store() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn plain_reference_matches_message_id() {
        let db = store().await;
        let c1 = db.create_conversation("jane@example.com", None).await.unwrap();
        let mut reply = ConversationMessage::operator("we got it", "Staff");
        reply.message_id = Some("abc123".into());
        db.append_message(c1.id, &reply).await.unwrap();

        let resolution = resolve(&inbound("jane@example.com", Some("<abc123>")), &db)
            .await
            .unwrap();
        assert_eq!(resolution.conversation.map(|c| c.id), Some(c1.id));
        assert_eq!(resolution.reply_to_message_id.as_deref(), Some("abc123"));
        assert_eq!(resolution.strategy, Strategy::StringReference);
    }

    #[tokio::test]
    async fn structured_reference_matches_minted_id() {
        let db = store().await;
        let conv = db.create_conversation("jane@example.com", None).await.unwrap();
        let reply = ConversationMessage::operator("answer", "Staff");
        db.append_message(conv.id, &reply).await.unwrap();
        let minted = reply.message_id.clone().unwrap();

        let resolution = resolve(&inbound("other@example.com", Some(&format!("<{minted}>"))), &db)
            .await
            .unwrap();
        assert_eq!(resolution.conversation.map(|c| c.id), Some(conv.id));
        assert_eq!(resolution.reply_to_message_id, Some(minted));
        assert_eq!(resolution.strategy, Strategy::StructuredReference);
    }

    #[tokio::test]
    async fn reference_wins_over_address() {
        let db = store().await;
        let referenced = db.create_conversation("old@example.com", None).await.unwrap();
        let mut reply = ConversationMessage::operator("answer", "Staff");
        reply.message_id = Some("ref-1".into());
        db.append_message(referenced.id, &reply).await.unwrap();
        let by_address = db.create_conversation("jane@example.com", None).await.unwrap();
        db.append_message(by_address.id, &ConversationMessage::inbound("x", "Jane"))
            .await
            .unwrap();

        let resolution = resolve(&inbound("jane@example.com", Some("ref-1")), &db)
            .await
            .unwrap();
        assert_eq!(resolution.conversation.map(|c| c.id), Some(referenced.id));
    }

    #[tokio::test]
    async fn unknown_reference_falls_back_to_address() {
        let db = store().await;
        let conv = db.create_conversation("jane@example.com", None).await.unwrap();

        let stale = Uuid::new_v4().to_string();
        let resolution = resolve(&inbound("Jane@Example.com", Some(&stale)), &db)
            .await
            .unwrap();
        assert_eq!(resolution.conversation.map(|c| c.id), Some(conv.id));
        assert_eq!(resolution.strategy, Strategy::ParticipantAddress);
        assert!(resolution.reply_to_message_id.is_none());
    }

    #[tokio::test]
    async fn address_picks_most_recently_updated() {
        let db = store().await;
        let first = db.create_conversation("jane@example.com", None).await.unwrap();
        let _second = db.create_conversation("jane@example.com", None).await.unwrap();
        // Appending bumps updated_at past the newer thread's.
        db.append_message(first.id, &ConversationMessage::inbound("bump", "Jane"))
            .await
            .unwrap();

        let resolution = resolve(&inbound("jane@example.com", None), &db).await.unwrap();
        assert_eq!(resolution.conversation.map(|c| c.id), Some(first.id));
    }

    #[tokio::test]
    async fn reply_target_is_latest_operator_message() {
        let db = store().await;
        let c2 = db.create_conversation("jane@example.com", None).await.unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let latest = ConversationMessage::operator("second answer", "Staff").with_created_at(t);
        let earlier = ConversationMessage::operator("first answer", "Staff")
            .with_created_at(t - chrono::Duration::seconds(1));
        let inbound_later = ConversationMessage::inbound("thanks", "Jane")
            .with_created_at(t + chrono::Duration::seconds(5));
        db.append_message(c2.id, &latest).await.unwrap();
        db.append_message(c2.id, &earlier).await.unwrap();
        db.append_message(c2.id, &inbound_later).await.unwrap();

        let resolution = resolve(&inbound("jane@example.com", None), &db).await.unwrap();
        assert_eq!(resolution.reply_to_message_id, latest.message_id);
    }

    #[tokio::test]
    async fn unmatched_sender_resolves_to_nothing() {
        let db = store().await;
        db.create_conversation("jane@example.com", None).await.unwrap();

        let resolution = resolve(&inbound("unknown@nowhere.test", None), &db)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::unmatched());
        assert_eq!(db.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_sender_without_reference_is_unmatched() {
        let db = store().await;
        let resolution = resolve(&inbound("", None), &db).await.unwrap();
        assert_eq!(resolution.strategy, Strategy::Unmatched);
    }

    #[tokio::test]
    async fn resolution_is_repeatable() {
        let db = store().await;
        let conv = db.create_conversation("jane@example.com", None).await.unwrap();
        db.append_message(conv.id, &ConversationMessage::operator("a", "Staff"))
            .await
            .unwrap();

        let parsed = inbound("jane@example.com", None);
        let first = resolve(&parsed, &db).await.unwrap();
        let second = resolve(&parsed, &db).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn equal_timestamps_keep_timeline_order() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = ConversationMessage::operator("a", "Staff").with_created_at(t);
        let b = ConversationMessage::operator("b", "Staff").with_created_at(t);
        let conversation = Conversation {
            id: Uuid::new_v4(),
            participant_address: "jane@example.com".into(),
            display_name: None,
            created_at: t,
            updated_at: t,
            messages: vec![a.clone(), b],
        };
        assert_eq!(latest_operator_reply(&conversation), a.message_id);
    }
}
