//! Mailbox gateway traits: The transport seam the ingestion run drives.

use async_trait::async_trait;

use crate::error::MailboxError;

/// One mailbox entry as fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Server UID, stable within the mailbox's UIDVALIDITY.
    pub uid: u32,
    pub body: Vec<u8>,
}

/// Opens authenticated mailbox connections.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connect and authenticate. Implementations bound the whole handshake
    /// with a timeout.
    async fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError>;
}

/// An authenticated connection, owned by exactly one run.
#[async_trait]
pub trait Mailbox: Send {
    /// Select a folder for read-write access.
    async fn open_mailbox(&mut self, name: &str) -> Result<(), MailboxError>;

    /// UIDs of unseen messages, in server order.
    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError>;

    /// Full raw message. Does not set `\Seen`.
    async fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailboxError>;

    /// Add `\Seen`. Idempotent.
    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError>;

    /// Log out and drop the connection.
    async fn close(&mut self) -> Result<(), MailboxError>;
}
