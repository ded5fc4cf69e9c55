//! Mail transport and decoding.

pub mod gateway;
pub mod imap;
pub mod parser;

pub use gateway::{Mailbox, MailboxConnector, RawMessage};
pub use imap::{ImapConnector, ImapMailbox};
pub use parser::{ParsedMessage, extract_reply, parse};
