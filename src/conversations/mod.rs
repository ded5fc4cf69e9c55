//! Conversation threads and inbound-message routing.

pub mod model;
pub mod resolver;

pub use model::{
    AppendResult, Conversation, ConversationMessage, MessageSelector, ReadResult, ReplyReference,
    normalize_address,
};
pub use resolver::{ReferenceMatch, Resolution, Strategy, resolve};
