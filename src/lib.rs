//! Mail ingest: Routes inbound email into contact-form conversations.

pub mod auth;
pub mod config;
pub mod conversations;
pub mod error;
pub mod ingest;
pub mod mail;
pub mod store;
