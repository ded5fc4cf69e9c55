//! Error types for the ingestion worker.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail transport errors. Every gateway operation can fail with one of these.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Connecting to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Mailbox {name} could not be opened: {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Message {uid} not returned by FETCH")]
    MissingBody { uid: u32 },

    #[error("Connection closed by server")]
    Closed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw message decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message is empty")]
    Empty,

    #[error("Message has no recognizable RFC 5322 structure")]
    Unrecognized,
}

/// Run-level failures. Anything here aborts the whole batch before or while
/// opening the mailbox; per-message problems never surface as this type.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Store unavailable: {0}")]
    Store(#[from] DatabaseError),

    #[error("Mailbox unavailable: {0}")]
    Mailbox(#[from] MailboxError),
}
