//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default location of the libSQL store.
pub const DEFAULT_DB_PATH: &str = "./data/mail-ingest.db";

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Folder to scan, `INBOX` unless overridden.
    pub mailbox: String,
    /// Bound on TCP connect, TLS handshake and LOGIN together.
    pub connect_timeout: Duration,
}

/// What a run does with a message whose append failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestPolicy {
    /// Flag the source message `\Seen` even when the append failed, so an
    /// unroutable message is not retried on every tick.
    pub flag_seen_on_failure: bool,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            flag_seen_on_failure: true,
        }
    }
}

/// Everything the worker needs for a run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub imap: ImapConfig,
    pub db_path: PathBuf,
    /// `Some` switches the binary into a perpetual poll loop.
    pub poll_interval: Option<Duration>,
    /// Audit entries older than this are pruned at the start of each run.
    pub log_retention: Option<Duration>,
    pub policy: IngestPolicy,
}

impl IngestConfig {
    /// Build config from environment variables.
    ///
    /// `IMAP_HOST`, `IMAP_USER` and `IMAP_PASS` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = required("IMAP_HOST")?;
        let username = required("IMAP_USER")?;
        let password = SecretString::from(required("IMAP_PASS")?);
        let port = parsed_or("IMAP_PORT", 993_u16)?;
        let mailbox = std::env::var("MAILBOX")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "INBOX".to_string());
        let connect_timeout = Duration::from_millis(parsed_or("IMAP_CONNECT_TIMEOUT_MS", 10_000_u64)?);

        let poll_interval = parsed_opt::<u64>("POLL_INTERVAL_MS")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let log_retention = parsed_opt::<u64>("IMAP_LOG_TTL_SECONDS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let db_path = std::env::var("INGEST_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        let flag_seen_on_failure = match std::env::var("FLAG_SEEN_ON_FAILURE") {
            Ok(v) => parse_bool("FLAG_SEEN_ON_FAILURE", &v)?,
            Err(_) => true,
        };

        Ok(Self {
            imap: ImapConfig {
                host,
                port,
                username,
                password,
                mailbox,
                connect_timeout,
            },
            db_path,
            poll_interval,
            log_retention,
            policy: IngestPolicy {
                flag_seen_on_failure,
            },
        })
    }
}

/// HTTP trigger settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// `Some` enables the HTTP surface on this port.
    pub port: Option<u16>,
    pub auth: AuthConfig,
}

/// Shared secrets accepted by the trigger endpoint.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Scheduler secret, presented as `Authorization: Bearer <secret>`.
    pub cron_secret: Option<SecretString>,
    /// Legacy secret, presented in the `x-imap-secret` header.
    pub legacy_secret: Option<SecretString>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parsed_opt::<u16>("INGEST_HTTP_PORT")?;
        let secret = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from)
        };
        Ok(Self {
            port,
            auth: AuthConfig {
                cron_secret: secret("CRON_SECRET"),
                legacy_secret: secret("IMAP_CHECK_SECRET"),
            },
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed_opt<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}

fn parsed_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parsed_opt(key)?.unwrap_or(default))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}
