//! IMAP4rev1 mailbox over TLS.
//!
//! The protocol session is blocking (rustls `StreamOwned` over a
//! `TcpStream`); every call is driven through `spawn_blocking`. Only the
//! handful of commands ingestion needs are spoken: LOGIN, SELECT, UID
//! SEARCH, UID FETCH, UID STORE and LOGOUT.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::ImapConfig;
use crate::error::MailboxError;
use crate::mail::gateway::{Mailbox, MailboxConnector, RawMessage};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Largest `{n}` literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

/// Opens [`ImapMailbox`] connections from an [`ImapConfig`].
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError> {
        let config = self.config.clone();
        let host = config.host.clone();
        let timeout = config.connect_timeout;

        let handshake = tokio::task::spawn_blocking(move || connect_tls(&config));
        let session = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => {
                return Err(MailboxError::ConnectFailed {
                    host,
                    reason: join.to_string(),
                });
            }
            Err(_) => return Err(MailboxError::Timeout { host, timeout }),
        };

        info!(host = %host, "IMAP session established");
        Ok(Box::new(ImapMailbox {
            session: Some(session),
        }))
    }
}

/// Blocking connect, TLS handshake and LOGIN.
fn connect_tls(config: &ImapConfig) -> Result<ImapSession<TlsStream>, MailboxError> {
    let connect_failed = |reason: String| MailboxError::ConnectFailed {
        host: config.host.clone(),
        reason,
    };

    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| connect_failed(e.to_string()))?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        connect_failed(last_err.map_or_else(|| "no addresses resolved".to_string(), |e| e.to_string()))
    })?;
    tcp.set_read_timeout(Some(config.connect_timeout.max(Duration::from_secs(30))))?;
    tcp.set_write_timeout(Some(config.connect_timeout.max(Duration::from_secs(30))))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| MailboxError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| MailboxError::Tls(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::Tls(e.to_string()))?;

    let mut session = ImapSession::new(rustls::StreamOwned::new(conn, tcp));
    session.greeting()?;
    session.login(&config.username, config.password.expose_secret())?;
    Ok(session)
}

/// An authenticated IMAP connection.
pub struct ImapMailbox {
    /// `None` once closed.
    session: Option<ImapSession<TlsStream>>,
}

impl ImapMailbox {
    /// Run a blocking session operation off the async runtime.
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut session = self.session.take().ok_or(MailboxError::Closed)?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| MailboxError::CommandFailed {
            command: "blocking task".into(),
            reason: e.to_string(),
        })?;
        self.session = Some(session);
        result
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn open_mailbox(&mut self, name: &str) -> Result<(), MailboxError> {
        let name = name.to_string();
        self.with_session(move |s| s.select(&name)).await
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.with_session(|s| s.search_unseen()).await
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailboxError> {
        self.with_session(move |s| s.fetch(uid)).await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.with_session(move |s| s.mark_seen(uid)).await
    }

    async fn close(&mut self) -> Result<(), MailboxError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.logout())
            .await
            .map_err(|e| MailboxError::CommandFailed {
                command: "LOGOUT".into(),
                reason: e.to_string(),
            })?
    }
}

// ── Protocol ────────────────────────────────────────────────────────

/// Lines and literals collected up to a tagged completion.
#[derive(Debug, Default)]
struct Response {
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// Blocking IMAP protocol state over any byte stream.
pub(crate) struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::CommandFailed {
                command: "greeting".into(),
                reason: line.trim_end().to_string(),
            })
        }
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        self.command("LOGIN", &format!("LOGIN {} {}", quote(user), quote(password)))
            .map(|_| ())
            .map_err(|e| match e {
                MailboxError::CommandFailed { reason, .. } => MailboxError::AuthFailed {
                    user: user.to_string(),
                    reason,
                },
                other => other,
            })
    }

    fn select(&mut self, name: &str) -> Result<(), MailboxError> {
        self.command("SELECT", &format!("SELECT {}", quote(name)))
            .map(|_| ())
            .map_err(|e| match e {
                MailboxError::CommandFailed { reason, .. } => MailboxError::OpenFailed {
                    name: name.to_string(),
                    reason,
                },
                other => other,
            })
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        let response = self.command("UID SEARCH", "UID SEARCH UNSEEN")?;
        let uids = parse_search(&response.untagged);
        debug!(count = uids.len(), "Unseen messages");
        Ok(uids)
    }

    fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailboxError> {
        let response = self.command("UID FETCH", &format!("UID FETCH {uid} BODY.PEEK[]"))?;
        let body = response
            .literals
            .into_iter()
            .next()
            .ok_or(MailboxError::MissingBody { uid })?;
        Ok(RawMessage { uid, body })
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.command("UID STORE", &format!("UID STORE {uid} +FLAGS (\\Seen)"))
            .map(|_| ())
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        match self.command("LOGOUT", "LOGOUT") {
            Ok(_) | Err(MailboxError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send one tagged command and read until its completion line.
    fn command(&mut self, label: &str, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        writer.flush()?;

        let prefix = format!("{tag} ");
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&prefix) {
                let status = status.trim_end();
                return if status.starts_with("OK") {
                    Ok(response)
                } else {
                    Err(MailboxError::CommandFailed {
                        command: label.to_string(),
                        reason: status.to_string(),
                    })
                };
            }
            if let Some(len) = literal_len(&line) {
                if len > MAX_LITERAL_BYTES {
                    return Err(MailboxError::CommandFailed {
                        command: label.to_string(),
                        reason: format!("literal of {len} bytes exceeds {MAX_LITERAL_BYTES}"),
                    });
                }
                let mut literal = vec![0_u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            if line.starts_with("* BYE") && label != "LOGOUT" {
                return Err(MailboxError::Closed);
            }
            response.untagged.push(line);
        }
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailboxError::Closed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Quote a string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Byte count of a `{n}` literal announced at the end of `line`.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` lines, in server order.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|t| t.parse().ok()))
        .collect()
}
