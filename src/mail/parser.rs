//! Raw RFC 5322 message decoding.
//!
//! Pure functions over bytes: no I/O, no clock, same input gives the same
//! [`ParsedMessage`].

use std::sync::LazyLock;

use mail_parser::{MessageParser, PartType};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::ParseError;

/// Decoded fields of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// First `From` address. Empty when nothing address-like was found.
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    /// Plain text, or the HTML part with tags stripped, or empty.
    pub body_text: String,
    /// Whether `body_text` came from a `text/plain` part rather than HTML.
    pub has_plain_text: bool,
    pub body_html: Option<String>,
    /// `In-Reply-To` header as sent, trimmed. Not validated.
    pub reply_reference: Option<String>,
    /// Hex SHA-256 of the raw bytes.
    pub content_hash: String,
}

static EMAIL_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap()
});

/// `"Name" <addr>`, `<addr>` or a trailing bare address.
static FROM_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:\s*"?([^"<]+)"?\s*)?<([^>\s]+)>\s*$|([^\s<>@]+@[^\s<>@]+)$"#).unwrap()
});

static REPLY_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^_{2,}\s*$|^-{2,}\s*$|^From:\s.*$|^De:\s.*$|^On\s.+wrote:$|^>+|^Reply sent on\s.*$|^Summary of the original message$|^Received on\s.*$|^Assunto:\s.*$|^Enviado:\s.*$",
    )
    .unwrap()
});

static QUOTED_HTML: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<blockquote[\s\S]*?</blockquote>|<div class=["']?gmail_quote["']?[\s\S]*?</div>"#)
        .unwrap()
});

/// Decode a raw message.
///
/// Fails only when the input has no message structure at all.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let message = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Unrecognized)?;

    let first_from = message.from().and_then(|addr| addr.first());
    let sender_address = first_from
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_sender(message.header_raw("From").unwrap_or_default()));
    let sender_name = first_from
        .and_then(|a| a.name())
        .map(|s| s.trim().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty());

    let subject = message
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let body_html = message.body_html(0).map(|h| h.into_owned());
    // body_text(0) converts HTML when there is no text/plain part; only a real
    // plain part counts here.
    let plain_text = message
        .text_part(0)
        .filter(|part| matches!(part.body, PartType::Text(_)))
        .and_then(|_| message.body_text(0))
        .filter(|text| !text.trim().is_empty());
    let has_plain_text = plain_text.is_some();
    let body_text = match plain_text {
        Some(text) => text.into_owned(),
        None => body_html.as_deref().map(strip_html).unwrap_or_default(),
    };

    let reply_reference = message
        .header_raw("In-Reply-To")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| message.in_reply_to().as_text().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());

    Ok(ParsedMessage {
        sender_address,
        sender_name,
        subject,
        body_text,
        has_plain_text,
        body_html,
        reply_reference,
        content_hash: content_hash(raw),
    })
}

/// Hex SHA-256 of a raw message.
pub fn content_hash(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("{:x}", hasher.finalize())
}

/// Sender for a `From` header the MIME parser could not split: the first
/// email-looking substring, else the trimmed header.
fn fallback_sender(raw_from: &str) -> String {
    if let Some(m) = EMAIL_LIKE.find(raw_from) {
        return m.as_str().to_string();
    }
    raw_from.trim().to_string()
}

/// Split a free-form sender string, as webhook providers send it, into
/// address and display name.
pub fn parse_sender(from: &str) -> (String, Option<String>) {
    if let Some(caps) = FROM_FIELD.captures(from) {
        if let Some(address) = caps.get(2) {
            let name = caps
                .get(1)
                .map(|n| n.as_str().trim().to_string())
                .filter(|n| !n.is_empty());
            return (address.as_str().to_string(), name);
        }
        if let Some(address) = caps.get(3) {
            return (address.as_str().to_string(), None);
        }
    }
    (fallback_sender(from), None)
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The new part of a reply, with quoted history removed.
///
/// Cuts at the first attribution or separator line ("On ... wrote:", `>`
/// quotes, `From:` headers, underscore or dash rules, Outlook and Portuguese
/// client headers). Tries the text body, then the HTML body minus quoted
/// containers, then falls back to the whole text.
pub fn extract_reply(text: Option<&str>, html: Option<&str>) -> String {
    let text = text.map(|t| t.replace('\r', "")).filter(|t| !t.trim().is_empty());

    if let Some(text) = &text {
        let head = before_separator(text);
        if !head.is_empty() {
            return head.to_string();
        }
    }

    if let Some(html) = html {
        let unquoted = QUOTED_HTML.replace_all(html, "");
        let as_text = strip_tags_keep_lines(&unquoted.replace('\r', ""));
        let head = before_separator(&as_text);
        if !head.is_empty() {
            return head.to_string();
        }
    }

    match (text, html) {
        (Some(text), _) => text.trim().to_string(),
        (None, Some(html)) => strip_tags_keep_lines(html).trim().to_string(),
        (None, None) => String::new(),
    }
}

fn before_separator(text: &str) -> &str {
    REPLY_SEPARATOR
        .find(text)
        .map_or(text, |m| &text[..m.start()])
        .trim()
}

/// Remove tags without touching line structure, so separators still sit at
/// line starts.
fn strip_tags_keep_lines(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: &str, body: &str) -> Vec<u8> {
        format!("{headers}\r\n\r\n{body}").into_bytes()
    }

    // ── parse ───────────────────────────────────────────────────────

    #[test]
    fn parses_named_sender_and_subject() {
        let raw = message(
            "From: \"Jane Doe\" <jane@example.com>\r\nTo: office@example.org\r\nSubject: Question about my order",
            "Hello there",
        );
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.sender_address, "jane@example.com");
        assert_eq!(parsed.sender_name.as_deref(), Some("Jane Doe"));
        assert_eq!(parsed.subject.as_deref(), Some("Question about my order"));
        assert_eq!(parsed.body_text.trim(), "Hello there");
        assert!(parsed.reply_reference.is_none());
    }

    #[test]
    fn parses_bare_sender() {
        let raw = message("From: jane@example.com\r\nSubject: hi", "body");
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.sender_address, "jane@example.com");
        assert!(parsed.sender_name.is_none());
    }

    #[test]
    fn reply_reference_kept_verbatim() {
        let raw = message(
            "From: jane@example.com\r\nIn-Reply-To: <5f0c1f9e-2b1a-4c3d-9e8f-0a1b2c3d4e5f>",
            "Thanks!",
        );
        let parsed = parse(&raw).unwrap();
        assert_eq!(
            parsed.reply_reference.as_deref(),
            Some("<5f0c1f9e-2b1a-4c3d-9e8f-0a1b2c3d4e5f>")
        );
    }

    #[test]
    fn html_only_body_is_stripped() {
        let raw = message(
            "From: jane@example.com\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8",
            "<html><body><p>Hello <b>world</b></p></body></html>",
        );
        let parsed = parse(&raw).unwrap();
        assert!(parsed.body_text.contains("Hello"));
        assert!(parsed.body_text.contains("world"));
        assert!(!parsed.body_text.contains("<p>"));
        assert!(parsed.body_html.is_some());
        assert!(!parsed.has_plain_text);
    }

    #[test]
    fn plain_part_is_flagged() {
        let raw = message("From: jane@example.com\r\nSubject: hi", "Just text");
        let parsed = parse(&raw).unwrap();
        assert!(parsed.has_plain_text);
        assert_eq!(parsed.body_text.trim(), "Just text");
    }

    #[test]
    fn missing_body_is_empty_not_error() {
        let raw = b"From: jane@example.com\r\nSubject: nothing here\r\n\r\n".to_vec();
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.body_text.trim(), "");
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(parse(b""), Err(ParseError::Empty)));
        assert!(matches!(parse(b"  \r\n \t"), Err(ParseError::Empty)));
    }

    #[test]
    fn parse_is_deterministic() {
        let raw = message("From: Jane <jane@example.com>\r\nSubject: x", "body");
        assert_eq!(parse(&raw).unwrap(), parse(&raw).unwrap());
    }

    #[test]
    fn content_hash_distinguishes_messages() {
        let a = message("From: jane@example.com", "one");
        let b = message("From: jane@example.com", "two");
        assert_eq!(parse(&a).unwrap().content_hash, content_hash(&a));
        assert_ne!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn fallback_sender_finds_embedded_address() {
        assert_eq!(
            fallback_sender(" Jane Doe at jane@example.com (mobile)"),
            "jane@example.com"
        );
        assert_eq!(fallback_sender("  undisclosed  "), "undisclosed");
        assert_eq!(fallback_sender(""), "");
    }

    #[test]
    fn parse_sender_forms() {
        assert_eq!(
            parse_sender("\"Jane Doe\" <jane@example.com>"),
            ("jane@example.com".to_string(), Some("Jane Doe".to_string()))
        );
        assert_eq!(
            parse_sender("<jane@example.com>"),
            ("jane@example.com".to_string(), None)
        );
        assert_eq!(
            parse_sender("jane@example.com"),
            ("jane@example.com".to_string(), None)
        );
        assert_eq!(
            parse_sender("Jane (jane@example.com) via form"),
            ("jane@example.com".to_string(), None)
        );
        assert_eq!(parse_sender("  nobody  "), ("nobody".to_string(), None));
    }

    // ── strip_html ──────────────────────────────────────────────────

    #[test]
    fn strip_html_collapses_whitespace() {
        assert_eq!(strip_html("<p>Hello</p>\n\n<p>  world </p>"), "Hello world");
        assert_eq!(strip_html("plain"), "plain");
        assert_eq!(strip_html(""), "");
    }

    // ── extract_reply ───────────────────────────────────────────────

    #[test]
    fn extract_reply_cuts_at_attribution() {
        let text = "Sounds good!\r\n\r\nOn Mon, Jan 1, 2024 at 10:00 AM Staff <office@example.org> wrote:\r\n> Original";
        assert_eq!(extract_reply(Some(text), None), "Sounds good!");
    }

    #[test]
    fn extract_reply_cuts_at_quote_marker() {
        let text = "Yes please\n> quoted line\n> more";
        assert_eq!(extract_reply(Some(text), None), "Yes please");
    }

    #[test]
    fn extract_reply_cuts_at_outlook_header() {
        let text = "Obrigado\n\nDe: Escritorio <office@example.org>\nEnviado: segunda-feira\nAssunto: Re: pedido";
        assert_eq!(extract_reply(Some(text), None), "Obrigado");
    }

    #[test]
    fn extract_reply_cuts_at_rule() {
        let text = "See attached\n________________\nFrom: someone";
        assert_eq!(extract_reply(Some(text), None), "See attached");
    }

    #[test]
    fn extract_reply_falls_back_to_html() {
        let html = "<div>Thanks a lot</div><blockquote>old thread</blockquote>";
        assert_eq!(extract_reply(None, Some(html)), "Thanks a lot");
    }

    #[test]
    fn extract_reply_drops_gmail_quote() {
        let html = "<div dir=\"ltr\">Great</div><div class=\"gmail_quote\">On Tue wrote: old</div>";
        assert_eq!(extract_reply(Some("  "), Some(html)), "Great");
    }

    #[test]
    fn extract_reply_keeps_full_text_when_all_quoted() {
        let text = "> everything is quoted";
        assert_eq!(extract_reply(Some(text), None), "> everything is quoted");
    }

    #[test]
    fn extract_reply_nothing_is_empty() {
        assert_eq!(extract_reply(None, None), "");
    }
}
