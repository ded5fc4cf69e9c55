//! Request authorization for the HTTP surface.
//!
//! Three credentials are accepted on the trigger endpoint: the scheduler
//! secret as a bearer token, an operator session token as a bearer token,
//! and the legacy secret in `x-imap-secret`. Admin endpoints take operator
//! sessions only.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::config::AuthConfig;
use crate::store::{OperatorSession, SessionStore};

/// Header carrying the legacy shared secret.
pub const LEGACY_SECRET_HEADER: &str = "x-imap-secret";

/// Who a request was authorized as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Scheduler,
    Operator { user_id: String },
    LegacySecret,
}

/// Bearer token from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authorize a trigger request. `None` means 401.
pub async fn authorize_trigger(
    headers: &HeaderMap,
    auth: &AuthConfig,
    sessions: Option<&dyn SessionStore>,
) -> Option<Principal> {
    if let Some(token) = bearer_token(headers) {
        if matches_secret(token, auth.cron_secret.as_ref()) {
            return Some(Principal::Scheduler);
        }
        if let Some(sessions) = sessions
            && let Some(session) = active_session(token, sessions).await
        {
            return Some(Principal::Operator {
                user_id: session.user_id,
            });
        }
    }

    let legacy = headers
        .get(LEGACY_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Some(secret) = legacy
        && matches_secret(secret, auth.legacy_secret.as_ref())
    {
        return Some(Principal::LegacySecret);
    }

    None
}

/// The operator session behind a bearer token, if it is still active.
pub async fn authorize_operator(
    headers: &HeaderMap,
    sessions: &dyn SessionStore,
) -> Option<OperatorSession> {
    let token = bearer_token(headers)?;
    active_session(token, sessions).await
}

async fn active_session(token: &str, sessions: &dyn SessionStore) -> Option<OperatorSession> {
    match sessions.find_active_session(token, Utc::now()).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Session lookup failed: {e}");
            None
        }
    }
}

/// An unset or empty secret never matches.
fn matches_secret(presented: &str, expected: Option<&SecretString>) -> bool {
    expected
        .map(|s| s.expose_secret())
        .is_some_and(|expected| !expected.is_empty() && presented == expected)
}
