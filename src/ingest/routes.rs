//! HTTP surface: The ingestion trigger, the inbound-email webhook and the
//! admin endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::ALLOW;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{self, Principal};
use crate::config::AuthConfig;
use crate::conversations::model::{ConversationMessage, MessageSelector};
use crate::conversations::resolver;
use crate::ingest::IngestService;
use crate::mail::parser::{self, ParsedMessage};
use crate::store::{ConversationStore, IngestionLog, LibSqlBackend, SessionStore};

/// Default page size for the audit listing.
pub const DEFAULT_LOG_LIMIT: u32 = 25;
/// Largest page the audit listing will return.
pub const MAX_LOG_LIMIT: u32 = 200;

/// Shared state for the ingestion routes.
#[derive(Clone)]
pub struct IngestRouteState {
    pub service: Arc<IngestService>,
    pub auth: Arc<AuthConfig>,
}

/// Build the ingestion router.
pub fn ingest_routes(state: IngestRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", any(trigger))
        .route("/api/inbound/email", any(inbound_email))
        .route("/api/admin/ingestion-log", get(list_log))
        .route("/api/admin/conversations", get(list_conversations))
        .route("/api/admin/conversations/{id}/read", post(mark_read))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

fn store_unavailable(e: impl std::fmt::Display) -> Response {
    error!("Store unavailable: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"ok": false, "error": e.to_string()})),
    )
        .into_response()
}

/// The store, or `None` when it cannot be opened.
async fn backend(state: &IngestRouteState) -> Option<Arc<LibSqlBackend>> {
    match state.service.store().get().await {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!("Store unavailable for authorization: {e}");
            None
        }
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// GET|POST /ingest
///
/// Runs one batch synchronously and reports the summary.
async fn trigger(
    State(state): State<IngestRouteState>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(ALLOW, "GET, POST")],
            Json(json!({"error": "Method Not Allowed"})),
        )
            .into_response();
    }

    let store = backend(&state).await;
    let sessions = store.as_deref().map(|b| b as &dyn SessionStore);
    let Some(principal) = auth::authorize_trigger(&headers, &state.auth, sessions).await else {
        return unauthorized();
    };
    match &principal {
        Principal::Operator { user_id } => info!(user_id = %user_id, "Ingestion triggered by operator"),
        other => info!(principal = ?other, "Ingestion triggered"),
    }

    match state.service.run_once().await {
        Ok(result) => Json(json!({"ok": true, "result": result})).into_response(),
        Err(e) => {
            error!("Ingestion run failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Webhook payload. Unknown fields (`to`, provider extras) are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEmail {
    from: Option<String>,
    subject: Option<String>,
    text: Option<String>,
    in_reply_to: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// POST /api/inbound/email
///
/// A reply a mail provider has already decoded, routed with the same rules
/// as mailbox ingestion and appended directly.
async fn inbound_email(
    State(state): State<IngestRouteState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(ALLOW, "POST")],
            Json(json!({"error": "Method Not Allowed"})),
        )
            .into_response();
    }

    let store = backend(&state).await;
    let sessions = store.as_deref().map(|b| b as &dyn SessionStore);
    if auth::authorize_trigger(&headers, &state.auth, sessions).await.is_none() {
        return unauthorized();
    }
    let Some(store) = store else {
        return store_unavailable("store could not be opened");
    };

    // A body that is not JSON is treated like an empty payload.
    let payload: InboundEmail = serde_json::from_slice(&body).unwrap_or_default();
    let text = non_empty(payload.text);
    let subject = non_empty(payload.subject);
    let Some(from) = non_empty(payload.from).filter(|_| text.is_some() || subject.is_some())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing required fields: from and text/subject"})),
        )
            .into_response();
    };

    let (sender_address, sender_name) = parser::parse_sender(&from);
    let parsed = ParsedMessage {
        sender_address,
        sender_name,
        body_text: text.or_else(|| subject.clone()).unwrap_or_default(),
        subject,
        has_plain_text: true,
        body_html: None,
        reply_reference: non_empty(payload.in_reply_to),
        content_hash: parser::content_hash(&body),
    };

    let resolution = match resolver::resolve(&parsed, store.as_ref()).await {
        Ok(resolution) => resolution,
        Err(e) => {
            error!("Inbound email resolution failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };
    let Some(conversation) = resolution.conversation else {
        info!(sender = %parsed.sender_address, "Inbound email matched no conversation");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No matching conversation for inbound email"})),
        )
            .into_response();
    };

    let sender = parsed
        .sender_name
        .clone()
        .unwrap_or_else(|| parsed.sender_address.clone());
    let message = ConversationMessage::inbound(parsed.body_text, sender)
        .with_subject(parsed.subject)
        .with_reply_to(resolution.reply_to_message_id);

    match store.append_message(conversation.id, &message).await {
        Ok(result) if result.modified => {
            info!(
                conversation_id = %conversation.id,
                strategy = ?resolution.strategy,
                "Inbound email appended"
            );
            (
                StatusCode::CREATED,
                Json(json!({
                    "appended": true,
                    "conversationId": conversation.id,
                    "reply": message,
                })),
            )
                .into_response()
        }
        Ok(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Failed to append inbound reply"})),
        )
            .into_response(),
        Err(e) => {
            error!(conversation_id = %conversation.id, "Inbound email append failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal error"})),
            )
                .into_response()
        }
    }
}

/// GET /api/admin/conversations
///
/// Every conversation with its timeline, most recently updated first.
async fn list_conversations(State(state): State<IngestRouteState>, headers: HeaderMap) -> Response {
    let store = match state.service.store().get().await {
        Ok(store) => store,
        Err(e) => return store_unavailable(e),
    };
    if auth::authorize_operator(&headers, store.as_ref()).await.is_none() {
        return unauthorized();
    }

    match store.list_conversations().await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => store_unavailable(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    page: Option<String>,
    limit: Option<String>,
}

impl LogQuery {
    /// Page is 1-based; junk falls back to the defaults, limit is clamped.
    fn bounds(&self) -> (u32, u32) {
        let page = self
            .page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);
        let limit = self
            .limit
            .as_deref()
            .and_then(|l| l.trim().parse::<i64>().ok())
            .map_or(DEFAULT_LOG_LIMIT, |l| {
                u32::try_from(l.clamp(1, i64::from(MAX_LOG_LIMIT))).unwrap_or(DEFAULT_LOG_LIMIT)
            });
        (page, limit)
    }
}

/// GET /api/admin/ingestion-log?page&limit
async fn list_log(
    State(state): State<IngestRouteState>,
    headers: HeaderMap,
    Query(query): Query<LogQuery>,
) -> Response {
    let store = match state.service.store().get().await {
        Ok(store) => store,
        Err(e) => return store_unavailable(e),
    };
    if auth::authorize_operator(&headers, store.as_ref()).await.is_none() {
        return unauthorized();
    }

    let (page, limit) = query.bounds();
    match store.list_entries(page, limit).await {
        Ok(log) => Json(json!({
            "ok": true,
            "page": page,
            "limit": limit,
            "total": log.total,
            "items": log.items,
        }))
        .into_response(),
        Err(e) => store_unavailable(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    message_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

/// POST /api/admin/conversations/{id}/read
///
/// Flags one message read, selected by id or, for older rows, by timestamp.
async fn mark_read(
    State(state): State<IngestRouteState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ReadRequest>,
) -> Response {
    let store = match state.service.store().get().await {
        Ok(store) => store,
        Err(e) => return store_unavailable(e),
    };
    if auth::authorize_operator(&headers, store.as_ref()).await.is_none() {
        return unauthorized();
    }

    let Ok(conversation_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid conversation id"})),
        )
            .into_response();
    };

    let selector = match (req.message_id.filter(|m| !m.trim().is_empty()), req.created_at) {
        (Some(message_id), _) => MessageSelector::Id(message_id),
        (None, Some(created_at)) => MessageSelector::CreatedAt(created_at),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "messageId or createdAt is required"})),
            )
                .into_response();
        }
    };

    match store.mark_message_read(conversation_id, &selector).await {
        Ok(result) if result.matched => Json(json!({"matched": true})).into_response(),
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"matched": false, "error": "Message not found"})),
        )
            .into_response(),
        Err(e) => store_unavailable(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::IngestPolicy;
    use crate::error::MailboxError;
    use crate::mail::{Mailbox, MailboxConnector};
    use crate::store::StoreHandle;

    struct Unreachable;

    #[async_trait]
    impl MailboxConnector for Unreachable {
        async fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError> {
            Err(MailboxError::Closed)
        }
    }

    async fn app() -> Router {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let service = IngestService::new(
            Arc::new(StoreHandle::from_backend(backend)),
            Arc::new(Unreachable),
            "INBOX",
            IngestPolicy::default(),
        );
        ingest_routes(IngestRouteState {
            service: Arc::new(service),
            auth: Arc::new(AuthConfig {
                cron_secret: Some("cron".to_string().into()),
                legacy_secret: None,
            }),
        })
    }

    #[tokio::test]
    async fn health_ok() {
        let resp = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn other_methods_get_405_with_allow() {
        let resp = app()
            .await
            .oneshot(Request::delete("/ingest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get(ALLOW).unwrap(), "GET, POST");
    }

    #[tokio::test]
    async fn trigger_without_credentials_is_401() {
        let resp = app()
            .await
            .oneshot(Request::post("/ingest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_reports_fatal_failure_as_500() {
        let resp = app()
            .await
            .oneshot(
                Request::get("/ingest")
                    .header("authorization", "Bearer cron")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn inbound_email_rejects_other_methods() {
        let resp = app()
            .await
            .oneshot(Request::get("/api/inbound/email").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get(ALLOW).unwrap(), "POST");
    }

    #[tokio::test]
    async fn inbound_email_requires_credentials() {
        let resp = app()
            .await
            .oneshot(
                Request::post("/api/inbound/email")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"from":"a@b.c","text":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn inbound_email_missing_fields_is_400() {
        for body in [r#"{"text":"hi"}"#, r#"{"from":"a@b.c"}"#, "not json"] {
            let resp = app()
                .await
                .oneshot(
                    Request::post("/api/inbound/email")
                        .header("authorization", "Bearer cron")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
        }
    }

    #[tokio::test]
    async fn admin_log_requires_session() {
        let resp = app()
            .await
            .oneshot(
                Request::get("/api/admin/ingestion-log")
                    .header("authorization", "Bearer cron")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn log_query_bounds() {
        let q = |page: Option<&str>, limit: Option<&str>| {
            LogQuery {
                page: page.map(str::to_string),
                limit: limit.map(str::to_string),
            }
            .bounds()
        };
        assert_eq!(q(None, None), (1, 25));
        assert_eq!(q(Some("3"), Some("50")), (3, 50));
        assert_eq!(q(Some("0"), Some("1000")), (1, 200));
        assert_eq!(q(Some("abc"), Some("-4")), (1, 1));
        assert_eq!(q(Some("2"), Some("x")), (2, 25));
    }
}
