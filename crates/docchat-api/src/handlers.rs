//! Route handler functions for all API endpoints.
//!
//! Each handler extracts path parameters and JSON bodies via axum
//! extractors, interacts with AppState services, and returns JSON or
//! server-sent event responses.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use docchat_backend::{
    reveal_words, ChatQuery, CrawlRequest, PollHandle, ProgressReport, RelayResponse,
};
use docchat_core::session::{Session, SessionGate, SessionState, User};
use docchat_core::types::{Conversation, Document, Message, NewMessage, Role};
use docchat_storage::message_for;

use crate::auth::resolve_session;
use crate::error::ApiError;
use crate::state::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UrlRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub top_k: Option<u32>,
}

/// Raw message insert; every field is checked before the store is touched.
#[derive(Debug, Default, Deserialize)]
pub struct InsertMessageRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: Session,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub user_message: Message,
    pub assistant_message: Message,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub conversation: Conversation,
    pub doc_id: String,
}

// =============================================================================
// Health
// =============================================================================

/// GET /health - liveness and uptime.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Relay routes
// =============================================================================

fn relayed(resp: RelayResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(resp.body)).into_response()
}

/// Check that a relay body is JSON, whatever its Content-Type says.
fn json_body(body: &Bytes) -> Result<(), ApiError> {
    serde_json::from_slice::<serde::de::IgnoredAny>(body)
        .map(|_| ())
        .map_err(|e| ApiError::BadRequest(format!("Request body is not valid JSON: {}", e)))
}

/// POST /api/chat - forward to the backend's `/chat`.
pub async fn relay_chat(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    json_body(&body)?;
    let resp = state.backend.relay_bytes("/chat", body).await?;
    debug!(status = resp.status, "Chat relayed");
    Ok(relayed(resp))
}

/// POST /api/crawl_docs_proxy - forward to the backend's `/crawl_docs`.
pub async fn relay_crawl_docs(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    json_body(&body)?;
    let resp = state.backend.relay_bytes("/crawl_docs", body).await?;
    debug!(status = resp.status, "Crawl request relayed");
    Ok(relayed(resp))
}

/// GET /api/document_status/{id} - forward to `/document_status/{id}`.
///
/// The id is sent as a single encoded path segment.
pub async fn relay_document_status(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Response, ApiError> {
    let resp = state.backend.relay_document_status(&doc_id).await?;
    Ok(relayed(resp))
}

/// Progress reports that stop the poller when the client goes away.
struct ProgressStream {
    reports: UnboundedReceiverStream<ProgressReport>,
    _poll: PollHandle,
}

impl Stream for ProgressStream {
    type Item = ProgressReport;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.reports).poll_next(cx)
    }
}

/// GET /api/document_status/{id}/progress - SSE of crawl progress.
///
/// Emits one `progress` event per successful status fetch and closes after
/// the `completed` report.
pub async fn document_progress(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
    let (tx, rx) = mpsc::unbounded_channel();
    let poll = state.poller.start(doc_id.clone(), move |report| {
        let _ = tx.send(report);
    });
    info!(
        doc_id = %doc_id,
        interval_ms = state.poller.interval().as_millis() as u64,
        "Progress stream opened"
    );

    let stream = ProgressStream {
        reports: UnboundedReceiverStream::new(rx),
        _poll: poll,
    }
    .map(|report| {
        let data = serde_json::to_string(&report).unwrap_or_default();
        Ok(Event::default().event("progress").data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

// =============================================================================
// Auth
// =============================================================================

/// POST /auth/signup - create an account.
pub async fn sign_up(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let outcome = state.auth.sign_up(&req.email, &req.password).await?;
    Ok((
        StatusCode::CREATED,
        Json(UserResponse { user: outcome.user }),
    ))
}

/// POST /auth/signin - exchange credentials for a session.
pub async fn sign_in(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.auth.sign_in(&req.email, &req.password).await?;
    Ok(Json(SessionResponse { session }))
}

/// POST /auth/confirm - confirm an e-mail address.
pub async fn confirm_email(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state.auth.confirm_email(&req.token).await?;
    Ok(Json(UserResponse { user }))
}

/// POST /auth/resend - issue a new confirmation token.
pub async fn resend_confirmation(
    State(state): State<AppState>,
    Json(req): Json<ResendRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.auth.resend_confirmation(&req.email).await?;
    Ok(Json(StatusResponse::ok()))
}

/// GET /auth/session - the caller's session state.
pub async fn current_session(Extension(session): Extension<Session>) -> Json<SessionState> {
    Json(SessionState {
        user: Some(session.user),
        loading: false,
    })
}

/// POST /auth/signout - end the caller's session.
pub async fn sign_out(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.auth.sign_out(&session.access_token).await?;
    Ok(Json(StatusResponse::ok()))
}

// =============================================================================
// Conversations
// =============================================================================

fn required_url(req: UrlRequest) -> Result<String, ApiError> {
    req.url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'url' in request body.".to_string()))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("Invalid {} id: {}", what, raw)))
}

/// Load a conversation owned by `user`, or 404.
fn owned_conversation(
    state: &AppState,
    id: Uuid,
    user: &User,
) -> Result<Conversation, ApiError> {
    state
        .conversations
        .get_for_user(id, user.id)?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {} not found", id)))
}

fn conversation_document(
    state: &AppState,
    conversation: &Conversation,
) -> Result<Document, ApiError> {
    let id = conversation.document_id;
    state
        .documents
        .get(id)?
        .ok_or_else(|| ApiError::NotFound(format!("Document {} not found", id)))
}

/// POST /api/conversations - start a conversation over a URL.
///
/// Reuses the caller's existing document for the URL when there is one.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<UrlRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let url = required_url(req)?;
    let (document, _) = state.documents.find_or_create(session.user.id, &url)?;
    let conversation = state.conversations.create(document.id, session.user.id)?;
    info!(conversation_id = %conversation.id, url = %url, "Conversation started");
    Ok(Json(ConversationResponse { conversation }))
}

/// GET /api/conversations - the caller's conversations, newest first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<ConversationsResponse>, ApiError> {
    let conversations = state.conversations.list_for_user(session.user.id)?;
    Ok(Json(ConversationsResponse { conversations }))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let id = parse_id(&id, "conversation")?;
    let conversation = owned_conversation(&state, id, &session.user)?;
    Ok(Json(ConversationResponse { conversation }))
}

/// GET /api/conversations/{id}/messages - oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let id = parse_id(&id, "conversation")?;
    let conversation = owned_conversation(&state, id, &session.user)?;
    let messages = state.messages.list_for_conversation(conversation.id)?;
    Ok(Json(MessagesResponse { messages }))
}

/// GET /api/conversations/{id}/stream - SSE of messages inserted from now on.
///
/// The stream follows the caller's session and ends with a `signed_out`
/// event when that session signs out.
pub async fn conversation_stream(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let id = parse_id(&id, "conversation")?;
    let conversation = owned_conversation(&state, id, &session.user)?;

    let mut rows = state.feed.subscribe();
    debug!(
        conversation_id = %conversation.id,
        subscribers = state.feed.subscriber_count(),
        "Message stream opened"
    );
    let gate = SessionGate::mount(state.auth.clone(), session.access_token.clone());
    let mut session_state = gate.watch();
    let (tx, rx) = mpsc::channel::<Event>(32);
    let conversation_id = conversation.id;

    tokio::spawn(async move {
        let _gate = gate;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                changed = session_state.changed() => {
                    let signed_out = changed.is_err() || session_state.borrow().is_signed_out();
                    if signed_out {
                        debug!(%conversation_id, "Session ended, closing message stream");
                        let _ = tx.send(Event::default().event("signed_out").data("{}")).await;
                        break;
                    }
                }
                row = rows.recv() => match row {
                    Ok(row) => {
                        let Some(message) = message_for(row, conversation_id) else {
                            continue;
                        };
                        let data = serde_json::to_string(&message).unwrap_or_default();
                        if tx.send(Event::default().event("message").data(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%conversation_id, skipped, "Message stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

/// Shared body of `ask` and `ask_stream`: store the question, get the
/// answer from the backend, store the answer.
async fn answer_question(
    state: &AppState,
    session: &Session,
    id: &str,
    req: AskRequest,
) -> Result<AskResponse, ApiError> {
    let id = parse_id(id, "conversation")?;
    let query = req
        .query
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'query' in request body.".to_string()))?;
    let conversation = owned_conversation(state, id, &session.user)?;
    let document = conversation_document(state, &conversation)?;

    let user_message = state
        .messages
        .append(&NewMessage::user(conversation.id, query.clone()))?;

    let chat = ChatQuery {
        doc_id: document.chat_doc_id(),
        query,
        top_k: req.top_k.unwrap_or(state.config.backend.default_top_k),
    };
    let answer = state.backend.chat(&chat).await.map_err(|e| {
        warn!(conversation_id = %conversation.id, error = %e, "Chat request failed");
        ApiError::from(e)
    })?;

    let assistant_message = state
        .messages
        .append(&NewMessage::assistant(conversation.id, answer.answer.clone()))?;

    Ok(AskResponse {
        answer: answer.answer,
        user_message,
        assistant_message,
    })
}

/// POST /api/conversations/{id}/ask
pub async fn ask(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let resp = answer_question(&state, &session, &id, req).await?;
    Ok(Json(resp))
}

/// POST /api/conversations/{id}/ask/stream - the answer revealed word by word.
///
/// Emits `delta` events carrying the growing answer, then one `done` event
/// with the stored assistant message.
pub async fn ask_stream(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let resp = answer_question(&state, &session, &id, req).await?;

    let done = serde_json::to_string(&resp.assistant_message).unwrap_or_default();
    let stream = reveal_words(&resp.answer, state.reveal_delay())
        .map(|prefix| Event::default().event("delta").data(prefix))
        .chain(tokio_stream::once(Event::default().event("done").data(done)))
        .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

/// POST /api/messages - append a raw message to one of the caller's
/// conversations.
///
/// The body is validated before the caller is authenticated, so a request
/// missing a field gets 400 even without a session.
pub async fn insert_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InsertMessageRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let present = |v: Option<String>| v.filter(|s| !s.is_empty());
    let (Some(conversation_id), Some(role), Some(content)) = (
        present(req.conversation_id),
        present(req.role),
        present(req.content),
    ) else {
        return Err(ApiError::BadRequest(
            "Missing conversation_id, role, or content".to_string(),
        ));
    };
    let role: Role = role.parse()?;
    let conversation_id = parse_id(&conversation_id, "conversation")?;

    let session = resolve_session(&state, &headers).await?;
    let conversation = owned_conversation(&state, conversation_id, &session.user)?;
    state.messages.append(&NewMessage {
        conversation_id: conversation.id,
        role,
        content,
    })?;
    Ok(Json(StatusResponse::ok()))
}

/// POST /api/ingest - crawl a URL and open a conversation over it.
pub async fn ingest(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<UrlRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let url = required_url(req)?;
    let accepted = state
        .backend
        .crawl_docs(&CrawlRequest {
            base_url: url.clone(),
            user_id: session.user.id.to_string(),
        })
        .await
        .map_err(|e| {
            warn!(url = %url, error = %e, "Crawl request failed");
            ApiError::from(e)
        })?;

    let (document, created) = state.documents.find_or_create(session.user.id, &url)?;
    let document = state.documents.attach_backend_id(document.id, &accepted.doc_id)?;
    let conversation = state.conversations.create(document.id, session.user.id)?;
    info!(
        conversation_id = %conversation.id,
        doc_id = %accepted.doc_id,
        new_document = created,
        "Documentation ingested"
    );

    Ok(Json(IngestResponse {
        conversation,
        doc_id: accepted.doc_id,
    }))
}
