//! HTTP surface for spreadsheet chat.
//!
//! A thin JSON + Server-Sent Events layer over the session store and the
//! two orchestrators ([`ingest_upload`] and [`ask`]). Each session sits
//! behind its own async mutex, held for the whole upload or chat turn, so
//! one action runs at a time per session while sessions proceed in parallel.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sessions` | Create a session |
//! | `DELETE` | `/sessions/{id}` | Tear down a session and its cached indexes |
//! | `POST` | `/sessions/{id}/documents?name=<file>` | Upload a workbook (raw body) |
//! | `POST` | `/sessions/{id}/chat` | Ask a question; answer streams as SSE |
//! | `GET`  | `/sessions/{id}/messages` | Transcript and last sources |
//! | `POST` | `/sessions/{id}/reset` | Clear transcript and context |
//! | `GET`  | `/health` | Health check |
//!
//! # Chat stream
//!
//! `POST /sessions/{id}/chat` with `{"question": "..."}` answers with an
//! event stream: any number of `fragment` events (`{"text": "..."}`), then
//! exactly one `done` (`{"answer": "...", "sources": [...]}`) or `error`
//! (`{"code": "...", "message": "..."}`) event.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_active_document", "message": "no document loaded; upload a spreadsheet first" } }
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::ingest::{ingest_upload, Services, Upload};
use crate::models::{ChatMessage, RetrievedChunk, SessionId};
use crate::preview::Preview;
use crate::query::ask;
use crate::session::{SessionStore, SharedSession};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
    sessions: Arc<SessionStore>,
}

/// Build the application router. Exposed for in-process testing.
pub fn router(services: Arc<Services>) -> Router {
    let state = AppState {
        services,
        sessions: Arc::new(SessionStore::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sessions", post(handle_create_session))
        .route("/sessions/{id}", delete(handle_delete_session))
        .route(
            "/sessions/{id}/documents",
            post(handle_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/sessions/{id}/chat", post(handle_chat))
        .route("/sessions/{id}/messages", get(handle_messages))
        .route("/sessions/{id}/reset", post(handle_reset))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(services: Services) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let app = router(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    println!("sheetqa listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::UnsupportedFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Extraction { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::IndexBuild(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Generation(_) => StatusCode::BAD_GATEWAY,
            Error::DuplicateKey(_) | Error::NoActiveDocument => StatusCode::CONFLICT,
            Error::EmptyQuestion => StatusCode::BAD_REQUEST,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn lookup_session(state: &AppState, raw_id: &str) -> Result<SharedSession, AppError> {
    SessionId::parse(raw_id)
        .and_then(|id| state.sessions.get(id))
        .ok_or_else(|| not_found(format!("session not found: {}", raw_id)))
}

// ============ POST /sessions ============

#[derive(Serialize)]
struct SessionCreated {
    session_id: SessionId,
}

async fn handle_create_session(State(state): State<AppState>) -> impl IntoResponse {
    let session_id = state.sessions.get_or_create_session(None);
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

// ============ DELETE /sessions/{id} ============

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let removed = SessionId::parse(&id).is_some_and(|id| state.sessions.remove(id));
    if !removed {
        return Err(not_found(format!("session not found: {}", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /sessions/{id}/documents ============

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

#[derive(Serialize)]
struct UploadResponse {
    document: String,
    cached: bool,
    chunks: usize,
    preview: Preview,
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<UploadResponse>, AppError> {
    let name = params
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| bad_request("query parameter 'name' is required"))?;
    let session = lookup_session(&state, &id)?;
    let mut session = session.lock().await;

    let outcome = ingest_upload(&mut session, Upload::new(name, body.to_vec()), &state.services).await?;

    Ok(Json(UploadResponse {
        document: session.active_document().unwrap_or_default().to_string(),
        cached: outcome.cached,
        chunks: outcome.chunks,
        preview: outcome.preview,
    }))
}

// ============ POST /sessions/{id}/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
}

#[derive(Serialize)]
struct FragmentEvent<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct DoneEvent<'a> {
    answer: &'a str,
    sources: &'a [RetrievedChunk],
}

async fn handle_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session = lookup_session(&state, &id)?;
    if req.question.trim().is_empty() {
        return Err(Error::EmptyQuestion.into());
    }

    // Held by the turn task until the answer is complete.
    let mut guard = session.lock_owned().await;
    if guard.active_pipeline().is_none() {
        return Err(Error::NoActiveDocument.into());
    }

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        let fragment_tx = tx.clone();
        let mut sink = move |fragment: &str, _partial: &str| {
            if let Ok(event) = Event::default()
                .event("fragment")
                .json_data(FragmentEvent { text: fragment })
            {
                let _ = fragment_tx.send(event);
            }
        };

        let last = match ask(&mut guard, &req.question, &mut sink).await {
            Ok(answer) => Event::default().event("done").json_data(DoneEvent {
                answer: &answer.text,
                sources: &answer.sources,
            }),
            Err(err) => Event::default().event("error").json_data(ErrorDetail {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        };
        match last {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => tracing::error!(error = %e, "failed to encode final chat event"),
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ GET /sessions/{id}/messages ============

#[derive(Serialize)]
struct MessagesResponse {
    session_id: SessionId,
    active_document: Option<String>,
    messages: Vec<ChatMessage>,
    sources: Vec<RetrievedChunk>,
}

async fn handle_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, AppError> {
    let session = lookup_session(&state, &id)?;
    let session = session.lock().await;
    Ok(Json(MessagesResponse {
        session_id: session.id(),
        active_document: session.active_document().map(str::to_string),
        messages: session.transcript().to_vec(),
        sources: session.context().map(<[_]>::to_vec).unwrap_or_default(),
    }))
}

// ============ POST /sessions/{id}/reset ============

async fn handle_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = lookup_session(&state, &id)?;
    session.lock().await.reset();
    Ok(StatusCode::NO_CONTENT)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    model: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.services.generator.model_name().to_string(),
    })
}
