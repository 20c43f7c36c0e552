//! HTTP and WebSocket routes.
//!
//! Every route but `/health` requires an API key, sent as a bearer token or,
//! for WebSocket clients, as a `key` query parameter. The key decides the
//! caller's owner id, and the owner rules below apply on top of the store's
//! own access policy:
//!
//! - creates must carry the caller's `owner_id`
//! - reads, updates and deletes only reach the caller's own documents
//! - an update may not hand a document to another owner
//! - queries and live queries only return the caller's own documents

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use medisync_core::remote::protocol::{
    ClientFrame, CreateRequest, CreatedResponse, ErrorBody, ErrorCode, MeResponse, QueryRequest,
    QueryResponse, ServerFrame,
};
use medisync_core::remote::OWNER_FIELD;
use medisync_core::{Document, Fields, MemoryStore, OwnerId, Query, RemoteError, RemoteStore};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::config::ApiKeyStore;
use crate::storage::{is_valid_collection, CollectionStorage};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub store: MemoryStore,
    /// `None` keeps everything in memory
    pub storage: Option<CollectionStorage>,
}

impl AppState {
    fn persist(&self, collection: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(collection, &self.store.documents(collection)) {
                tracing::error!("Failed to persist {}: {}", collection, e);
            }
        }
    }
}

/// Error response carrying an [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::PermissionDenied, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorCode::PermissionDenied, message)
    }

    fn not_found(collection: &str, id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("{}/{} not found", collection, id),
        )
    }
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        let code = ErrorCode::from(&err);
        let status = match code {
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/me", get(me))
        .route("/collections/{collection}/documents", post(create_document))
        .route(
            "/collections/{collection}/documents/{id}",
            get(get_document)
                .patch(update_document)
                .delete(delete_document),
        )
        .route("/collections/{collection}/query", post(query_documents))
        .route("/collections/{collection}/listen", get(listen))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Authentication
// ============================================================================

/// API key from the `key` query parameter.
fn query_key(request: &Request) -> Option<String> {
    request.uri().query()?.split('&').find_map(|pair| {
        let value = pair.strip_prefix("key=")?;
        Some(
            urlencoding::decode(value)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| value.to_string()),
        )
    })
}

/// Authentication middleware
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(key) => key.to_string(),
            None => {
                return ApiError::unauthorized("Authorization header must use Bearer scheme")
                    .into_response();
            }
        },
        None => match query_key(&request) {
            Some(key) => key,
            None => return ApiError::unauthorized("Authorization header required").into_response(),
        },
    };

    match state.api_keys.validate(&api_key) {
        Some(owner) => {
            request.extensions_mut().insert(owner);
            next.run(request).await
        }
        None => ApiError::unauthorized("Invalid API key").into_response(),
    }
}

// ============================================================================
// Owner rules
// ============================================================================

fn check_collection(collection: &str) -> Result<(), ApiError> {
    if is_valid_collection(collection) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest,
            format!("Invalid collection name: {}", collection),
        ))
    }
}

fn is_owned_by(doc: &Document, owner: &OwnerId) -> bool {
    doc.owner_id() == Some(owner.as_str())
}

/// Rejects an `owner_id` in `fields` naming someone other than the caller.
fn check_owner_field(fields: &Fields, owner: &OwnerId, required: bool) -> Result<(), ApiError> {
    match fields.get(OWNER_FIELD) {
        Some(Value::String(id)) if id == owner.as_str() => Ok(()),
        None if !required => Ok(()),
        _ => Err(ApiError::forbidden("owner_id must match the caller")),
    }
}

/// Rejects a filter on `owner_id` naming someone other than the caller.
fn check_filter(query: &Query, owner: &OwnerId) -> Result<(), ApiError> {
    match &query.filter {
        Some(filter)
            if filter.field == OWNER_FIELD && filter.value.as_str() != Some(owner.as_str()) =>
        {
            Err(ApiError::forbidden("Cannot query documents of another owner"))
        }
        _ => Ok(()),
    }
}

/// Fetches a document the caller owns.
async fn owned_document(
    state: &AppState,
    collection: &str,
    id: &str,
    owner: &OwnerId,
) -> Result<Document, ApiError> {
    match state.store.get(collection, id).await? {
        Some(doc) if is_owned_by(&doc, owner) => Ok(doc),
        Some(_) => Err(ApiError::forbidden("Missing or insufficient permissions.")),
        None => Err(ApiError::not_found(collection, id)),
    }
}

fn retain_owned(docs: Vec<Document>, owner: &OwnerId) -> Vec<Document> {
    docs.into_iter().filter(|d| is_owned_by(d, owner)).collect()
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn me(Extension(owner): Extension<OwnerId>) -> Json<MeResponse> {
    Json(MeResponse {
        owner_id: owner.to_string(),
    })
}

async fn create_document(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(collection): Path<String>,
    Json(fields): Json<CreateRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    check_collection(&collection)?;
    check_owner_field(&fields, &owner, true)?;

    let id = state.store.add(&collection, fields).await?;
    state.persist(&collection);
    tracing::info!("{} created {}/{}", owner, collection, id);
    Ok(Json(CreatedResponse { id }))
}

async fn get_document(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Document>, ApiError> {
    check_collection(&collection)?;
    let doc = owned_document(&state, &collection, &id, &owner).await?;
    Ok(Json(doc))
}

async fn update_document(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path((collection, id)): Path<(String, String)>,
    Json(fields): Json<Fields>,
) -> Result<StatusCode, ApiError> {
    check_collection(&collection)?;
    check_owner_field(&fields, &owner, false)?;
    owned_document(&state, &collection, &id, &owner).await?;

    state.store.update(&collection, &id, fields).await?;
    state.persist(&collection);
    tracing::debug!("{} updated {}/{}", owner, collection, id);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_document(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    check_collection(&collection)?;
    owned_document(&state, &collection, &id, &owner).await?;

    state.store.delete(&collection, &id).await?;
    state.persist(&collection);
    tracing::info!("{} deleted {}/{}", owner, collection, id);
    Ok(StatusCode::NO_CONTENT)
}

async fn query_documents(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(collection): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    check_collection(&collection)?;
    let query = Query {
        collection,
        filter: request.filter,
    };
    check_filter(&query, &owner)?;

    let documents = retain_owned(state.store.query(&query).await?, &owner);
    Ok(Json(QueryResponse { documents }))
}

async fn listen(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(collection): Path<String>,
) -> Response {
    if let Err(e) = check_collection(&collection) {
        return e.into_response();
    }
    ws.on_upgrade(move |socket| serve_listener(socket, state, collection, owner))
}

// ============================================================================
// Live queries
// ============================================================================

type FrameSink = SplitSink<WebSocket, Message>;

/// Sends a frame; returns false once the client is gone.
async fn send_frame(sender: &mut FrameSink, frame: &ServerFrame) -> bool {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            return false;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

async fn serve_listener(socket: WebSocket, state: AppState, collection: String, owner: OwnerId) {
    let (mut sender, mut receiver) = socket.split();

    let filter = match receiver.next().await {
        Some(Ok(Message::Text(text))) => match ClientFrame::decode(text.as_str()) {
            Ok(ClientFrame::Listen { filter }) => filter,
            Err(e) => {
                let frame = ServerFrame::Error {
                    code: ErrorCode::BadRequest,
                    message: format!("Invalid listen frame: {}", e),
                };
                send_frame(&mut sender, &frame).await;
                return;
            }
        },
        _ => return,
    };

    let query = Query { collection, filter };
    if let Err(e) = check_filter(&query, &owner) {
        let frame = ServerFrame::Error {
            code: e.code,
            message: e.message,
        };
        send_frame(&mut sender, &frame).await;
        return;
    }

    let mut live = match state.store.listen(&query).await {
        Ok(live) => live,
        Err(e) => {
            tracing::debug!("Rejected live query on {} for {}: {}", query.collection, owner, e);
            send_frame(&mut sender, &ServerFrame::error(&e)).await;
            return;
        }
    };
    tracing::debug!("{} listening on {}", owner, query.collection);

    loop {
        tokio::select! {
            update = live.next() => match update {
                Some(Ok(docs)) => {
                    let frame = ServerFrame::Snapshot {
                        documents: retain_owned(docs, &owner),
                    };
                    if !send_frame(&mut sender, &frame).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    send_frame(&mut sender, &ServerFrame::error(&e)).await;
                    break;
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("{} stopped listening on {}", owner, query.collection);
}
