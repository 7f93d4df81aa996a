//! Admin API endpoints
//!
//! Drives the server from the operator side: accounts, posting, follows,
//! relays and the delivery queue. All routes require the admin token.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::Admin;
use crate::data::{DeliveryQueueItem, Follow, LocalAccount, Note, Relay};
use crate::error::AppError;
use crate::federation::{Thread, TickReport};

const DEFAULT_QUEUE_LIST_LIMIT: u32 = 50;
const MAX_QUEUE_LIST_LIMIT: u32 = 500;

/// Create admin router
///
/// Routes:
/// - POST /admin/accounts - Create local account
/// - POST /admin/accounts/:username/notes - Post a note
/// - PUT /admin/accounts/:username/notes/:id - Edit a note
/// - DELETE /admin/accounts/:username/notes/:id - Delete a note
/// - POST /admin/accounts/:username/follow - Follow a remote handle or URI
/// - POST /admin/accounts/:username/unfollow - Unfollow
/// - POST /admin/accounts/:username/like - Like an object
/// - POST /admin/accounts/:username/unlike - Remove a like
/// - POST /admin/accounts/:username/boost - Boost an object (local only)
/// - POST /admin/accounts/:username/unboost - Remove a boost
/// - GET /admin/relays - List relays
/// - POST /admin/relays - Subscribe to a relay
/// - DELETE /admin/relays/:id - Unsubscribe
/// - POST /admin/relays/:id/retry - Retry a failed subscription
/// - GET /admin/queue - Queue depth and items
/// - POST /admin/queue/tick - Run one delivery tick now
/// - GET /admin/thread - Reconstruct a thread
pub fn admin_router() -> Router<AppState> {
    Router::new()
        // Accounts and notes
        .route("/accounts", post(create_account))
        .route("/accounts/:username/notes", post(create_note))
        .route(
            "/accounts/:username/notes/:id",
            put(update_note).delete(delete_note),
        )
        // Social graph
        .route("/accounts/:username/follow", post(follow))
        .route("/accounts/:username/unfollow", post(unfollow))
        .route("/accounts/:username/like", post(like))
        .route("/accounts/:username/unlike", post(unlike))
        .route("/accounts/:username/boost", post(boost))
        .route("/accounts/:username/unboost", post(unboost))
        // Relays
        .route("/relays", get(list_relays).post(subscribe_relay))
        .route("/relays/:id", delete(unsubscribe_relay))
        .route("/relays/:id/retry", post(retry_relay))
        // Delivery queue
        .route("/queue", get(queue))
        .route("/queue/tick", post(queue_tick))
        // Threads
        .route("/thread", get(thread))
}

fn require_federation(state: &AppState) -> Result<(), AppError> {
    if state.config.federation.enabled {
        Ok(())
    } else {
        Err(AppError::FederationDisabled)
    }
}

// =============================================================================
// Accounts and notes
// =============================================================================

/// Create account request
#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    username: String,
    display_name: Option<String>,
    summary: Option<String>,
}

/// POST /admin/accounts
async fn create_account(
    State(state): State<AppState>,
    _admin: Admin,
    Json(req): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<LocalAccount>), AppError> {
    let account = state
        .accounts
        .create(&req.username, req.display_name, req.summary)
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// Note request
#[derive(Debug, Deserialize)]
struct NoteRequest {
    content: String,
    in_reply_to: Option<String>,
}

/// POST /admin/accounts/:username/notes
async fn create_note(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<NoteRequest>,
) -> Result<(StatusCode, Json<Note>), AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let note = state
        .notes
        .create(&account.id, &req.content, req.in_reply_to)
        .await?;
    Ok((StatusCode::CREATED, Json(note)))
}

/// PUT /admin/accounts/:username/notes/:id
async fn update_note(
    State(state): State<AppState>,
    _admin: Admin,
    Path((username, id)): Path<(String, String)>,
    Json(req): Json<NoteRequest>,
) -> Result<Json<Note>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let note = state.notes.update(&account.id, &id, &req.content).await?;
    Ok(Json(note))
}

/// DELETE /admin/accounts/:username/notes/:id
async fn delete_note(
    State(state): State<AppState>,
    _admin: Admin,
    Path((username, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    state.notes.delete(&account.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Social graph
// =============================================================================

/// Follow request; `target` is `user@domain` or an actor URI
#[derive(Debug, Deserialize)]
struct TargetRequest {
    target: String,
}

/// Object request; `object` is a note URI, local or remote
#[derive(Debug, Deserialize)]
struct ObjectRequest {
    object: String,
}

/// Whether the call changed anything
#[derive(Debug, Serialize)]
struct ChangedResponse {
    changed: bool,
}

/// POST /admin/accounts/:username/follow
async fn follow(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Follow>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let follow = state.social.follow(&account.id, &req.target).await?;
    Ok(Json(follow))
}

/// POST /admin/accounts/:username/unfollow
async fn unfollow(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<ChangedResponse>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let changed = state.social.unfollow(&account.id, &req.target).await?;
    Ok(Json(ChangedResponse { changed }))
}

/// POST /admin/accounts/:username/like
async fn like(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<ObjectRequest>,
) -> Result<Json<ChangedResponse>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let changed = state.notes.like(&account.id, &req.object).await?;
    Ok(Json(ChangedResponse { changed }))
}

/// POST /admin/accounts/:username/unlike
async fn unlike(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<ObjectRequest>,
) -> Result<Json<ChangedResponse>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let changed = state.notes.unlike(&account.id, &req.object).await?;
    Ok(Json(ChangedResponse { changed }))
}

/// POST /admin/accounts/:username/boost
async fn boost(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<ObjectRequest>,
) -> Result<Json<ChangedResponse>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let changed = state.notes.boost(&account.id, &req.object).await?;
    Ok(Json(ChangedResponse { changed }))
}

/// POST /admin/accounts/:username/unboost
async fn unboost(
    State(state): State<AppState>,
    _admin: Admin,
    Path(username): Path<String>,
    Json(req): Json<ObjectRequest>,
) -> Result<Json<ChangedResponse>, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let changed = state.notes.unboost(&account.id, &req.object).await?;
    Ok(Json(ChangedResponse { changed }))
}

// =============================================================================
// Relays
// =============================================================================

/// Subscribe request; `url` is a relay domain or actor URL
#[derive(Debug, Deserialize)]
struct SubscribeRelayRequest {
    url: String,
}

/// GET /admin/relays
async fn list_relays(
    State(state): State<AppState>,
    _admin: Admin,
) -> Result<Json<Vec<Relay>>, AppError> {
    Ok(Json(state.relays.list().await?))
}

/// POST /admin/relays
async fn subscribe_relay(
    State(state): State<AppState>,
    _admin: Admin,
    Json(req): Json<SubscribeRelayRequest>,
) -> Result<(StatusCode, Json<Relay>), AppError> {
    require_federation(&state)?;
    let relay = state.relays.subscribe(&req.url).await?;
    Ok((StatusCode::CREATED, Json(relay)))
}

/// DELETE /admin/relays/:id
async fn unsubscribe_relay(
    State(state): State<AppState>,
    _admin: Admin,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    require_federation(&state)?;
    state.relays.unsubscribe(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/relays/:id/retry
async fn retry_relay(
    State(state): State<AppState>,
    _admin: Admin,
    Path(id): Path<String>,
) -> Result<Json<Relay>, AppError> {
    require_federation(&state)?;
    Ok(Json(state.relays.retry(&id).await?))
}

// =============================================================================
// Delivery queue
// =============================================================================

#[derive(Debug, Deserialize)]
struct QueueQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct QueueResponse {
    depth: i64,
    items: Vec<DeliveryQueueItem>,
}

/// GET /admin/queue
async fn queue(
    State(state): State<AppState>,
    _admin: Admin,
    Query(query): Query<QueueQuery>,
) -> Result<Json<QueueResponse>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_QUEUE_LIST_LIMIT)
        .clamp(1, MAX_QUEUE_LIST_LIMIT);
    let depth = state.queue.depth().await?;
    let items = state.store.list_deliveries(limit).await?;
    Ok(Json(QueueResponse { depth, items }))
}

/// POST /admin/queue/tick
///
/// Delivers whatever is due without waiting for the next interval.
async fn queue_tick(
    State(state): State<AppState>,
    _admin: Admin,
) -> Result<Json<TickReport>, AppError> {
    require_federation(&state)?;
    Ok(Json(state.worker.tick(Utc::now()).await?))
}

// =============================================================================
// Threads
// =============================================================================

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    uri: String,
}

/// GET /admin/thread?uri=
async fn thread(
    State(state): State<AppState>,
    _admin: Admin,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Thread>, AppError> {
    Ok(Json(state.threads.resolve_thread(&query.uri).await?))
}
