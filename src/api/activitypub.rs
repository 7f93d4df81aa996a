//! ActivityPub endpoints
//!
//! - Actor profiles (users and the instance actor)
//! - Inboxes (activity receiving)
//! - Outbox
//! - Followers/Following collections
//! - Notes and their replies

use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::{
    Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::data::LocalAccount;
use crate::error::AppError;
use crate::federation::delivery::{PUBLIC_AUDIENCE, builder};
use crate::federation::signature::extract_signature_key_id;
use crate::federation::{DispatchOutcome, LocalUrls, extract_domain};
use crate::metrics::SIGNATURE_FAILURES_TOTAL;
use crate::service::note_object;

const OUTBOX_PAGE_SIZE: u32 = 20;
const ACTIVITY_JSON: &str = "application/activity+json; charset=utf-8";

/// Create ActivityPub router
///
/// Routes:
/// - GET /actor - Instance actor
/// - GET /users/:username - Actor profile
/// - GET|POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
/// - GET /notes/:id - Note
/// - GET /notes/:id/replies - Replies collection
///
/// Inbox bodies above `max_body_bytes` are refused with 413.
pub fn activitypub_router(max_body_bytes: usize) -> Router<AppState> {
    let inboxes = Router::new()
        .route("/users/:username/inbox", post(inbox).get(inbox_collection))
        .route("/inbox", post(shared_inbox))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes));

    Router::new()
        .route("/actor", get(instance_actor))
        .route("/users/:username", get(actor))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/notes/:id", get(note))
        .route("/notes/:id/replies", get(replies))
        .merge(inboxes)
}

/// JSON body served as `application/activity+json`
struct ActivityJson(Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, ACTIVITY_JSON)], self.0.to_string()).into_response()
    }
}

fn actor_context() -> Value {
    json!([
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1"
    ])
}

fn ordered_collection(id: &str, items: Vec<String>) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": id,
        "totalItems": items.len(),
        "orderedItems": items
    })
}

fn actor_document(urls: &LocalUrls, account: &LocalAccount) -> Value {
    let actor_url = urls.actor(&account.username);
    json!({
        "@context": actor_context(),
        "type": "Person",
        "id": actor_url,
        "preferredUsername": account.username,
        "name": account.display_name.clone().unwrap_or_else(|| account.username.clone()),
        "summary": account
            .summary
            .as_deref()
            .map(|summary| format!("<p>{}</p>", html_escape::encode_text(summary)))
            .unwrap_or_default(),
        "inbox": urls.inbox(&account.username),
        "outbox": urls.outbox(&account.username),
        "followers": urls.followers(&account.username),
        "following": urls.following(&account.username),
        "url": actor_url,
        "published": account.created_at.to_rfc3339(),
        "manuallyApprovesFollowers": false,
        "endpoints": {
            "sharedInbox": urls.shared_inbox()
        },
        "publicKey": {
            "id": LocalUrls::key_id(&actor_url),
            "owner": actor_url,
            "publicKeyPem": account.public_key_pem
        }
    })
}

/// GET /actor
///
/// The instance actor signs actor fetches and relay subscriptions.
async fn instance_actor(State(state): State<AppState>) -> ActivityJson {
    let urls = &state.urls;
    let actor_url = urls.instance_actor();
    ActivityJson(json!({
        "@context": actor_context(),
        "type": "Application",
        "id": actor_url,
        "preferredUsername": urls.domain(),
        "name": state.config.instance.title,
        "summary": html_escape::encode_text(&state.config.instance.description),
        "inbox": urls.shared_inbox(),
        "outbox": format!("{}/outbox", actor_url),
        "url": urls.base_url(),
        "manuallyApprovesFollowers": true,
        "endpoints": {
            "sharedInbox": urls.shared_inbox()
        },
        "publicKey": {
            "id": LocalUrls::key_id(&actor_url),
            "owner": actor_url,
            "publicKeyPem": state.keys.instance_public_key_pem()
        }
    }))
}

/// GET /users/:username
///
/// Returns the ActivityPub Actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    Ok(ActivityJson(actor_document(&state.urls, &account)))
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state.accounts.get_by_username(&username).await?;
    receive(&state, &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all users on this instance (and the instance actor).
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

/// Admission control, signature verification, then dispatch
///
/// # Steps
/// 1. Rate limit on the keyId domain (no key fetch yet)
/// 2. Verify the HTTP Signature, resolving the key
/// 3. Parse and dispatch the activity as the verified signer
///
/// A replay of an already processed activity answers 200, anything newly
/// accepted answers 202.
async fn receive(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let key_id = extract_signature_key_id(headers).inspect_err(record_signature_failure)?;
    state.rate_limiter.check(&extract_domain(&key_id)).await?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let signer = state
        .verifier
        .verify_request("POST", path, headers, Some(body))
        .await
        .inspect_err(|error| {
            record_signature_failure(error);
            tracing::warn!(%error, key_id = %key_id, "Rejected inbound signature");
        })?;

    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    match state.dispatcher.dispatch(&activity, &signer).await? {
        DispatchOutcome::Duplicate => Ok(StatusCode::OK),
        DispatchOutcome::Processed | DispatchOutcome::Acknowledged => Ok(StatusCode::ACCEPTED),
    }
}

fn record_signature_failure(error: &AppError) {
    let label = match error {
        AppError::InvalidSignature(verdict) => verdict.to_string().replace(' ', "_"),
        AppError::KeyUnresolvable(_) => "key_unresolvable".to_string(),
        _ => return,
    };
    SIGNATURE_FAILURES_TOTAL.with_label_values(&[&label]).inc();
}

/// GET /users/:username/inbox
///
/// Inboxes are write-only for remote servers; the collection is empty.
async fn inbox_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    Ok(ActivityJson(ordered_collection(
        &state.urls.inbox(&account.username),
        Vec::new(),
    )))
}

/// Outbox query
#[derive(Debug, Default, Deserialize)]
struct OutboxQuery {
    page: Option<bool>,
    max_id: Option<String>,
}

/// GET /users/:username/outbox
///
/// Without `page` the collection points at its first page. Pages hold
/// `Create` activities, newest first, continued with `max_id`.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<OutboxQuery>,
) -> Result<ActivityJson, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let urls = &state.urls;
    let outbox_url = urls.outbox(&account.username);

    if !query.page.unwrap_or(false) {
        let total = state.store.count_notes_by_account(&account.id).await?;
        return Ok(ActivityJson(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "OrderedCollection",
            "id": outbox_url,
            "totalItems": total,
            "first": format!("{}?page=true", outbox_url)
        })));
    }

    let before = match query.max_id.as_deref() {
        Some(max_id) => {
            let cursor = state.store.get_note(max_id).await?.ok_or_else(|| {
                AppError::Validation(format!("Unknown max_id: {}", max_id))
            })?;
            if cursor.account_id != account.id {
                return Err(AppError::Validation(format!("Unknown max_id: {}", max_id)));
            }
            Some(cursor.created_at)
        }
        None => None,
    };

    let notes = state
        .store
        .list_notes_by_account(&account.id, OUTBOX_PAGE_SIZE, before)
        .await?;

    let actor_url = urls.actor(&account.username);
    let to = vec![PUBLIC_AUDIENCE.to_string()];
    let cc = vec![urls.followers(&account.username)];
    let items: Vec<Value> = notes
        .iter()
        .map(|note| {
            let mut object = note_object(urls, note, &account.username, &[]);
            if let Some(map) = object.as_object_mut() {
                map.remove("@context");
            }
            let mut activity =
                builder::create(&format!("{}/activity", note.uri), &actor_url, object, &to, &cc);
            if let Some(map) = activity.as_object_mut() {
                map.remove("@context");
                map.insert("published".to_string(), json!(note.created_at.to_rfc3339()));
            }
            activity
        })
        .collect();

    let page_id = match query.max_id.as_deref() {
        Some(max_id) => format!("{}?page=true&max_id={}", outbox_url, max_id),
        None => format!("{}?page=true", outbox_url),
    };
    let mut page = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollectionPage",
        "id": page_id,
        "partOf": outbox_url,
        "orderedItems": items
    });
    if notes.len() == OUTBOX_PAGE_SIZE as usize {
        if let (Some(last), Some(map)) = (notes.last(), page.as_object_mut()) {
            map.insert(
                "next".to_string(),
                json!(format!("{}?page=true&max_id={}", outbox_url, last.id)),
            );
        }
    }

    Ok(ActivityJson(page))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let items = state.social.follower_uris(&account.id).await?;
    Ok(ActivityJson(ordered_collection(
        &state.urls.followers(&account.username),
        items,
    )))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let account = state.accounts.get_by_username(&username).await?;
    let items = state.social.following_uris(&account.id).await?;
    Ok(ActivityJson(ordered_collection(
        &state.urls.following(&account.username),
        items,
    )))
}

/// GET /notes/:id
async fn note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson, AppError> {
    let note = state.notes.get(&id).await?;
    let author = state.accounts.get(&note.account_id).await?;
    Ok(ActivityJson(note_object(
        &state.urls,
        &note,
        &author.username,
        &[],
    )))
}

/// GET /notes/:id/replies
///
/// Local and remote replies known to this server, oldest first.
async fn replies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson, AppError> {
    let note = state.notes.get(&id).await?;
    let thread = state.threads.resolve_thread(&note.uri).await?;
    let items = thread.replies.into_iter().map(|reply| reply.uri).collect();
    Ok(ActivityJson(ordered_collection(
        &state.urls.note_replies(&note.id),
        items,
    )))
}
