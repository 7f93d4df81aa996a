//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::AppError;
use crate::federation::webfinger::parse_acct_resource;
use crate::federation::{WebFingerResponse, generate_webfinger_response};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let (username, domain) = parse_acct_resource(&query.resource)
        .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

    // Only accounts hosted here
    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let account = state.accounts.get_by_username(&username).await?;
    let response: WebFingerResponse = generate_webfinger_response(
        &account.username,
        &state.config.server.domain,
        &state.urls.actor(&account.username),
    );

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json; charset=utf-8")],
        Json(response),
    ))
}

const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.0";

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "links": [{
            "rel": NODEINFO_SCHEMA,
            "href": format!("{}/nodeinfo/2.0", state.config.server.base_url())
        }]
    }))
}

/// NodeInfo 2.0 document
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeInfo {
    version: &'static str,
    software: Software,
    protocols: [&'static str; 1],
    services: Services,
    open_registrations: bool,
    usage: Usage,
    metadata: Value,
}

#[derive(Debug, Serialize)]
struct Software {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Services {
    inbound: [&'static str; 0],
    outbound: [&'static str; 0],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Usage {
    users: UserUsage,
    local_posts: i64,
}

#[derive(Debug, Serialize)]
struct UserUsage {
    total: i64,
}

/// GET /nodeinfo/2.0
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<NodeInfo>, AppError> {
    let users = state.store.count_local_accounts().await?;
    let local_posts = state.store.count_notes().await?;

    Ok(Json(NodeInfo {
        version: "2.0",
        software: Software {
            name: "fedipost",
            version: env!("CARGO_PKG_VERSION"),
        },
        protocols: ["activitypub"],
        services: Services {
            inbound: [],
            outbound: [],
        },
        // Accounts are only created through the admin API
        open_registrations: false,
        usage: Usage {
            users: UserUsage { total: users },
            local_posts,
        },
        metadata: json!({
            "nodeName": state.config.instance.title,
            "nodeDescription": state.config.instance.description,
        }),
    }))
}

/// GET /.well-known/host-meta
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let template = format!(
        "{}/.well-known/webfinger?resource={{uri}}",
        state.config.server.base_url()
    );
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <XRD xmlns=\"http://docs.oasis-open.org/ns/xri/xrd-1.0\">\n  \
         <Link rel=\"lrdd\" template=\"{}\"/>\n</XRD>\n",
        template
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml; charset=utf-8")], xml)
}
