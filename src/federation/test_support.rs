//! Helpers for tests that talk to simulated remote servers

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral loopback port
pub async fn spawn_remote(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Minimal Person document as Mastodon serves it
pub fn remote_actor_document(base: &str, username: &str, public_key_pem: &str) -> serde_json::Value {
    let actor = format!("{}/users/{}", base, username);
    serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": actor,
        "type": "Person",
        "preferredUsername": username,
        "name": username.to_uppercase(),
        "inbox": format!("{}/inbox", actor),
        "outbox": format!("{}/outbox", actor),
        "publicKey": {
            "id": format!("{}#main-key", actor),
            "owner": actor,
            "publicKeyPem": public_key_pem
        }
    })
}
