//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query},
    http::{StatusCode, Uri},
    routing::get,
};
use fedipost::data::MemoryStore;
use fedipost::federation::{KeyPair, sign_request};
use fedipost::{AppState, config};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token-0123456789";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        fedipost::metrics::init_metrics();

        // Bind first so that the public domain carries the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = test_config(&addr.to_string());
        adjust(&mut config);

        let keys = KeyPair::generate(1024).unwrap();
        let state = AppState::with_store(config, Arc::new(MemoryStore::new()), keys).unwrap();

        let app = fedipost::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            state,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// `host:port` as used in handles
    pub fn domain(&self) -> String {
        self.addr.trim_start_matches("http://").to_string()
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/admin{}", path)))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn admin_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(&format!("/admin{}", path)))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
    }

    /// Create a local account through the admin API
    pub async fn create_account(&self, username: &str) -> Value {
        let response = self
            .admin_post("/accounts", json!({ "username": username }))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }

    /// Post a note through the admin API
    pub async fn post_note(&self, username: &str, content: &str, in_reply_to: Option<&str>) -> Value {
        let response = self
            .admin_post(
                &format!("/accounts/{}/notes", username),
                json!({ "content": content, "in_reply_to": in_reply_to }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }

    /// Wait until the outbound publisher has queued `depth` items
    pub async fn wait_for_queue_depth(&self, depth: i64) {
        for _ in 0..100 {
            if self.state.queue.depth().await.unwrap() >= depth {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "queue depth stayed at {} (wanted {})",
            self.state.queue.depth().await.unwrap(),
            depth
        );
    }

    /// Queued items as (inbox, activity)
    pub async fn queued(&self) -> Vec<(String, Value)> {
        self.state
            .store
            .list_deliveries(500)
            .await
            .unwrap()
            .into_iter()
            .map(|item| (item.inbox_uri, serde_json::from_str(&item.activity_json).unwrap()))
            .collect()
    }
}

fn test_config(domain: &str) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig {
            path: ":memory:".into(),
        },
        federation: config::FederationConfig {
            enabled: true,
            key_path: "unused.pem".into(),
            generate_missing_key: false,
            rsa_key_bits: 1024,
            actor_cache_ttl_secs: 86_400,
            queue_tick_secs: 10,
            queue_batch_size: 50,
            queue_lease_secs: 300,
            delivery_concurrency: 4,
            delivery_timeout_secs: 5,
            outbound_workers: 2,
            outbound_channel_capacity: 64,
            inbound_requests_per_second: 100,
            max_inbound_body_bytes: 1_048_576,
            signature_max_skew_secs: 300,
            allow_private_hosts: true,
        },
        instance: config::InstanceConfig {
            title: "Fedipost Test".to_string(),
            description: "Test instance".to_string(),
        },
        admin: config::AdminConfig {
            token: ADMIN_TOKEN.to_string(),
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Simulated remote server
///
/// Serves `/users/:name` actor documents (all sharing one key), a relay
/// style `/actor`, WebFinger, and inboxes that record what they receive.
/// `fail_next` makes the next inbox POSTs answer 500.
pub struct RemoteServer {
    pub base: String,
    pub keys: KeyPair,
    received: Arc<Mutex<Vec<(String, Value)>>>,
    hits: Arc<AtomicUsize>,
    fail_remaining: Arc<AtomicUsize>,
}

impl RemoteServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let keys = KeyPair::generate(1024).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let fail_remaining = Arc::new(AtomicUsize::new(0));

        let inbox_handler = {
            let (received, hits, fail_remaining) =
                (received.clone(), hits.clone(), fail_remaining.clone());
            move |uri: Uri, Json(activity): Json<Value>| {
                let (received, hits, fail_remaining) =
                    (received.clone(), hits.clone(), fail_remaining.clone());
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let failing = fail_remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if failing {
                        return StatusCode::INTERNAL_SERVER_ERROR;
                    }
                    received
                        .lock()
                        .unwrap()
                        .push((uri.path().to_string(), activity));
                    StatusCode::ACCEPTED
                }
            }
        };

        let person = {
            let (base, pem) = (base.clone(), keys.public_key_pem.clone());
            move |Path(name): Path<String>| {
                let doc = actor_document(&base, &format!("{}/users/{}", base, name), &name, "Person", &pem);
                async move { Json(doc) }
            }
        };
        let relay = {
            let (base, pem) = (base.clone(), keys.public_key_pem.clone());
            move || {
                let doc = actor_document(&base, &format!("{}/actor", base), "relay", "Application", &pem);
                async move { Json(doc) }
            }
        };
        let webfinger = {
            let base = base.clone();
            move |Query(params): Query<HashMap<String, String>>| {
                let resource = params.get("resource").cloned().unwrap_or_default();
                let name = resource
                    .trim_start_matches("acct:")
                    .split('@')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let base = base.clone();
                async move {
                    Json(json!({
                        "subject": resource,
                        "links": [{
                            "rel": "self",
                            "type": "application/activity+json",
                            "href": format!("{}/users/{}", base, name)
                        }]
                    }))
                }
            }
        };

        let app = Router::new()
            .route("/users/:name", get(person))
            .route("/users/:name/inbox", axum::routing::post(inbox_handler.clone()))
            .route("/actor", get(relay))
            .route("/inbox", axum::routing::post(inbox_handler))
            .route("/.well-known/webfinger", get(webfinger));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            keys,
            received,
            hits,
            fail_remaining,
        }
    }

    pub fn actor(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    pub fn inbox(&self, name: &str) -> String {
        format!("{}/inbox", self.actor(name))
    }

    pub fn key_id(&self, name: &str) -> String {
        format!("{}#main-key", self.actor(name))
    }

    /// `host:port`
    pub fn domain(&self) -> String {
        self.base.trim_start_matches("http://").to_string()
    }

    /// Answer the next `n` inbox POSTs with 500
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Inbox POSTs seen so far, failed ones included
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Successfully received activities as (path, activity)
    pub fn received(&self) -> Vec<(String, Value)> {
        self.received.lock().unwrap().clone()
    }

    /// POST `activity` to `url`, signed as `name`
    pub async fn deliver_as(
        &self,
        client: &reqwest::Client,
        name: &str,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        signed_post(client, url, body, &self.keys.private_key_pem, &self.key_id(name)).await
    }
}

fn actor_document(base: &str, id: &str, name: &str, kind: &str, public_key_pem: &str) -> Value {
    let inbox = if kind == "Person" {
        format!("{}/inbox", id)
    } else {
        format!("{}/inbox", base)
    };
    json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": id,
        "type": kind,
        "preferredUsername": name,
        "inbox": inbox,
        "endpoints": { "sharedInbox": format!("{}/inbox", base) },
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": public_key_pem
        }
    })
}

/// POST `body` to `url` with HTTP Signature headers
pub async fn signed_post(
    client: &reqwest::Client,
    url: &str,
    body: Vec<u8>,
    private_key_pem: &str,
    key_id: &str,
) -> reqwest::Response {
    let signed = sign_request("POST", url, Some(&body), private_key_pem, key_id).unwrap();
    let mut request = client
        .post(url)
        .header("Date", signed.date)
        .header("Signature", signed.signature)
        .header("Content-Type", "application/activity+json");
    if let Some(digest) = signed.digest {
        request = request.header("Digest", digest);
    }
    request.body(body).send().await.unwrap()
}
