//! Activity delivery
//!
//! Signed POSTs of serialized activities to remote inboxes, and the JSON
//! builders for every outgoing activity type.

use std::time::Instant;

use super::fetch::RemoteFetcher;
use super::keys::LocalSigner;
use super::signature::sign_request;
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

pub const ACTIVITY_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Performs one signed inbox POST
#[derive(Clone)]
pub struct ActivityDelivery {
    fetcher: RemoteFetcher,
}

impl ActivityDelivery {
    pub fn new(fetcher: RemoteFetcher) -> Self {
        Self { fetcher }
    }

    /// Deliver an already serialized activity to a single inbox
    ///
    /// # Errors
    /// `DeliveryFailed` for network errors and non-2xx answers; the queue
    /// treats every error as retryable.
    pub async fn deliver(
        &self,
        inbox_uri: &str,
        body: &[u8],
        signer: &LocalSigner,
    ) -> Result<(), AppError> {
        let started = Instant::now();
        let result = self.post(inbox_uri, body, signer).await;

        let label = if result.is_ok() { "success" } else { "failure" };
        DELIVERIES_TOTAL.with_label_values(&[label]).inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn post(
        &self,
        inbox_uri: &str,
        body: &[u8],
        signer: &LocalSigner,
    ) -> Result<(), AppError> {
        let failed = |status: Option<u16>, message: String| AppError::DeliveryFailed {
            status,
            message,
        };

        let url = url::Url::parse(inbox_uri)
            .map_err(|e| failed(None, format!("Invalid inbox URI {}: {}", inbox_uri, e)))?;
        self.fetcher
            .validate_url(&url)
            .await
            .map_err(|e| failed(None, e.to_string()))?;

        let sig_headers = sign_request(
            "POST",
            inbox_uri,
            Some(body),
            &signer.private_key_pem,
            &signer.key_id,
        )
        .map_err(|e| failed(None, e.to_string()))?;

        let mut request = self
            .fetcher
            .http_client()
            .post(url)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| failed(None, format!("Failed to deliver to {}: {}", inbox_uri, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(
                Some(status.as_u16()),
                format!("Inbox {} rejected activity: HTTP {}", inbox_uri, status),
            ));
        }

        tracing::debug!(inbox = %inbox_uri, status = status.as_u16(), "Delivered activity");
        Ok(())
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::{Value, json};

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity wrapping `object`
    pub fn create(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "published": object.get("published").cloned().unwrap_or(Value::Null),
            "to": to,
            "cc": cc,
            "object": object
        })
    }

    /// Build an Update activity carrying the new object state
    pub fn update(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Update",
            "id": id,
            "actor": actor,
            "to": to,
            "cc": cc,
            "object": object
        })
    }

    /// Build a Delete activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (deleter)
    /// * `object` - Object URI being deleted
    pub fn delete(id: &str, actor: &str, object: &str, to: &[String], cc: &[String]) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Fields of an outgoing Note
    #[derive(Debug, Clone)]
    pub struct NoteFields<'a> {
        pub id: &'a str,
        pub attributed_to: &'a str,
        pub content: &'a str,
        pub source: &'a str,
        pub published: &'a str,
        pub updated: Option<&'a str>,
        pub in_reply_to: Option<&'a str>,
        pub replies: &'a str,
        pub to: &'a [String],
        pub cc: &'a [String],
        pub tags: Vec<Value>,
    }

    /// Build a Note object
    pub fn note(fields: NoteFields<'_>) -> Value {
        let mut note = json!({
            "type": "Note",
            "id": fields.id,
            "url": fields.id,
            "attributedTo": fields.attributed_to,
            "content": fields.content,
            "source": {
                "content": fields.source,
                "mediaType": "text/markdown"
            },
            "mediaType": "text/html",
            "published": fields.published,
            "inReplyTo": fields.in_reply_to,
            "replies": fields.replies,
            "to": fields.to,
            "cc": fields.cc,
            "sensitive": false,
            "tag": fields.tags
        });

        if let (Some(updated), Some(object)) = (fields.updated, note.as_object_mut()) {
            object.insert("updated".to_string(), json!(updated));
        }

        note
    }
}

#[cfg(test)]
mod tests {
    use super::builder;
    use super::*;
    use crate::federation::keys::KeyPair;
    use crate::federation::signature::{SignatureVerdict, verify_signature};
    use crate::federation::test_support::spawn_remote;
    use axum::{Router, body::Bytes, http::HeaderMap, http::StatusCode, routing::post};
    use std::sync::{Arc, Mutex};

    fn signer(keys: &KeyPair) -> LocalSigner {
        LocalSigner {
            actor_uri: "http://localhost/users/alice".to_string(),
            key_id: "http://localhost/users/alice#main-key".to_string(),
            private_key_pem: keys.private_key_pem.clone(),
        }
    }

    #[tokio::test]
    async fn deliver_posts_a_verifiable_signed_request() {
        let keys = KeyPair::generate(1024).unwrap();
        let received: Arc<Mutex<Option<(HeaderMap, Bytes)>>> = Arc::new(Mutex::new(None));
        let sink = received.clone();
        let app = Router::new().route(
            "/users/bob/inbox",
            post(move |headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = Some((headers, body));
                    StatusCode::ACCEPTED
                }
            }),
        );
        let addr = spawn_remote(app).await;

        let delivery = ActivityDelivery::new(RemoteFetcher::new(reqwest::Client::new(), true));
        let body = serde_json::to_vec(&builder::like(
            "http://localhost/activities/1",
            "http://localhost/users/alice",
            "http://remote/notes/1",
        ))
        .unwrap();
        delivery
            .deliver(&format!("http://{addr}/users/bob/inbox"), &body, &signer(&keys))
            .await
            .unwrap();

        let (headers, received_body) = received.lock().unwrap().take().unwrap();
        assert_eq!(&received_body[..], body.as_slice());
        assert_eq!(
            verify_signature(
                "POST",
                "/users/bob/inbox",
                &headers,
                Some(&received_body[..]),
                &keys.public_key_pem,
                300
            ),
            SignatureVerdict::Valid
        );
    }

    #[tokio::test]
    async fn deliver_reports_status_of_rejections() {
        let keys = KeyPair::generate(1024).unwrap();
        let app = Router::new().route("/inbox", post(|| async { StatusCode::GONE }));
        let addr = spawn_remote(app).await;

        let delivery = ActivityDelivery::new(RemoteFetcher::new(reqwest::Client::new(), true));
        let result = delivery
            .deliver(&format!("http://{addr}/inbox"), b"{}", &signer(&keys))
            .await;

        assert!(matches!(
            result,
            Err(AppError::DeliveryFailed { status: Some(410), .. })
        ));
    }

    #[test]
    fn note_builder_sets_reply_and_update_fields() {
        let to = vec![PUBLIC_AUDIENCE.to_string()];
        let cc = vec!["https://remote.example/users/bob/inbox".to_string()];
        let note = builder::note(builder::NoteFields {
            id: "https://fedi.example/notes/1",
            attributed_to: "https://fedi.example/users/alice",
            content: "<p>hi</p>",
            source: "hi",
            published: "2026-01-01T00:00:00+00:00",
            updated: Some("2026-01-02T00:00:00+00:00"),
            in_reply_to: Some("https://remote.example/notes/9"),
            replies: "https://fedi.example/notes/1/replies",
            to: &to,
            cc: &cc,
            tags: Vec::new(),
        });

        assert_eq!(note["inReplyTo"], "https://remote.example/notes/9");
        assert_eq!(note["cc"][0], "https://remote.example/users/bob/inbox");
        assert_eq!(note["updated"], "2026-01-02T00:00:00+00:00");

        let create = builder::create(
            "https://fedi.example/activities/1",
            "https://fedi.example/users/alice",
            note,
            &to,
            &cc,
        );
        assert_eq!(create["published"], "2026-01-01T00:00:00+00:00");
        assert_eq!(create["object"]["type"], "Note");
    }

    #[test]
    fn delete_builder_wraps_tombstone() {
        let activity = builder::delete("https://a/1", "https://a/users/x", "https://a/notes/2", &[], &[]);
        assert_eq!(activity["object"]["type"], "Tombstone");
        assert_eq!(activity["object"]["id"], "https://a/notes/2");
    }
}
