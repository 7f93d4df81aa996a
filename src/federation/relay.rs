//! Relay subscriptions
//!
//! A relay is followed by the instance actor. The subscription row tracks
//! our outgoing Follow id so that the relay's Accept can be matched and an
//! Undo can be built later.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::delivery::builder;
use super::queue::DeliveryQueue;
use super::resolver::IdentityResolver;
use super::urls::LocalUrls;
use crate::data::{EntityId, FederationStore, Relay, RelayStatus};
use crate::error::AppError;

/// Turn `relay.example` or `https://relay.example` into an actor URI
pub fn normalize_relay_input(input: &str) -> Result<String, AppError> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AppError::Validation("Relay URL is required".to_string()));
    }

    if trimmed.contains("://") {
        let parsed = url::Url::parse(trimmed)
            .map_err(|e| AppError::Validation(format!("Invalid relay URL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AppError::Validation(
                "Relay URL must use http or https".to_string(),
            ));
        }
        if parsed.host_str().is_none() {
            return Err(AppError::Validation("Relay URL has no host".to_string()));
        }
        if parsed.path() == "/" || parsed.path().is_empty() {
            return Ok(format!("{}/actor", trimmed));
        }
        return Ok(trimmed.to_string());
    }

    let domain = trimmed.to_ascii_lowercase();
    let valid = url::Url::parse(&format!("https://{}", domain))
        .ok()
        .is_some_and(|url| url.path() == "/" && url.host_str().is_some());
    if !valid || domain.contains('/') || domain.contains('@') {
        return Err(AppError::Validation(format!(
            "Invalid relay domain: {}",
            input
        )));
    }
    Ok(format!("https://{}/actor", domain))
}

pub struct RelayManager {
    store: Arc<dyn FederationStore>,
    resolver: Arc<IdentityResolver>,
    queue: DeliveryQueue,
    urls: LocalUrls,
}

impl RelayManager {
    pub fn new(
        store: Arc<dyn FederationStore>,
        resolver: Arc<IdentityResolver>,
        queue: DeliveryQueue,
        urls: LocalUrls,
    ) -> Self {
        Self {
            store,
            resolver,
            queue,
            urls,
        }
    }

    /// Resolve the relay, store it as pending and queue our Follow
    pub async fn subscribe(&self, input: &str) -> Result<Relay, AppError> {
        let requested = normalize_relay_input(input)?;
        if self.store.get_relay_by_actor_uri(&requested).await?.is_some() {
            return Err(AppError::Validation(format!(
                "Already subscribed to {}",
                requested
            )));
        }

        let account = self.resolver.resolve_actor(&requested).await?;
        if account.actor_uri != requested
            && self
                .store
                .get_relay_by_actor_uri(&account.actor_uri)
                .await?
                .is_some()
        {
            return Err(AppError::Validation(format!(
                "Already subscribed to {}",
                account.actor_uri
            )));
        }

        let relay = Relay {
            id: EntityId::new().0,
            actor_uri: account.actor_uri.clone(),
            inbox_uri: account.inbox_uri.clone(),
            follow_uri: self.urls.new_activity(),
            status: RelayStatus::Pending.as_str().to_string(),
            accepted_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_relay(&relay).await?;

        let follow = builder::follow(
            &relay.follow_uri,
            &self.urls.instance_actor(),
            &relay.actor_uri,
        );
        self.queue.enqueue(&relay.inbox_uri, &follow).await?;

        tracing::info!(relay = %relay.actor_uri, inbox = %relay.inbox_uri, "Relay subscription requested");
        Ok(relay)
    }

    /// Drop pending deliveries, queue an Undo(Follow) and forget the relay
    pub async fn unsubscribe(&self, relay_id: &str) -> Result<(), AppError> {
        let relay = self
            .store
            .get_relay(relay_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let dropped = self.store.delete_deliveries_for_inbox(&relay.inbox_uri).await?;

        let instance_actor = self.urls.instance_actor();
        let undo = builder::undo(
            &self.urls.new_activity(),
            &instance_actor,
            json!({
                "id": relay.follow_uri,
                "type": "Follow",
                "actor": instance_actor,
                "object": relay.actor_uri,
            }),
        );
        self.queue.enqueue(&relay.inbox_uri, &undo).await?;
        self.store.delete_relay(&relay.id).await?;

        tracing::info!(relay = %relay.actor_uri, dropped, "Relay unsubscribed");
        Ok(())
    }

    /// Start over for a failed relay
    pub async fn retry(&self, relay_id: &str) -> Result<Relay, AppError> {
        let relay = self
            .store
            .get_relay(relay_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if relay.status() != RelayStatus::Failed {
            return Err(AppError::Validation(format!(
                "Relay {} is {}, only failed relays can be retried",
                relay.actor_uri,
                relay.status().as_str()
            )));
        }

        self.store.delete_deliveries_for_inbox(&relay.inbox_uri).await?;
        self.store.delete_relay(&relay.id).await?;
        self.subscribe(&relay.actor_uri).await
    }

    pub async fn list(&self) -> Result<Vec<Relay>, AppError> {
        self.store.list_relays().await
    }

    /// Relay whose subscription Follow has this id
    pub async fn find_by_follow_uri(&self, follow_uri: &str) -> Result<Option<Relay>, AppError> {
        self.store.get_relay_by_follow_uri(follow_uri).await
    }

    /// Record the relay's Accept
    pub async fn activate(&self, relay: &Relay) -> Result<(), AppError> {
        self.store
            .update_relay_status(&relay.id, RelayStatus::Active, Some(Utc::now()))
            .await?;
        tracing::info!(relay = %relay.actor_uri, "Relay subscription accepted");
        Ok(())
    }

    /// Mark the relay behind `inbox_uri` failed; false when no relay matched
    pub async fn mark_failed_by_inbox(&self, inbox_uri: &str) -> Result<bool, AppError> {
        let Some(relay) = self.store.get_relay_by_inbox(inbox_uri).await? else {
            return Ok(false);
        };
        if relay.status() == RelayStatus::Failed {
            return Ok(false);
        }

        self.store
            .update_relay_status(&relay.id, RelayStatus::Failed, None)
            .await?;
        tracing::warn!(relay = %relay.actor_uri, "Relay marked failed after delivery error");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;
    use crate::federation::fetch::RemoteFetcher;
    use crate::federation::keys::KeyPair;
    use crate::federation::keys::LocalSigner;
    use crate::federation::test_support::spawn_remote;
    use axum::{Json, Router, routing::get};

    #[test]
    fn normalize_accepts_domains_and_urls() {
        assert_eq!(
            normalize_relay_input("relay.example").unwrap(),
            "https://relay.example/actor"
        );
        assert_eq!(
            normalize_relay_input(" https://relay.example/ ").unwrap(),
            "https://relay.example/actor"
        );
        assert_eq!(
            normalize_relay_input("https://relay.example/relay").unwrap(),
            "https://relay.example/relay"
        );
        assert!(normalize_relay_input("").is_err());
        assert!(normalize_relay_input("ftp://relay.example").is_err());
        assert!(normalize_relay_input("user@relay.example").is_err());
    }

    async fn relay_server() -> String {
        let keys = KeyPair::generate(1024).unwrap();
        let base = Arc::new(std::sync::Mutex::new(String::new()));
        let base_for_route = base.clone();
        let app = Router::new().route(
            "/actor",
            get(move || {
                let base = base_for_route.lock().unwrap().clone();
                let pem = keys.public_key_pem.clone();
                async move {
                    Json(serde_json::json!({
                        "id": format!("{base}/actor"),
                        "type": "Application",
                        "preferredUsername": "relay",
                        "inbox": format!("{base}/inbox"),
                        "publicKey": {"id": format!("{base}/actor#main-key"), "publicKeyPem": pem}
                    }))
                }
            }),
        );
        let addr = spawn_remote(app).await;
        let url = format!("http://{addr}");
        *base.lock().unwrap() = url.clone();
        url
    }

    fn manager(store: Arc<MemoryStore>) -> RelayManager {
        let keys = KeyPair::generate(1024).unwrap();
        let resolver = Arc::new(IdentityResolver::new(
            store.clone(),
            RemoteFetcher::new(reqwest::Client::new(), true),
            LocalSigner {
                actor_uri: "http://localhost/actor".to_string(),
                key_id: "http://localhost/actor#main-key".to_string(),
                private_key_pem: keys.private_key_pem,
            },
            chrono::Duration::hours(24),
        ));
        RelayManager::new(
            store.clone(),
            resolver,
            DeliveryQueue::new(store),
            LocalUrls::new("http://localhost", "localhost"),
        )
    }

    #[tokio::test]
    async fn subscribe_queues_follow_and_stores_pending_relay() {
        let base = relay_server().await;
        let store = Arc::new(MemoryStore::new());
        let relays = manager(store.clone());

        let relay = relays.subscribe(&base).await.unwrap();
        assert_eq!(relay.actor_uri, format!("{base}/actor"));
        assert_eq!(relay.status(), RelayStatus::Pending);

        let queued = store.list_deliveries(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].inbox_uri, format!("{base}/inbox"));
        let follow: serde_json::Value = serde_json::from_str(&queued[0].activity_json).unwrap();
        assert_eq!(follow["type"], "Follow");
        assert_eq!(follow["id"], relay.follow_uri);
        assert_eq!(follow["actor"], "http://localhost/actor");

        assert!(relays.subscribe(&base).await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_replaces_queued_items_with_undo() {
        let base = relay_server().await;
        let store = Arc::new(MemoryStore::new());
        let relays = manager(store.clone());
        let relay = relays.subscribe(&base).await.unwrap();

        relays.unsubscribe(&relay.id).await.unwrap();

        assert!(store.get_relay(&relay.id).await.unwrap().is_none());
        let queued = store.list_deliveries(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        let undo: serde_json::Value = serde_json::from_str(&queued[0].activity_json).unwrap();
        assert_eq!(undo["type"], "Undo");
        assert_eq!(undo["object"]["id"], relay.follow_uri);
    }

    #[tokio::test]
    async fn retry_only_applies_to_failed_relays() {
        let base = relay_server().await;
        let store = Arc::new(MemoryStore::new());
        let relays = manager(store.clone());
        let relay = relays.subscribe(&base).await.unwrap();

        assert!(matches!(
            relays.retry(&relay.id).await,
            Err(AppError::Validation(_))
        ));

        assert!(relays.mark_failed_by_inbox(&relay.inbox_uri).await.unwrap());
        let renewed = relays.retry(&relay.id).await.unwrap();

        assert_ne!(renewed.id, relay.id);
        assert_ne!(renewed.follow_uri, relay.follow_uri);
        assert_eq!(renewed.status(), RelayStatus::Pending);
        assert_eq!(store.list_relays().await.unwrap().len(), 1);
        assert_eq!(store.count_deliveries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn activate_sets_accepted_at() {
        let base = relay_server().await;
        let store = Arc::new(MemoryStore::new());
        let relays = manager(store.clone());
        let relay = relays.subscribe(&base).await.unwrap();

        let found = relays
            .find_by_follow_uri(&relay.follow_uri)
            .await
            .unwrap()
            .unwrap();
        relays.activate(&found).await.unwrap();

        let stored = store.get_relay(&relay.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RelayStatus::Active);
        assert!(stored.accepted_at.is_some());
    }
}
