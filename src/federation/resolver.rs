//! Remote identity resolution
//!
//! Resolves handles through WebFinger and keeps remote actor documents in
//! the store for `actor_cache_ttl`. Concurrent resolutions of the same actor
//! share one upstream fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::fetch::{ACTIVITY_JSON_ACCEPT, RemoteFetcher, extract_actor_domain};
use super::keys::LocalSigner;
use super::webfinger::resolve_webfinger;
use crate::data::{EntityId, FederationStore, RemoteAccount};
use crate::error::AppError;
use crate::metrics::{ACTOR_FETCHES_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

const CACHE_NAME: &str = "actor";

type InflightMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// WebFinger + actor cache
pub struct IdentityResolver {
    store: Arc<dyn FederationStore>,
    fetcher: RemoteFetcher,
    signer: LocalSigner,
    ttl: chrono::Duration,
    inflight: Mutex<InflightMap>,
}

impl IdentityResolver {
    /// Create a resolver
    ///
    /// # Arguments
    /// * `signer` - Local actor used to sign actor fetches (the instance actor)
    /// * `ttl` - How long a cached actor is served without refetching
    pub fn new(
        store: Arc<dyn FederationStore>,
        fetcher: RemoteFetcher,
        signer: LocalSigner,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            signer,
            ttl,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetcher(&self) -> &RemoteFetcher {
        &self.fetcher
    }

    /// `user@domain` to actor URI
    ///
    /// A fresh cached account with that handle answers without a lookup.
    pub async fn resolve_handle(&self, username: &str, domain: &str) -> Result<String, AppError> {
        let domain = domain.to_ascii_lowercase();
        if let Some(cached) = self
            .store
            .get_remote_account_by_handle(username, &domain)
            .await?
        {
            if cached.is_fresh(Utc::now(), self.ttl) {
                return Ok(cached.actor_uri);
            }
        }

        resolve_webfinger(&self.fetcher, username, &domain).await
    }

    /// Cached actor, refetched when older than the TTL
    pub async fn resolve_actor(&self, actor_uri: &str) -> Result<RemoteAccount, AppError> {
        self.resolve_actor_at(actor_uri, Utc::now()).await
    }

    /// `resolve_actor` evaluated at `now`
    pub async fn resolve_actor_at(
        &self,
        actor_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<RemoteAccount, AppError> {
        let (account, _) = self.resolve(actor_uri, now, false).await?;
        Ok(account)
    }

    /// Refetch regardless of cache age
    ///
    /// Callers racing on the same actor share the refresh that started
    /// after they asked.
    pub async fn refresh_actor(&self, actor_uri: &str) -> Result<RemoteAccount, AppError> {
        let (account, _) = self.resolve(actor_uri, Utc::now(), true).await?;
        Ok(account)
    }

    /// Account owning `key_id`, and whether it was fetched just now
    pub async fn resolve_key(&self, key_id: &str) -> Result<(RemoteAccount, bool), AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);
        let (account, fetched) = self.resolve(actor_uri, Utc::now(), false).await?;

        if account.public_key_id == key_id {
            return Ok((account, fetched));
        }

        if fetched {
            return Err(AppError::KeyUnresolvable(format!(
                "{} does not publish key {}",
                account.actor_uri, key_id
            )));
        }

        // Cached document predates a key change
        let (account, _) = self.resolve(actor_uri, Utc::now(), true).await?;
        if account.public_key_id != key_id {
            return Err(AppError::KeyUnresolvable(format!(
                "{} does not publish key {}",
                account.actor_uri, key_id
            )));
        }
        Ok((account, true))
    }

    /// Drop the cached record
    pub async fn forget_actor(&self, actor_uri: &str) -> Result<bool, AppError> {
        self.store.delete_remote_account_by_uri(actor_uri).await
    }

    async fn resolve(
        &self,
        actor_uri: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<(RemoteAccount, bool), AppError> {
        if !force {
            if let Some(cached) = self.cached_fresh(actor_uri, now).await? {
                CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                return Ok((cached, false));
            }
        }
        CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();

        let lock = self.lock_for(actor_uri);
        let result = {
            let _guard = lock.lock().await;

            // Whoever held the lock before us may already have stored it.
            let cached = self.store.get_remote_account_by_uri(actor_uri).await?;
            match cached {
                Some(cached) if force && cached.last_fetched_at >= now => Ok((cached, false)),
                Some(cached) if !force && cached.is_fresh(now, self.ttl) => Ok((cached, false)),
                _ => self.fetch_and_store(actor_uri, now).await.map(|a| (a, true)),
            }
        };
        self.release(actor_uri, &lock);
        result
    }

    async fn cached_fresh(
        &self,
        actor_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RemoteAccount>, AppError> {
        Ok(self
            .store
            .get_remote_account_by_uri(actor_uri)
            .await?
            .filter(|account| account.is_fresh(now, self.ttl)))
    }

    fn lock_for(&self, actor_uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inflight
            .entry(actor_uri.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, actor_uri: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            inflight.remove(actor_uri);
        }
    }

    async fn fetch_and_store(
        &self,
        actor_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<RemoteAccount, AppError> {
        ACTOR_FETCHES_TOTAL.inc();
        tracing::debug!(actor = %actor_uri, "Fetching remote actor");

        let document = self
            .fetcher
            .get_json(actor_uri, ACTIVITY_JSON_ACCEPT, Some(&self.signer))
            .await?;
        let parsed = parse_actor(&document, now)?;

        if extract_actor_domain(&parsed.actor_uri)? != extract_actor_domain(actor_uri)? {
            return Err(AppError::Federation(format!(
                "Actor document at {} claims foreign id {}",
                actor_uri, parsed.actor_uri
            )));
        }

        let stored = self.store.upsert_remote_account(&parsed).await?;
        tracing::info!(
            actor = %stored.actor_uri,
            handle = %stored.handle(),
            "Remote actor cached"
        );
        Ok(stored)
    }
}

/// Build a cache row from an actor document
pub fn parse_actor(
    document: &serde_json::Value,
    fetched_at: DateTime<Utc>,
) -> Result<RemoteAccount, AppError> {
    let str_field = |name: &str| {
        document
            .get(name)
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
    };

    let actor_uri = str_field("id")
        .ok_or_else(|| AppError::Federation("Actor document has no id".to_string()))?;
    let inbox_uri = str_field("inbox").ok_or_else(|| {
        AppError::Federation(format!("Actor {} has no inbox", actor_uri))
    })?;

    let public_key = document.get("publicKey");
    let public_key_pem = public_key
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(|value| value.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| {
            AppError::KeyUnresolvable(format!("Actor {} has no public key", actor_uri))
        })?;
    let public_key_id = public_key
        .and_then(|key| key.get("id"))
        .and_then(|value| value.as_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{}#main-key", actor_uri));

    let username = str_field("preferredUsername")
        .or_else(|| {
            url::Url::parse(&actor_uri).ok().and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(ToString::to_string))
            })
        })
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Federation(format!("Actor {} has no username", actor_uri)))?;

    Ok(RemoteAccount {
        id: EntityId::new().0,
        username,
        domain: extract_actor_domain(&actor_uri)?,
        display_name: str_field("name").filter(|name| !name.is_empty()),
        summary: str_field("summary").map(|summary| ammonia::clean(&summary)),
        outbox_uri: str_field("outbox"),
        inbox_uri,
        public_key_pem,
        public_key_id,
        last_fetched_at: fetched_at,
        actor_uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;
    use crate::federation::keys::KeyPair;
    use crate::federation::test_support::{remote_actor_document, spawn_remote};
    use axum::{Json, Router, routing::get};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver(store: Arc<MemoryStore>) -> IdentityResolver {
        let keys = KeyPair::generate(1024).unwrap();
        IdentityResolver::new(
            store,
            RemoteFetcher::new(reqwest::Client::new(), true),
            LocalSigner {
                actor_uri: "http://localhost/actor".to_string(),
                key_id: "http://localhost/actor#main-key".to_string(),
                private_key_pem: keys.private_key_pem,
            },
            chrono::Duration::hours(24),
        )
    }

    async fn counting_actor_server(public_key_pem: String) -> (String, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let base = Arc::new(Mutex::new(String::new()));
        let base_for_route = base.clone();
        let app = Router::new().route(
            "/users/alice",
            get(move || {
                let counter = counter.clone();
                let base = base_for_route.lock().unwrap().clone();
                let pem = public_key_pem.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(remote_actor_document(&base, "alice", &pem))
                }
            }),
        );
        let addr = spawn_remote(app).await;
        *base.lock().unwrap() = format!("http://{addr}");
        (format!("http://{addr}/users/alice"), fetches)
    }

    #[tokio::test]
    async fn cached_actor_is_served_within_ttl_and_refetched_after() {
        let keys = KeyPair::generate(1024).unwrap();
        let (actor_uri, fetches) = counting_actor_server(keys.public_key_pem.clone()).await;
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let t0 = Utc::now();

        let first = resolver.resolve_actor_at(&actor_uri, t0).await.unwrap();
        let second = resolver
            .resolve_actor_at(&actor_uri, t0 + chrono::Duration::hours(23))
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.last_fetched_at, second.last_fetched_at);

        let third = resolver
            .resolve_actor_at(&actor_uri, t0 + chrono::Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(third.id, first.id);
        assert_eq!(third.inbox_uri, format!("{}/inbox", actor_uri));
    }

    #[tokio::test]
    async fn concurrent_resolutions_share_one_fetch() {
        let keys = KeyPair::generate(1024).unwrap();
        let (actor_uri, fetches) = counting_actor_server(keys.public_key_pem.clone()).await;
        let resolver = Arc::new(resolver(Arc::new(MemoryStore::new())));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                let actor_uri = actor_uri.clone();
                tokio::spawn(async move { resolver.resolve_actor(&actor_uri).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(resolver.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_bypasses_ttl() {
        let keys = KeyPair::generate(1024).unwrap();
        let (actor_uri, fetches) = counting_actor_server(keys.public_key_pem.clone()).await;
        let resolver = resolver(Arc::new(MemoryStore::new()));

        resolver.resolve_actor(&actor_uri).await.unwrap();
        resolver.refresh_actor(&actor_uri).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolve_key_rejects_unknown_key_id() {
        let keys = KeyPair::generate(1024).unwrap();
        let (actor_uri, _) = counting_actor_server(keys.public_key_pem.clone()).await;
        let resolver = resolver(Arc::new(MemoryStore::new()));

        let (account, fetched) = resolver
            .resolve_key(&format!("{actor_uri}#main-key"))
            .await
            .unwrap();
        assert!(fetched);
        assert_eq!(account.public_key_pem, keys.public_key_pem);

        assert!(matches!(
            resolver.resolve_key(&format!("{actor_uri}#other-key")).await,
            Err(AppError::KeyUnresolvable(_))
        ));
    }

    #[test]
    fn parse_actor_requires_inbox_and_key() {
        let now = Utc::now();
        let complete = remote_actor_document("https://remote.example", "bob", "PEM");
        let parsed = parse_actor(&complete, now).unwrap();
        assert_eq!(parsed.handle(), "bob@remote.example");
        assert_eq!(parsed.public_key_id, "https://remote.example/users/bob#main-key");

        let mut no_inbox = complete.clone();
        no_inbox.as_object_mut().unwrap().remove("inbox");
        assert!(parse_actor(&no_inbox, now).is_err());

        let mut no_key = complete;
        no_key.as_object_mut().unwrap().remove("publicKey");
        assert!(matches!(
            parse_actor(&no_key, now),
            Err(AppError::KeyUnresolvable(_))
        ));
    }
}
