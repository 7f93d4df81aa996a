//! Social graph service
//!
//! Following accounts from a local account. A remote edge is stored
//! unaccepted and flips when the remote Accept arrives in the inbox; a
//! local edge is accepted at once and never federated.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::data::{EntityId, FederationStore, Follow, LocalAccount, RemoteAccount};
use crate::error::AppError;
use crate::federation::webfinger::parse_acct_resource;
use crate::federation::{Audience, IdentityResolver, LocalUrls, OutboundTask, Publisher, builder};

/// `user@domain`, `@user@domain` or `acct:user@domain`
pub fn parse_handle(handle: &str) -> Option<(String, String)> {
    parse_acct_resource(handle).filter(|(_, domain)| !domain.contains('/'))
}

pub struct SocialService {
    store: Arc<dyn FederationStore>,
    urls: LocalUrls,
    resolver: Arc<IdentityResolver>,
    publisher: Arc<Publisher>,
    federation_enabled: bool,
}

impl SocialService {
    pub fn new(
        store: Arc<dyn FederationStore>,
        urls: LocalUrls,
        resolver: Arc<IdentityResolver>,
        publisher: Arc<Publisher>,
        federation_enabled: bool,
    ) -> Self {
        Self {
            store,
            urls,
            resolver,
            publisher,
            federation_enabled,
        }
    }

    /// Follow an account by handle or actor URI
    ///
    /// # Errors
    /// `NotFederated` when WebFinger or the actor fetch fails; the message
    /// is meant to be shown to the user.
    pub async fn follow(&self, account_id: &str, target: &str) -> Result<Follow, AppError> {
        let account = self
            .store
            .get_local_account(account_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if let Some(username) = self.local_username(target) {
            let local = self
                .store
                .get_local_account_by_username(&username)
                .await?
                .ok_or(AppError::NotFound)?;
            return self.follow_local(&account, &local).await;
        }
        if !self.federation_enabled {
            return Err(AppError::FederationDisabled);
        }

        let remote = self.resolve_target(target).await?;
        if let Some(existing) = self.store.get_follow(&account.id, &remote.id).await? {
            return Ok(existing);
        }

        let follow = Follow {
            id: EntityId::new().0,
            account_id: account.id.clone(),
            target_account_id: remote.id.clone(),
            uri: Some(self.urls.new_activity()),
            accepted: false,
            created_at: Utc::now(),
        };
        if !self.store.insert_follow_if_absent(&follow).await? {
            return self
                .store
                .get_follow(&account.id, &remote.id)
                .await?
                .ok_or(AppError::NotFound);
        }

        let follow_uri = follow.uri.clone().unwrap_or_default();
        let activity = builder::follow(
            &follow_uri,
            &self.urls.actor(&account.username),
            &remote.actor_uri,
        );
        self.publisher
            .submit(OutboundTask::new(
                "follow",
                activity,
                vec![Audience::Inbox(remote.inbox_uri.clone())],
            ))
            .await?;

        tracing::info!(follower = %account.username, target = %remote.actor_uri, "Follow requested");
        Ok(follow)
    }

    async fn follow_local(
        &self,
        account: &LocalAccount,
        target: &LocalAccount,
    ) -> Result<Follow, AppError> {
        if account.id == target.id {
            return Err(AppError::Validation("Accounts cannot follow themselves".to_string()));
        }
        let follow = Follow {
            id: EntityId::new().0,
            account_id: account.id.clone(),
            target_account_id: target.id.clone(),
            uri: None,
            accepted: true,
            created_at: Utc::now(),
        };
        if !self.store.insert_follow_if_absent(&follow).await? {
            return self
                .store
                .get_follow(&account.id, &target.id)
                .await?
                .ok_or(AppError::NotFound);
        }
        tracing::info!(follower = %account.username, target = %target.username, "Local follow");
        Ok(follow)
    }

    /// Drop the edge and send Undo(Follow) when it was federated; false when not following
    pub async fn unfollow(&self, account_id: &str, target: &str) -> Result<bool, AppError> {
        let account = self
            .store
            .get_local_account(account_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if let Some(username) = self.local_username(target) {
            let Some(local) = self.store.get_local_account_by_username(&username).await? else {
                return Ok(false);
            };
            let Some(follow) = self.store.get_follow(&account.id, &local.id).await? else {
                return Ok(false);
            };
            self.store.delete_follow(&follow.id).await?;
            return Ok(true);
        }
        let Some(remote) = self.cached_target(target).await? else {
            return Ok(false);
        };
        let Some(follow) = self.store.get_follow(&account.id, &remote.id).await? else {
            return Ok(false);
        };

        self.store.delete_follow(&follow.id).await?;

        if let (true, Some(follow_uri)) = (self.federation_enabled, follow.uri) {
            let actor = self.urls.actor(&account.username);
            let activity = builder::undo(
                &self.urls.new_activity(),
                &actor,
                json!({
                    "id": follow_uri,
                    "type": "Follow",
                    "actor": actor,
                    "object": remote.actor_uri,
                }),
            );
            if let Err(error) = self
                .publisher
                .submit(OutboundTask::new(
                    "unfollow",
                    activity,
                    vec![Audience::Inbox(remote.inbox_uri.clone())],
                ))
                .await
            {
                tracing::warn!(%error, target = %remote.actor_uri, "Could not queue Undo(Follow)");
            }
        }
        Ok(true)
    }

    /// Actor URIs of accounts following `account_id`
    pub async fn follower_uris(&self, account_id: &str) -> Result<Vec<String>, AppError> {
        let mut uris = Vec::new();
        for follow in self.store.list_followers(account_id).await? {
            if !follow.accepted {
                continue;
            }
            if let Some(uri) = self.account_uri(&follow.account_id).await? {
                uris.push(uri);
            }
        }
        Ok(uris)
    }

    /// Actor URIs of accounts `account_id` follows (accepted only)
    pub async fn following_uris(&self, account_id: &str) -> Result<Vec<String>, AppError> {
        let mut uris = Vec::new();
        for follow in self.store.list_following(account_id).await? {
            if !follow.accepted {
                continue;
            }
            if let Some(uri) = self.account_uri(&follow.target_account_id).await? {
                uris.push(uri);
            }
        }
        Ok(uris)
    }

    async fn account_uri(&self, id: &str) -> Result<Option<String>, AppError> {
        if let Some(remote) = self.store.get_remote_account(id).await? {
            return Ok(Some(remote.actor_uri));
        }
        Ok(self
            .store
            .get_local_account(id)
            .await?
            .map(|local| self.urls.actor(&local.username)))
    }

    /// Username when `target` names an account on this server
    fn local_username(&self, target: &str) -> Option<String> {
        let target = target.trim();
        if target.starts_with("https://") || target.starts_with("http://") {
            return self
                .urls
                .username_from_actor(target)
                .map(ToString::to_string);
        }
        parse_handle(target)
            .filter(|(_, domain)| domain.eq_ignore_ascii_case(self.urls.domain()))
            .map(|(username, _)| username)
    }

    async fn resolve_target(&self, target: &str) -> Result<RemoteAccount, AppError> {
        let actor_uri = if target.starts_with("https://") || target.starts_with("http://") {
            target.trim().to_string()
        } else {
            let (username, domain) = parse_handle(target).ok_or_else(|| {
                AppError::Validation(format!("Not a user@domain handle: {}", target))
            })?;
            self.resolver.resolve_handle(&username, &domain).await?
        };

        if self.urls.is_local(&actor_uri) {
            return Err(AppError::Validation(
                "Local accounts cannot be followed through federation".to_string(),
            ));
        }

        self.resolver
            .resolve_actor(&actor_uri)
            .await
            .map_err(|error| match error {
                AppError::NotFederated(_) => error,
                other => AppError::NotFederated(format!("could not fetch {}: {}", actor_uri, other)),
            })
    }

    async fn cached_target(&self, target: &str) -> Result<Option<RemoteAccount>, AppError> {
        if target.starts_with("https://") || target.starts_with("http://") {
            return self.store.get_remote_account_by_uri(target.trim()).await;
        }
        match parse_handle(target) {
            Some((username, domain)) => {
                self.store
                    .get_remote_account_by_handle(&username, &domain)
                    .await
            }
            None => Ok(None),
        }
    }
}
