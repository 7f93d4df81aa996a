//! Note service
//!
//! Local posting: every change is written to the store first and federated
//! afterwards through the outbound publisher. A federation failure never
//! rolls back the local change.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use crate::data::{Boost, EntityId, FederationStore, Like, LocalAccount, Note, NoteMention};
use crate::error::AppError;
use crate::federation::content::{encode_note, note_context};
use crate::federation::delivery::{PUBLIC_AUDIENCE, builder};
use crate::federation::{Audience, LocalUrls, OutboundTask, Publisher};

const MAX_NOTE_CHARS: usize = 5_000;

/// Build the ActivityPub Note for a local note
///
/// `extra_cc` carries the parent author's inbox for replies.
pub fn note_object(urls: &LocalUrls, note: &Note, username: &str, extra_cc: &[String]) -> Value {
    let encoded = encode_note(&note.source, urls);
    let to = vec![PUBLIC_AUDIENCE.to_string()];
    let mut cc = vec![urls.followers(username)];
    cc.extend(extra_cc.iter().cloned());

    let published = note.created_at.to_rfc3339();
    let updated = note.updated_at.map(|at| at.to_rfc3339());
    let tags = encoded.tag_objects(urls);
    let has_tags = !tags.is_empty();

    let mut object = builder::note(builder::NoteFields {
        id: &note.uri,
        attributed_to: &urls.actor(username),
        content: &note.content,
        source: &note.source,
        published: &published,
        updated: updated.as_deref(),
        in_reply_to: note.in_reply_to_uri.as_deref(),
        replies: &urls.note_replies(&note.id),
        to: &to,
        cc: &cc,
        tags,
    });
    if let Some(map) = object.as_object_mut() {
        map.insert("@context".to_string(), note_context(has_tags));
    }
    object
}

pub struct NoteService {
    store: Arc<dyn FederationStore>,
    urls: LocalUrls,
    publisher: Arc<Publisher>,
    federation_enabled: bool,
}

impl NoteService {
    pub fn new(
        store: Arc<dyn FederationStore>,
        urls: LocalUrls,
        publisher: Arc<Publisher>,
        federation_enabled: bool,
    ) -> Self {
        Self {
            store,
            urls,
            publisher,
            federation_enabled,
        }
    }

    /// Post a note
    ///
    /// # Arguments
    /// * `account_id` - Local author
    /// * `source` - Plain text with Markdown links, hashtags and mentions
    /// * `in_reply_to_uri` - Canonical URI of the parent, local or remote
    ///
    /// # Side Effects
    /// - Inserts the note and its mentions
    /// - Queues a Create for followers, active relays and the parent author
    pub async fn create(
        &self,
        account_id: &str,
        source: &str,
        in_reply_to_uri: Option<String>,
    ) -> Result<Note, AppError> {
        let account = self.account(account_id).await?;
        let source = validate_source(source)?;
        let encoded = encode_note(&source, &self.urls);

        let id = EntityId::new().0;
        let now = Utc::now();
        let note = Note {
            uri: self.urls.note(&id),
            id: id.clone(),
            account_id: account.id.clone(),
            content: encoded.html,
            source,
            in_reply_to_uri: in_reply_to_uri.filter(|uri| !uri.trim().is_empty()),
            like_count: 0,
            boost_count: 0,
            created_at: now,
            updated_at: None,
        };
        let mentions: Vec<NoteMention> = encoded
            .mentions
            .into_iter()
            .map(|(username, domain)| NoteMention {
                id: EntityId::new().0,
                note_id: id.clone(),
                username,
                domain,
                created_at: now,
            })
            .collect();

        self.store.insert_note(&note, &mentions).await?;
        tracing::info!(note = %note.uri, author = %account.username, "Note created");

        let (parent_cc, parent_audience) = self.parent_recipients(&note).await?;
        let object = note_object(&self.urls, &note, &account.username, &parent_cc);
        let to = vec![PUBLIC_AUDIENCE.to_string()];
        let mut cc = vec![self.urls.followers(&account.username)];
        cc.extend(parent_cc);

        let activity = builder::create(
            &format!("{}/activity", note.uri),
            &self.urls.actor(&account.username),
            object,
            &to,
            &cc,
        );

        let mut audience = vec![Audience::Followers(account.id.clone()), Audience::Relays];
        audience.extend(parent_audience);
        self.publish(OutboundTask::new("create_note", activity, audience))
            .await;

        Ok(note)
    }

    /// Replace the text of a note and send an Update
    pub async fn update(&self, account_id: &str, note_id: &str, source: &str) -> Result<Note, AppError> {
        let account = self.account(account_id).await?;
        let existing = self.owned_note(&account, note_id).await?;
        let source = validate_source(source)?;
        let encoded = encode_note(&source, &self.urls);
        let now = Utc::now();

        self.store
            .update_note_content(&existing.id, &encoded.html, &source, now)
            .await?;
        let note = Note {
            content: encoded.html,
            source,
            updated_at: Some(now),
            ..existing
        };

        let (parent_cc, parent_audience) = self.parent_recipients(&note).await?;
        let object = note_object(&self.urls, &note, &account.username, &parent_cc);
        let to = vec![PUBLIC_AUDIENCE.to_string()];
        let mut cc = vec![self.urls.followers(&account.username)];
        cc.extend(parent_cc);

        let activity = builder::update(
            &self.urls.new_activity(),
            &self.urls.actor(&account.username),
            object,
            &to,
            &cc,
        );
        let mut audience = vec![Audience::Followers(account.id.clone()), Audience::Relays];
        audience.extend(parent_audience);
        self.publish(OutboundTask::new("update_note", activity, audience))
            .await;

        Ok(note)
    }

    /// Delete a note and send a Delete(Tombstone)
    pub async fn delete(&self, account_id: &str, note_id: &str) -> Result<(), AppError> {
        let account = self.account(account_id).await?;
        let note = self.owned_note(&account, note_id).await?;
        let (_, parent_audience) = self.parent_recipients(&note).await?;

        self.store.delete_note(&note.id).await?;
        tracing::info!(note = %note.uri, "Note deleted");

        let to = vec![PUBLIC_AUDIENCE.to_string()];
        let cc = vec![self.urls.followers(&account.username)];
        let activity = builder::delete(
            &self.urls.new_activity(),
            &self.urls.actor(&account.username),
            &note.uri,
            &to,
            &cc,
        );
        let mut audience = vec![Audience::Followers(account.id.clone()), Audience::Relays];
        audience.extend(parent_audience);
        self.publish(OutboundTask::new("delete_note", activity, audience))
            .await;
        Ok(())
    }

    /// Like a local note or a stored remote note
    ///
    /// Returns false when the like already existed. Likes of remote notes
    /// are sent to their author.
    pub async fn like(&self, account_id: &str, object_uri: &str) -> Result<bool, AppError> {
        let account = self.account(account_id).await?;
        let author = self.object_author(object_uri).await?;

        let like = Like {
            id: EntityId::new().0,
            account_id: account.id.clone(),
            object_uri: object_uri.to_string(),
            uri: Some(self.urls.new_activity()),
            created_at: Utc::now(),
        };
        if !self.store.create_like(&like).await? {
            return Ok(false);
        }

        if let (Some(author), Some(like_uri)) = (author, like.uri.as_deref()) {
            let activity = builder::like(like_uri, &self.urls.actor(&account.username), object_uri);
            self.publish(OutboundTask::new(
                "like",
                activity,
                vec![Audience::Actor(author)],
            ))
            .await;
        }
        Ok(true)
    }

    /// Remove a like; remote authors receive Undo(Like)
    pub async fn unlike(&self, account_id: &str, object_uri: &str) -> Result<bool, AppError> {
        let account = self.account(account_id).await?;
        let Some(like) = self.store.delete_like(&account.id, object_uri).await? else {
            return Ok(false);
        };

        let author = self.object_author(object_uri).await.ok().flatten();
        if let (Some(author), Some(like_uri)) = (author, like.uri) {
            let actor = self.urls.actor(&account.username);
            let activity = builder::undo(
                &self.urls.new_activity(),
                &actor,
                json!({
                    "id": like_uri,
                    "type": "Like",
                    "actor": actor,
                    "object": object_uri,
                }),
            );
            self.publish(OutboundTask::new(
                "unlike",
                activity,
                vec![Audience::Actor(author)],
            ))
            .await;
        }
        Ok(true)
    }

    /// Local-only boost; adjusts the counter on the target
    pub async fn boost(&self, account_id: &str, object_uri: &str) -> Result<bool, AppError> {
        let account = self.account(account_id).await?;
        self.object_author(object_uri).await?;
        self.store
            .create_boost(&Boost {
                id: EntityId::new().0,
                account_id: account.id,
                object_uri: object_uri.to_string(),
                uri: None,
                created_at: Utc::now(),
            })
            .await
    }

    pub async fn unboost(&self, account_id: &str, object_uri: &str) -> Result<bool, AppError> {
        let account = self.account(account_id).await?;
        Ok(self
            .store
            .delete_boost(&account.id, object_uri)
            .await?
            .is_some())
    }

    pub async fn get(&self, note_id: &str) -> Result<Note, AppError> {
        self.store.get_note(note_id).await?.ok_or(AppError::NotFound)
    }

    async fn account(&self, account_id: &str) -> Result<LocalAccount, AppError> {
        self.store
            .get_local_account(account_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn owned_note(&self, account: &LocalAccount, note_id: &str) -> Result<Note, AppError> {
        let note = self.store.get_note(note_id).await?.ok_or(AppError::NotFound)?;
        if note.account_id != account.id {
            return Err(AppError::NotFound);
        }
        Ok(note)
    }

    /// Remote author of `object_uri`, `None` for local notes
    ///
    /// # Errors
    /// `NotFound` when the object is neither a local note nor a stored
    /// remote note.
    async fn object_author(&self, object_uri: &str) -> Result<Option<String>, AppError> {
        if self.store.get_note_by_uri(object_uri).await?.is_some() {
            return Ok(None);
        }
        match self.store.get_activity_by_object_uri(object_uri).await? {
            Some(activity) if !activity.local => Ok(Some(activity.actor_uri)),
            _ => Err(AppError::NotFound),
        }
    }

    /// Parent author's inbox for `cc` and the audience entry to reach it
    ///
    /// Uses the actor cache only, so posting never waits on the network.
    async fn parent_recipients(&self, note: &Note) -> Result<(Vec<String>, Vec<Audience>), AppError> {
        let Some(parent) = note.in_reply_to_uri.as_deref() else {
            return Ok((Vec::new(), Vec::new()));
        };
        if self.urls.is_local(parent) {
            return Ok((Vec::new(), Vec::new()));
        }
        let Some(activity) = self.store.get_activity_by_object_uri(parent).await? else {
            return Ok((Vec::new(), Vec::new()));
        };

        match self
            .store
            .get_remote_account_by_uri(&activity.actor_uri)
            .await?
        {
            Some(author) => Ok((
                vec![author.inbox_uri.clone()],
                vec![Audience::Inbox(author.inbox_uri)],
            )),
            None => Ok((Vec::new(), vec![Audience::Actor(activity.actor_uri)])),
        }
    }

    async fn publish(&self, task: OutboundTask) {
        if !self.federation_enabled {
            return;
        }
        let action = task.action;
        if let Err(error) = self.publisher.submit(task).await {
            tracing::warn!(action, %error, "Could not hand activity to the publisher");
        }
    }
}

fn validate_source(source: &str) -> Result<String, AppError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(AppError::Validation("note text is required".to_string()));
    }
    if source.chars().count() > MAX_NOTE_CHARS {
        return Err(AppError::Validation(format!(
            "note text is limited to {} characters",
            MAX_NOTE_CHARS
        )));
    }
    Ok(source.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Activity, Follow, MemoryStore, RemoteAccount};
    use crate::federation::{DeliveryQueue, IdentityResolver, KeyPair, LocalSigner, OutboundProcessor, RemoteFetcher};

    struct Harness {
        store: Arc<MemoryStore>,
        publisher: Arc<Publisher>,
        notes: NoteService,
        alice: LocalAccount,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let urls = LocalUrls::new("https://fedi.example", "fedi.example");
        let keys = KeyPair::generate(1024).unwrap();
        let resolver = Arc::new(IdentityResolver::new(
            store.clone(),
            RemoteFetcher::new(reqwest::Client::new(), true),
            LocalSigner {
                actor_uri: urls.instance_actor(),
                key_id: LocalUrls::key_id(&urls.instance_actor()),
                private_key_pem: keys.private_key_pem.clone(),
            },
            chrono::Duration::hours(24),
        ));
        let processor = Arc::new(OutboundProcessor::new(
            store.clone(),
            resolver,
            DeliveryQueue::new(store.clone()),
            urls.clone(),
        ));
        let publisher = Arc::new(Publisher::start(processor, 1, 8));
        let notes = NoteService::new(store.clone(), urls, publisher.clone(), true);

        let alice = LocalAccount {
            id: EntityId::new().0,
            username: "alice".to_string(),
            display_name: None,
            summary: None,
            private_key_pem: keys.private_key_pem,
            public_key_pem: keys.public_key_pem,
            created_at: Utc::now(),
        };
        store.insert_local_account(&alice).await.unwrap();

        Harness {
            store,
            publisher,
            notes,
            alice,
        }
    }

    async fn remote_follower(store: &MemoryStore, local_id: &str, name: &str) -> RemoteAccount {
        let remote = store
            .upsert_remote_account(&RemoteAccount {
                id: EntityId::new().0,
                username: name.to_string(),
                domain: "remote.example".to_string(),
                actor_uri: format!("https://remote.example/users/{name}"),
                display_name: None,
                summary: None,
                inbox_uri: format!("https://remote.example/users/{name}/inbox"),
                outbox_uri: None,
                public_key_pem: String::new(),
                public_key_id: format!("https://remote.example/users/{name}#main-key"),
                last_fetched_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_follow_if_absent(&Follow {
                id: EntityId::new().0,
                account_id: remote.id.clone(),
                target_account_id: local_id.to_string(),
                uri: Some(format!("https://remote.example/follows/{name}")),
                accepted: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        remote
    }

    fn remote_note_row(actor_uri: &str, object_uri: &str) -> Activity {
        Activity {
            id: EntityId::new().0,
            activity_uri: format!("{object_uri}/activity"),
            activity_type: "Create".to_string(),
            actor_uri: actor_uri.to_string(),
            object_uri: Some(object_uri.to_string()),
            in_reply_to_uri: None,
            content: Some("<p>remote</p>".to_string()),
            raw_json: "{}".to_string(),
            processed: true,
            local: false,
            from_relay: false,
            like_count: 0,
            boost_count: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn create_queues_one_item_per_follower() {
        let h = harness().await;
        remote_follower(&h.store, &h.alice.id, "bob").await;
        remote_follower(&h.store, &h.alice.id, "carol").await;

        let note = h
            .notes
            .create(&h.alice.id, "hello #fedi @dave@other.example", None)
            .await
            .unwrap();
        h.publisher.shutdown().await;

        assert!(note.content.contains("class=\"hashtag\""));
        let mentions = h.store.list_note_mentions(&note.id).await.unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].domain, "other.example");

        let queued = h.store.list_deliveries(10).await.unwrap();
        let mut inboxes: Vec<&str> = queued.iter().map(|q| q.inbox_uri.as_str()).collect();
        inboxes.sort();
        assert_eq!(
            inboxes,
            vec![
                "https://remote.example/users/bob/inbox",
                "https://remote.example/users/carol/inbox"
            ]
        );
        let activity: Value = serde_json::from_str(&queued[0].activity_json).unwrap();
        assert_eq!(activity["type"], "Create");
        assert_eq!(activity["object"]["id"], note.uri);
        assert_eq!(activity["object"]["tag"][0]["name"], "#fedi");
        assert_eq!(activity["object"]["@context"][1]["Hashtag"], "as:Hashtag");
    }

    #[tokio::test]
    async fn reply_to_remote_note_copies_parent_inbox_into_cc() {
        let h = harness().await;
        let bob = remote_follower(&h.store, "someone-else", "bob").await;
        let parent = "https://remote.example/notes/1";
        h.store
            .insert_activity_if_absent(&remote_note_row(&bob.actor_uri, parent))
            .await
            .unwrap();

        h.notes
            .create(&h.alice.id, "reply", Some(parent.to_string()))
            .await
            .unwrap();
        h.publisher.shutdown().await;

        let queued = h.store.list_deliveries(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].inbox_uri, bob.inbox_uri);
        let activity: Value = serde_json::from_str(&queued[0].activity_json).unwrap();
        assert_eq!(activity["object"]["inReplyTo"], parent);
        assert!(activity["cc"].as_array().unwrap().contains(&json!(bob.inbox_uri)));
    }

    #[tokio::test]
    async fn update_and_delete_only_touch_own_notes() {
        let h = harness().await;
        let note = h.notes.create(&h.alice.id, "first", None).await.unwrap();

        let updated = h.notes.update(&h.alice.id, &note.id, "second").await.unwrap();
        assert_eq!(updated.source, "second");
        assert!(updated.updated_at.is_some());

        assert!(matches!(
            h.notes.delete("someone-else", &note.id).await,
            Err(AppError::NotFound)
        ));
        h.notes.delete(&h.alice.id, &note.id).await.unwrap();
        assert!(h.store.get_note(&note.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn like_counts_and_federates_remote_likes() {
        let h = harness().await;
        let bob = remote_follower(&h.store, "someone-else", "bob").await;
        let remote_note = "https://remote.example/notes/7";
        h.store
            .insert_activity_if_absent(&remote_note_row(&bob.actor_uri, remote_note))
            .await
            .unwrap();
        let local = h.notes.create(&h.alice.id, "mine", None).await.unwrap();

        assert!(h.notes.like(&h.alice.id, &local.uri).await.unwrap());
        assert!(!h.notes.like(&h.alice.id, &local.uri).await.unwrap());
        assert_eq!(h.store.get_note(&local.id).await.unwrap().unwrap().like_count, 1);

        assert!(h.notes.like(&h.alice.id, remote_note).await.unwrap());
        assert!(h.notes.unlike(&h.alice.id, remote_note).await.unwrap());
        assert!(matches!(
            h.notes.like(&h.alice.id, "https://nowhere.example/notes/1").await,
            Err(AppError::NotFound)
        ));

        assert!(h.notes.boost(&h.alice.id, &local.uri).await.unwrap());
        assert_eq!(h.store.get_note(&local.id).await.unwrap().unwrap().boost_count, 1);
        assert!(h.notes.unboost(&h.alice.id, &local.uri).await.unwrap());

        h.publisher.shutdown().await;
        let types: Vec<String> = h
            .store
            .list_deliveries(10)
            .await
            .unwrap()
            .iter()
            .map(|item| {
                let activity: Value = serde_json::from_str(&item.activity_json).unwrap();
                activity["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert!(types.contains(&"Like".to_string()));
        assert!(types.contains(&"Undo".to_string()));
    }

    #[test]
    fn empty_or_oversized_text_is_rejected() {
        assert!(validate_source("   ").is_err());
        assert!(validate_source(&"x".repeat(MAX_NOTE_CHARS + 1)).is_err());
        assert_eq!(validate_source(" hi ").unwrap(), "hi");
    }
}
