//! In-process `FederationStore`
//!
//! Every operation runs under a single write lock, which gives the same
//! atomicity as the SQLite statements. Used by tests and by
//! `database.path = ":memory:"`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use super::models::*;
use super::store::FederationStore;
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

#[derive(Default)]
struct Inner {
    local_accounts: HashMap<String, LocalAccount>,
    notes: HashMap<String, Note>,
    mentions: Vec<NoteMention>,
    activities: HashMap<String, Activity>,
    likes: Vec<Like>,
    boosts: Vec<Boost>,
    queue: HashMap<String, DeliveryQueueItem>,
    remote_accounts: HashMap<String, RemoteAccount>,
    follows: HashMap<String, Follow>,
    relays: HashMap<String, Relay>,
}

impl Inner {
    fn adjust_counter(&mut self, object_uri: &str, kind: CounterKind, delta: i64) {
        let apply = |value: &mut i64| *value = (*value + delta).max(0);

        for note in self.notes.values_mut().filter(|n| n.uri == object_uri) {
            match kind {
                CounterKind::Likes => apply(&mut note.like_count),
                CounterKind::Boosts => apply(&mut note.boost_count),
            }
        }
        for activity in self
            .activities
            .values_mut()
            .filter(|a| a.object_uri.as_deref() == Some(object_uri) && a.activity_type == "Create")
        {
            match kind {
                CounterKind::Likes => apply(&mut activity.like_count),
                CounterKind::Boosts => apply(&mut activity.boost_count),
            }
        }
    }
}

/// Store backed by in-process maps
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_created<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl FederationStore for MemoryStore {
    // =========================================================================
    // Local accounts
    // =========================================================================

    async fn insert_local_account(&self, account: &LocalAccount) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .local_accounts
            .values()
            .any(|a| a.username.eq_ignore_ascii_case(&account.username))
        {
            return Err(AppError::Validation(format!(
                "username already taken: {}",
                account.username
            )));
        }
        inner
            .local_accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_local_account(&self, id: &str) -> Result<Option<LocalAccount>> {
        Ok(self.inner.read().await.local_accounts.get(id).cloned())
    }

    async fn get_local_account_by_username(
        &self,
        username: &str,
    ) -> Result<Option<LocalAccount>> {
        let inner = self.inner.read().await;
        Ok(inner
            .local_accounts
            .values()
            .find(|a| a.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn count_local_accounts(&self) -> Result<i64> {
        Ok(self.inner.read().await.local_accounts.len() as i64)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    async fn insert_note(&self, note: &Note, mentions: &[NoteMention]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.notes.values().any(|n| n.uri == note.uri) {
            return Err(AppError::Validation(format!(
                "note uri already exists: {}",
                note.uri
            )));
        }
        inner.notes.insert(note.id.clone(), note.clone());
        inner.mentions.extend(mentions.iter().cloned());
        Ok(())
    }

    async fn get_note(&self, id: &str) -> Result<Option<Note>> {
        Ok(self.inner.read().await.notes.get(id).cloned())
    }

    async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>> {
        let inner = self.inner.read().await;
        Ok(inner.notes.values().find(|n| n.uri == uri).cloned())
    }

    async fn update_note_content(
        &self,
        id: &str,
        content: &str,
        source: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(note) = inner.notes.get_mut(id) else {
            return Ok(false);
        };
        note.content = content.to_string();
        note.source = source.to_string();
        note.updated_at = Some(updated_at);
        Ok(true)
    }

    async fn delete_note(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.notes.remove(id).is_some();
        inner.mentions.retain(|m| m.note_id != id);
        Ok(removed)
    }

    async fn list_notes_by_account(
        &self,
        account_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Note>> {
        let inner = self.inner.read().await;
        let mut notes: Vec<Note> = inner
            .notes
            .values()
            .filter(|n| n.account_id == account_id)
            .filter(|n| before.is_none_or(|before| n.created_at < before))
            .cloned()
            .collect();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        notes.truncate(limit as usize);
        Ok(notes)
    }

    async fn count_notes_by_account(&self, account_id: &str) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .notes
            .values()
            .filter(|n| n.account_id == account_id)
            .count() as i64)
    }

    async fn count_notes(&self) -> Result<i64> {
        Ok(self.inner.read().await.notes.len() as i64)
    }

    async fn list_local_replies(&self, uri: &str) -> Result<Vec<Note>> {
        let inner = self.inner.read().await;
        let replies: Vec<Note> = inner
            .notes
            .values()
            .filter(|n| n.in_reply_to_uri.as_deref() == Some(uri))
            .cloned()
            .collect();
        Ok(sorted_by_created(replies, |n: &Note| n.created_at))
    }

    async fn list_note_mentions(&self, note_id: &str) -> Result<Vec<NoteMention>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mentions
            .iter()
            .filter(|m| m.note_id == note_id)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Activity log
    // =========================================================================

    async fn insert_activity_if_absent(&self, activity: &Activity) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.activities.contains_key(&activity.activity_uri) {
            return Ok(false);
        }
        inner
            .activities
            .insert(activity.activity_uri.clone(), activity.clone());
        Ok(true)
    }

    async fn get_activity_by_uri(&self, activity_uri: &str) -> Result<Option<Activity>> {
        Ok(self.inner.read().await.activities.get(activity_uri).cloned())
    }

    async fn get_activity_by_object_uri(&self, object_uri: &str) -> Result<Option<Activity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .activities
            .values()
            .filter(|a| a.object_uri.as_deref() == Some(object_uri) && a.activity_type == "Create")
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn update_activity_object(
        &self,
        object_uri: &str,
        content: Option<&str>,
        raw_json: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let mut updated = false;
        for activity in inner
            .activities
            .values_mut()
            .filter(|a| a.object_uri.as_deref() == Some(object_uri) && a.activity_type == "Create")
        {
            activity.content = content.map(str::to_string);
            activity.raw_json = raw_json.to_string();
            activity.updated_at = Some(updated_at);
            updated = true;
        }
        Ok(updated)
    }

    async fn delete_activities_by_object_uri(&self, object_uri: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for activity in inner
            .activities
            .values_mut()
            .filter(|a| a.object_uri.as_deref() == Some(object_uri) && a.activity_type == "Create")
        {
            activity.activity_type = "Tombstone".to_string();
            activity.content = None;
            activity.raw_json = "{}".to_string();
            count += 1;
        }
        Ok(count)
    }

    async fn mark_activity_processed(&self, activity_uri: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(activity) = inner.activities.get_mut(activity_uri) {
            activity.processed = true;
        }
        Ok(())
    }

    async fn delete_unprocessed_activity(&self, activity_uri: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let unprocessed = inner
            .activities
            .get(activity_uri)
            .is_some_and(|activity| !activity.processed);
        if unprocessed {
            inner.activities.remove(activity_uri);
        }
        Ok(unprocessed)
    }

    async fn list_remote_replies(&self, uri: &str) -> Result<Vec<Activity>> {
        let inner = self.inner.read().await;
        let replies: Vec<Activity> = inner
            .activities
            .values()
            .filter(|a| {
                a.in_reply_to_uri.as_deref() == Some(uri)
                    && a.activity_type == "Create"
                    && !a.local
            })
            .cloned()
            .collect();
        Ok(sorted_by_created(replies, |a: &Activity| a.created_at))
    }

    // =========================================================================
    // Likes, boosts and counters
    // =========================================================================

    async fn adjust_counter(&self, object_uri: &str, kind: CounterKind, delta: i64) -> Result<()> {
        self.inner
            .write()
            .await
            .adjust_counter(object_uri, kind, delta);
        Ok(())
    }

    async fn create_like(&self, like: &Like) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner
            .likes
            .iter()
            .any(|l| l.account_id == like.account_id && l.object_uri == like.object_uri)
        {
            return Ok(false);
        }
        inner.likes.push(like.clone());
        inner.adjust_counter(&like.object_uri, CounterKind::Likes, 1);
        Ok(true)
    }

    async fn delete_like(&self, account_id: &str, object_uri: &str) -> Result<Option<Like>> {
        let mut inner = self.inner.write().await;
        let Some(position) = inner
            .likes
            .iter()
            .position(|l| l.account_id == account_id && l.object_uri == object_uri)
        else {
            return Ok(None);
        };
        let removed = inner.likes.remove(position);
        inner.adjust_counter(object_uri, CounterKind::Likes, -1);
        Ok(Some(removed))
    }

    async fn create_boost(&self, boost: &Boost) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner
            .boosts
            .iter()
            .any(|b| b.account_id == boost.account_id && b.object_uri == boost.object_uri)
        {
            return Ok(false);
        }
        inner.boosts.push(boost.clone());
        inner.adjust_counter(&boost.object_uri, CounterKind::Boosts, 1);
        Ok(true)
    }

    async fn delete_boost(&self, account_id: &str, object_uri: &str) -> Result<Option<Boost>> {
        let mut inner = self.inner.write().await;
        let Some(position) = inner
            .boosts
            .iter()
            .position(|b| b.account_id == account_id && b.object_uri == object_uri)
        else {
            return Ok(None);
        };
        let removed = inner.boosts.remove(position);
        inner.adjust_counter(object_uri, CounterKind::Boosts, -1);
        Ok(Some(removed))
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    async fn enqueue_deliveries(&self, items: &[DeliveryQueueItem]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for item in items {
            inner.queue.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: chrono::Duration,
    ) -> Result<Vec<DeliveryQueueItem>> {
        let mut inner = self.inner.write().await;
        let mut due: Vec<&mut DeliveryQueueItem> = inner
            .queue
            .values_mut()
            .filter(|item| item.next_retry_at <= now)
            .filter(|item| item.locked_until.is_none_or(|until| until <= now))
            .collect();
        due.sort_by_key(|item| item.next_retry_at);

        let claimed = due
            .into_iter()
            .take(limit as usize)
            .map(|item| {
                item.locked_until = Some(now + lease);
                item.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn complete_delivery(&self, id: &str) -> Result<()> {
        self.inner.write().await.queue.remove(id);
        Ok(())
    }

    async fn reschedule_delivery(
        &self,
        id: &str,
        attempts: i64,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(item) = inner.queue.get_mut(id) {
            item.attempts = attempts;
            item.next_retry_at = next_retry_at;
            item.last_error = Some(last_error.to_string());
            item.locked_until = None;
        }
        Ok(())
    }

    async fn delete_deliveries_for_inbox(&self, inbox_uri: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.queue.len();
        inner.queue.retain(|_, item| item.inbox_uri != inbox_uri);
        Ok((before - inner.queue.len()) as u64)
    }

    async fn list_deliveries(&self, limit: u32) -> Result<Vec<DeliveryQueueItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<DeliveryQueueItem> = inner.queue.values().cloned().collect();
        items.sort_by_key(|item| item.next_retry_at);
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn count_deliveries(&self) -> Result<i64> {
        Ok(self.inner.read().await.queue.len() as i64)
    }

    // =========================================================================
    // Remote accounts
    // =========================================================================

    async fn get_remote_account(&self, id: &str) -> Result<Option<RemoteAccount>> {
        let inner = self.inner.read().await;
        Ok(inner.remote_accounts.values().find(|a| a.id == id).cloned())
    }

    async fn get_remote_account_by_uri(&self, actor_uri: &str) -> Result<Option<RemoteAccount>> {
        Ok(self.inner.read().await.remote_accounts.get(actor_uri).cloned())
    }

    async fn get_remote_account_by_handle(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<RemoteAccount>> {
        let inner = self.inner.read().await;
        Ok(inner
            .remote_accounts
            .values()
            .filter(|a| {
                a.username.eq_ignore_ascii_case(username) && a.domain.eq_ignore_ascii_case(domain)
            })
            .max_by_key(|a| a.last_fetched_at)
            .cloned())
    }

    async fn upsert_remote_account(&self, account: &RemoteAccount) -> Result<RemoteAccount> {
        let mut inner = self.inner.write().await;
        let stored = match inner.remote_accounts.get(&account.actor_uri) {
            Some(existing) => RemoteAccount {
                id: existing.id.clone(),
                ..account.clone()
            },
            None => account.clone(),
        };
        inner
            .remote_accounts
            .insert(stored.actor_uri.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete_remote_account_by_uri(&self, actor_uri: &str) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .remote_accounts
            .remove(actor_uri)
            .is_some())
    }

    // =========================================================================
    // Follows
    // =========================================================================

    async fn insert_follow_if_absent(&self, follow: &Follow) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let conflict = inner.follows.values().any(|f| {
            (f.account_id == follow.account_id && f.target_account_id == follow.target_account_id)
                || (follow.uri.is_some() && f.uri == follow.uri)
        });
        if conflict {
            return Ok(false);
        }
        inner.follows.insert(follow.id.clone(), follow.clone());
        Ok(true)
    }

    async fn get_follow_by_uri(&self, uri: &str) -> Result<Option<Follow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .follows
            .values()
            .find(|f| f.uri.as_deref() == Some(uri))
            .cloned())
    }

    async fn get_follow(&self, account_id: &str, target_account_id: &str) -> Result<Option<Follow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .follows
            .values()
            .find(|f| f.account_id == account_id && f.target_account_id == target_account_id)
            .cloned())
    }

    async fn accept_follow(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(follow) = inner.follows.get_mut(id) else {
            return Ok(false);
        };
        follow.accepted = true;
        Ok(true)
    }

    async fn delete_follow(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.follows.remove(id).is_some())
    }

    async fn delete_follows_for_account(&self, account_id: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.follows.len();
        inner
            .follows
            .retain(|_, f| f.account_id != account_id && f.target_account_id != account_id);
        Ok((before - inner.follows.len()) as u64)
    }

    async fn list_followers(&self, target_account_id: &str) -> Result<Vec<Follow>> {
        let inner = self.inner.read().await;
        let follows: Vec<Follow> = inner
            .follows
            .values()
            .filter(|f| f.target_account_id == target_account_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(follows, |f: &Follow| f.created_at))
    }

    async fn list_following(&self, account_id: &str) -> Result<Vec<Follow>> {
        let inner = self.inner.read().await;
        let follows: Vec<Follow> = inner
            .follows
            .values()
            .filter(|f| f.account_id == account_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(follows, |f: &Follow| f.created_at))
    }

    async fn follower_inboxes(&self, local_account_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let inboxes: BTreeSet<String> = inner
            .follows
            .values()
            .filter(|f| f.target_account_id == local_account_id && f.accepted)
            .filter_map(|f| {
                inner
                    .remote_accounts
                    .values()
                    .find(|a| a.id == f.account_id)
                    .map(|a| a.inbox_uri.clone())
            })
            .collect();
        Ok(inboxes.into_iter().collect())
    }

    async fn is_followed_locally(&self, remote_account_id: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.follows.values().any(|f| {
            f.target_account_id == remote_account_id
                && f.accepted
                && inner.local_accounts.contains_key(&f.account_id)
        }))
    }

    // =========================================================================
    // Relays
    // =========================================================================

    async fn insert_relay(&self, relay: &Relay) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.relays.values().any(|r| r.actor_uri == relay.actor_uri) {
            return Err(AppError::Validation(format!(
                "relay already exists: {}",
                relay.actor_uri
            )));
        }
        inner.relays.insert(relay.id.clone(), relay.clone());
        Ok(())
    }

    async fn get_relay(&self, id: &str) -> Result<Option<Relay>> {
        Ok(self.inner.read().await.relays.get(id).cloned())
    }

    async fn get_relay_by_actor_uri(&self, actor_uri: &str) -> Result<Option<Relay>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relays
            .values()
            .find(|r| r.actor_uri == actor_uri)
            .cloned())
    }

    async fn get_relay_by_follow_uri(&self, follow_uri: &str) -> Result<Option<Relay>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relays
            .values()
            .find(|r| r.follow_uri == follow_uri)
            .cloned())
    }

    async fn get_relay_by_inbox(&self, inbox_uri: &str) -> Result<Option<Relay>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relays
            .values()
            .find(|r| r.inbox_uri == inbox_uri)
            .cloned())
    }

    async fn list_relays(&self) -> Result<Vec<Relay>> {
        let inner = self.inner.read().await;
        let relays: Vec<Relay> = inner.relays.values().cloned().collect();
        Ok(sorted_by_created(relays, |r: &Relay| r.created_at))
    }

    async fn update_relay_status(
        &self,
        id: &str,
        status: RelayStatus,
        accepted_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(relay) = inner.relays.get_mut(id) else {
            return Ok(false);
        };
        relay.status = status.as_str().to_string();
        if accepted_at.is_some() {
            relay.accepted_at = accepted_at;
        }
        Ok(true)
    }

    async fn delete_relay(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.relays.remove(id).is_some())
    }

    async fn active_relay_inboxes(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let inboxes: BTreeSet<String> = inner
            .relays
            .values()
            .filter(|r| r.status() == RelayStatus::Active)
            .map(|r| r.inbox_uri.clone())
            .collect();
        Ok(inboxes.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_item(inbox: &str, due: DateTime<Utc>) -> DeliveryQueueItem {
        DeliveryQueueItem {
            next_retry_at: due,
            ..DeliveryQueueItem::new(inbox, "{}")
        }
    }

    #[tokio::test]
    async fn claimed_items_are_hidden_until_lease_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .enqueue_deliveries(&[queue_item("https://a.example/inbox", now)])
            .await
            .unwrap();

        let lease = chrono::Duration::seconds(60);
        let first = store.claim_due_deliveries(now, 10, lease).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.claim_due_deliveries(now, 10, lease).await.unwrap();
        assert!(second.is_empty());

        let after_lease = store
            .claim_due_deliveries(now + chrono::Duration::seconds(61), 10, lease)
            .await
            .unwrap();
        assert_eq!(after_lease.len(), 1);
    }

    #[tokio::test]
    async fn future_items_are_not_claimed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .enqueue_deliveries(&[queue_item(
                "https://a.example/inbox",
                now + chrono::Duration::seconds(10),
            )])
            .await
            .unwrap();

        let claimed = store
            .claim_due_deliveries(now, 10, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn counters_never_drop_below_zero() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let note = Note {
            id: EntityId::new().0,
            account_id: "acct".to_string(),
            uri: "http://localhost/notes/1".to_string(),
            content: "<p>hi</p>".to_string(),
            source: "hi".to_string(),
            in_reply_to_uri: None,
            like_count: 0,
            boost_count: 0,
            created_at: now,
            updated_at: None,
        };
        store.insert_note(&note, &[]).await.unwrap();

        store
            .adjust_counter(&note.uri, CounterKind::Likes, -1)
            .await
            .unwrap();
        store
            .adjust_counter(&note.uri, CounterKind::Boosts, 2)
            .await
            .unwrap();

        let stored = store.get_note(&note.id).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 0);
        assert_eq!(stored.boost_count, 2);
    }
}
