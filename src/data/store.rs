//! Persistence trait shared by every federation component
//!
//! Components take an `Arc<dyn FederationStore>` so that the SQLite store
//! and the in-memory store are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

#[async_trait]
pub trait FederationStore: Send + Sync {
    // =========================================================================
    // Local accounts
    // =========================================================================

    async fn insert_local_account(&self, account: &LocalAccount) -> Result<()>;
    async fn get_local_account(&self, id: &str) -> Result<Option<LocalAccount>>;
    async fn get_local_account_by_username(&self, username: &str)
    -> Result<Option<LocalAccount>>;
    async fn count_local_accounts(&self) -> Result<i64>;

    // =========================================================================
    // Notes
    // =========================================================================

    async fn insert_note(&self, note: &Note, mentions: &[NoteMention]) -> Result<()>;
    async fn get_note(&self, id: &str) -> Result<Option<Note>>;
    async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>>;
    /// Replace content; returns false when the note does not exist
    async fn update_note_content(
        &self,
        id: &str,
        content: &str,
        source: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_note(&self, id: &str) -> Result<bool>;
    /// Newest first, strictly older than `before` when given
    async fn list_notes_by_account(
        &self,
        account_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Note>>;
    async fn count_notes_by_account(&self, account_id: &str) -> Result<i64>;
    async fn count_notes(&self) -> Result<i64>;
    /// Local notes whose `in_reply_to_uri` equals `uri`
    async fn list_local_replies(&self, uri: &str) -> Result<Vec<Note>>;
    async fn list_note_mentions(&self, note_id: &str) -> Result<Vec<NoteMention>>;

    // =========================================================================
    // Activity log
    // =========================================================================

    /// Atomic insert keyed on `activity_uri`; false when already present
    async fn insert_activity_if_absent(&self, activity: &Activity) -> Result<bool>;
    async fn get_activity_by_uri(&self, activity_uri: &str) -> Result<Option<Activity>>;
    /// Most recent non-deleted `Create` carrying this object
    async fn get_activity_by_object_uri(&self, object_uri: &str) -> Result<Option<Activity>>;
    async fn update_activity_object(
        &self,
        object_uri: &str,
        content: Option<&str>,
        raw_json: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_activities_by_object_uri(&self, object_uri: &str) -> Result<u64>;
    async fn mark_activity_processed(&self, activity_uri: &str) -> Result<()>;
    /// Drop a row whose side effects never completed so a redelivery can retry it
    async fn delete_unprocessed_activity(&self, activity_uri: &str) -> Result<bool>;
    /// Remote `Create` rows replying to `uri`
    async fn list_remote_replies(&self, uri: &str) -> Result<Vec<Activity>>;

    // =========================================================================
    // Likes, boosts and counters
    // =========================================================================

    /// Atomically add or subtract from a counter on the note or activity
    /// identified by `object_uri`; counters never drop below zero
    async fn adjust_counter(&self, object_uri: &str, kind: CounterKind, delta: i64)
    -> Result<()>;
    /// Insert the edge and bump `like_count` in one step; false if it existed
    async fn create_like(&self, like: &Like) -> Result<bool>;
    /// Remove the edge and decrement `like_count` in one step
    async fn delete_like(&self, account_id: &str, object_uri: &str) -> Result<Option<Like>>;
    async fn create_boost(&self, boost: &Boost) -> Result<bool>;
    async fn delete_boost(&self, account_id: &str, object_uri: &str)
    -> Result<Option<Boost>>;

    // =========================================================================
    // Delivery queue
    // =========================================================================

    async fn enqueue_deliveries(&self, items: &[DeliveryQueueItem]) -> Result<()>;
    /// Lease up to `limit` due items; a leased item is invisible to other
    /// callers until `now + lease`
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: chrono::Duration,
    ) -> Result<Vec<DeliveryQueueItem>>;
    async fn complete_delivery(&self, id: &str) -> Result<()>;
    async fn reschedule_delivery(
        &self,
        id: &str,
        attempts: i64,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()>;
    async fn delete_deliveries_for_inbox(&self, inbox_uri: &str) -> Result<u64>;
    async fn list_deliveries(&self, limit: u32) -> Result<Vec<DeliveryQueueItem>>;
    async fn count_deliveries(&self) -> Result<i64>;

    // =========================================================================
    // Remote accounts
    // =========================================================================

    async fn get_remote_account(&self, id: &str) -> Result<Option<RemoteAccount>>;
    async fn get_remote_account_by_uri(&self, actor_uri: &str)
    -> Result<Option<RemoteAccount>>;
    async fn get_remote_account_by_handle(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<RemoteAccount>>;
    /// Insert or refresh by `actor_uri`; an existing row keeps its id
    async fn upsert_remote_account(&self, account: &RemoteAccount) -> Result<RemoteAccount>;
    async fn delete_remote_account_by_uri(&self, actor_uri: &str) -> Result<bool>;

    // =========================================================================
    // Follows
    // =========================================================================

    /// False when an edge between the same pair already exists
    async fn insert_follow_if_absent(&self, follow: &Follow) -> Result<bool>;
    async fn get_follow_by_uri(&self, uri: &str) -> Result<Option<Follow>>;
    async fn get_follow(&self, account_id: &str, target_account_id: &str)
    -> Result<Option<Follow>>;
    async fn accept_follow(&self, id: &str) -> Result<bool>;
    async fn delete_follow(&self, id: &str) -> Result<bool>;
    /// Drop every edge touching the account, in either direction
    async fn delete_follows_for_account(&self, account_id: &str) -> Result<u64>;
    async fn list_followers(&self, target_account_id: &str) -> Result<Vec<Follow>>;
    async fn list_following(&self, account_id: &str) -> Result<Vec<Follow>>;
    /// Inboxes of accepted remote followers of a local account
    async fn follower_inboxes(&self, local_account_id: &str) -> Result<Vec<String>>;
    /// True when any local account has an accepted follow of this remote account
    async fn is_followed_locally(&self, remote_account_id: &str) -> Result<bool>;

    // =========================================================================
    // Relays
    // =========================================================================

    async fn insert_relay(&self, relay: &Relay) -> Result<()>;
    async fn get_relay(&self, id: &str) -> Result<Option<Relay>>;
    async fn get_relay_by_actor_uri(&self, actor_uri: &str) -> Result<Option<Relay>>;
    async fn get_relay_by_follow_uri(&self, follow_uri: &str) -> Result<Option<Relay>>;
    async fn get_relay_by_inbox(&self, inbox_uri: &str) -> Result<Option<Relay>>;
    async fn list_relays(&self) -> Result<Vec<Relay>>;
    async fn update_relay_status(
        &self,
        id: &str,
        status: RelayStatus,
        accepted_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    async fn delete_relay(&self, id: &str) -> Result<bool>;
    async fn active_relay_inboxes(&self) -> Result<Vec<String>>;
}
