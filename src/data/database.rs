//! SQLite database operations
//!
//! `SqliteStore` is the production `FederationStore`. Timestamps are stored
//! as RFC 3339 text and compared through `julianday()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;

use super::models::*;
use super::store::FederationStore;
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// Database connection pool wrapper.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and run migrations
    pub async fn connect(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

async fn adjust_counter_on(
    conn: &mut SqliteConnection,
    object_uri: &str,
    kind: CounterKind,
    delta: i64,
) -> Result<()> {
    let column = kind.column();

    sqlx::query(&format!(
        "UPDATE notes SET {column} = MAX({column} + ?, 0) WHERE uri = ?"
    ))
    .bind(delta)
    .bind(object_uri)
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "UPDATE activities SET {column} = MAX({column} + ?, 0) \
         WHERE object_uri = ? AND activity_type = 'Create'"
    ))
    .bind(delta)
    .bind(object_uri)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

const ACTIVITY_COLUMNS: &str = "id, activity_uri, activity_type, actor_uri, object_uri, \
     in_reply_to_uri, content, raw_json, processed, local, from_relay, like_count, \
     boost_count, created_at, updated_at";

const QUEUE_COLUMNS: &str =
    "id, inbox_uri, activity_json, attempts, next_retry_at, locked_until, last_error, created_at";

const REMOTE_ACCOUNT_COLUMNS: &str = "id, username, domain, actor_uri, display_name, summary, \
     inbox_uri, outbox_uri, public_key_pem, public_key_id, last_fetched_at";

const RELAY_COLUMNS: &str = "id, actor_uri, inbox_uri, follow_uri, status, accepted_at, created_at";

#[async_trait]
impl FederationStore for SqliteStore {
    // =========================================================================
    // Local accounts
    // =========================================================================

    async fn insert_local_account(&self, account: &LocalAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO local_accounts (
                id, username, display_name, summary, private_key_pem, public_key_pem, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.display_name)
        .bind(&account.summary)
        .bind(&account.private_key_pem)
        .bind(&account.public_key_pem)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_local_account(&self, id: &str) -> Result<Option<LocalAccount>> {
        let account = sqlx::query_as::<_, LocalAccount>("SELECT * FROM local_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn get_local_account_by_username(
        &self,
        username: &str,
    ) -> Result<Option<LocalAccount>> {
        let account = sqlx::query_as::<_, LocalAccount>(
            "SELECT * FROM local_accounts WHERE username = ? COLLATE NOCASE",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn count_local_accounts(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM local_accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    async fn insert_note(&self, note: &Note, mentions: &[NoteMention]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notes (
                id, account_id, uri, content, source, in_reply_to_uri,
                like_count, boost_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&note.id)
        .bind(&note.account_id)
        .bind(&note.uri)
        .bind(&note.content)
        .bind(&note.source)
        .bind(&note.in_reply_to_uri)
        .bind(note.like_count)
        .bind(note.boost_count)
        .bind(note.created_at)
        .bind(note.updated_at)
        .execute(&mut *tx)
        .await?;

        for mention in mentions {
            sqlx::query(
                "INSERT INTO note_mentions (id, note_id, username, domain, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&mention.id)
            .bind(&mention.note_id)
            .bind(&mention.username)
            .bind(&mention.domain)
            .bind(mention.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_note(&self, id: &str) -> Result<Option<Note>> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(note)
    }

    async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(note)
    }

    async fn update_note_content(
        &self,
        id: &str,
        content: &str,
        source: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE notes SET content = ?, source = ?, updated_at = ? WHERE id = ?")
                .bind(content)
                .bind(source)
                .bind(updated_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_note(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_notes_by_account(
        &self,
        account_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Note>> {
        let notes = match before {
            Some(before) => {
                sqlx::query_as::<_, Note>(
                    r#"
                    SELECT * FROM notes
                    WHERE account_id = ? AND julianday(created_at) < julianday(?)
                    ORDER BY julianday(created_at) DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(account_id)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Note>(
                    r#"
                    SELECT * FROM notes
                    WHERE account_id = ?
                    ORDER BY julianday(created_at) DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(account_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(notes)
    }

    async fn count_notes_by_account(&self, account_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_notes(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_local_replies(&self, uri: &str) -> Result<Vec<Note>> {
        let notes = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE in_reply_to_uri = ? ORDER BY julianday(created_at) ASC",
        )
        .bind(uri)
        .fetch_all(&self.pool)
        .await?;
        Ok(notes)
    }

    async fn list_note_mentions(&self, note_id: &str) -> Result<Vec<NoteMention>> {
        let mentions = sqlx::query_as::<_, NoteMention>(
            "SELECT * FROM note_mentions WHERE note_id = ? ORDER BY created_at ASC",
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(mentions)
    }

    // =========================================================================
    // Activity log
    // =========================================================================

    async fn insert_activity_if_absent(&self, activity: &Activity) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO activities (
                id, activity_uri, activity_type, actor_uri, object_uri, in_reply_to_uri,
                content, raw_json, processed, local, from_relay, like_count, boost_count,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(activity_uri) DO NOTHING
            "#,
        )
        .bind(&activity.id)
        .bind(&activity.activity_uri)
        .bind(&activity.activity_type)
        .bind(&activity.actor_uri)
        .bind(&activity.object_uri)
        .bind(&activity.in_reply_to_uri)
        .bind(&activity.content)
        .bind(&activity.raw_json)
        .bind(activity.processed)
        .bind(activity.local)
        .bind(activity.from_relay)
        .bind(activity.like_count)
        .bind(activity.boost_count)
        .bind(activity.created_at)
        .bind(activity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_activity_by_uri(&self, activity_uri: &str) -> Result<Option<Activity>> {
        let activity = sqlx::query_as::<_, Activity>(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE activity_uri = ?"
        ))
        .bind(activity_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(activity)
    }

    async fn get_activity_by_object_uri(&self, object_uri: &str) -> Result<Option<Activity>> {
        let activity = sqlx::query_as::<_, Activity>(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE object_uri = ? AND activity_type = 'Create' \
             ORDER BY julianday(created_at) DESC LIMIT 1"
        ))
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(activity)
    }

    async fn update_activity_object(
        &self,
        object_uri: &str,
        content: Option<&str>,
        raw_json: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE activities SET content = ?, raw_json = ?, updated_at = ?
            WHERE object_uri = ? AND activity_type = 'Create'
            "#,
        )
        .bind(content)
        .bind(raw_json)
        .bind(updated_at)
        .bind(object_uri)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_activities_by_object_uri(&self, object_uri: &str) -> Result<u64> {
        // Rows are tombstoned rather than removed so a replayed Create stays a duplicate.
        let result = sqlx::query(
            r#"
            UPDATE activities
            SET activity_type = 'Tombstone', content = NULL, raw_json = '{}'
            WHERE object_uri = ? AND activity_type = 'Create'
            "#,
        )
        .bind(object_uri)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_activity_processed(&self, activity_uri: &str) -> Result<()> {
        sqlx::query("UPDATE activities SET processed = 1 WHERE activity_uri = ?")
            .bind(activity_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_unprocessed_activity(&self, activity_uri: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM activities WHERE activity_uri = ? AND processed = 0")
                .bind(activity_uri)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_remote_replies(&self, uri: &str) -> Result<Vec<Activity>> {
        let replies = sqlx::query_as::<_, Activity>(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE in_reply_to_uri = ? AND activity_type = 'Create' AND local = 0 \
             ORDER BY julianday(created_at) ASC"
        ))
        .bind(uri)
        .fetch_all(&self.pool)
        .await?;
        Ok(replies)
    }

    // =========================================================================
    // Likes, boosts and counters
    // =========================================================================

    async fn adjust_counter(&self, object_uri: &str, kind: CounterKind, delta: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        adjust_counter_on(&mut *tx, object_uri, kind, delta).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_like(&self, like: &Like) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO likes (id, account_id, object_uri, uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id, object_uri) DO NOTHING
            "#,
        )
        .bind(&like.id)
        .bind(&like.account_id)
        .bind(&like.object_uri)
        .bind(&like.uri)
        .bind(like.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            adjust_counter_on(&mut *tx, &like.object_uri, CounterKind::Likes, 1).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_like(&self, account_id: &str, object_uri: &str) -> Result<Option<Like>> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query_as::<_, Like>(
            "DELETE FROM likes WHERE account_id = ? AND object_uri = ? RETURNING *",
        )
        .bind(account_id)
        .bind(object_uri)
        .fetch_optional(&mut *tx)
        .await?;

        if removed.is_some() {
            adjust_counter_on(&mut *tx, object_uri, CounterKind::Likes, -1).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn create_boost(&self, boost: &Boost) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO boosts (id, account_id, object_uri, uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id, object_uri) DO NOTHING
            "#,
        )
        .bind(&boost.id)
        .bind(&boost.account_id)
        .bind(&boost.object_uri)
        .bind(&boost.uri)
        .bind(boost.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            adjust_counter_on(&mut *tx, &boost.object_uri, CounterKind::Boosts, 1).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_boost(&self, account_id: &str, object_uri: &str) -> Result<Option<Boost>> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query_as::<_, Boost>(
            "DELETE FROM boosts WHERE account_id = ? AND object_uri = ? RETURNING *",
        )
        .bind(account_id)
        .bind(object_uri)
        .fetch_optional(&mut *tx)
        .await?;

        if removed.is_some() {
            adjust_counter_on(&mut *tx, object_uri, CounterKind::Boosts, -1).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    async fn enqueue_deliveries(&self, items: &[DeliveryQueueItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO delivery_queue (
                    id, inbox_uri, activity_json, attempts, next_retry_at,
                    locked_until, last_error, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&item.inbox_uri)
            .bind(&item.activity_json)
            .bind(item.attempts)
            .bind(item.next_retry_at)
            .bind(item.locked_until)
            .bind(&item.last_error)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: chrono::Duration,
    ) -> Result<Vec<DeliveryQueueItem>> {
        // Single statement, so two workers can never lease the same row.
        let items = sqlx::query_as::<_, DeliveryQueueItem>(&format!(
            r#"
            UPDATE delivery_queue SET locked_until = ?
            WHERE id IN (
                SELECT id FROM delivery_queue
                WHERE julianday(next_retry_at) <= julianday(?)
                  AND (locked_until IS NULL OR julianday(locked_until) <= julianday(?))
                ORDER BY julianday(next_retry_at) ASC
                LIMIT ?
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(now + lease)
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn complete_delivery(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM delivery_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule_delivery(
        &self,
        id: &str,
        attempts: i64,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET attempts = ?, next_retry_at = ?, last_error = ?, locked_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_deliveries_for_inbox(&self, inbox_uri: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_queue WHERE inbox_uri = ?")
            .bind(inbox_uri)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_deliveries(&self, limit: u32) -> Result<Vec<DeliveryQueueItem>> {
        let items = sqlx::query_as::<_, DeliveryQueueItem>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM delivery_queue \
             ORDER BY julianday(next_retry_at) ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn count_deliveries(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Remote accounts
    // =========================================================================

    async fn get_remote_account(&self, id: &str) -> Result<Option<RemoteAccount>> {
        let account = sqlx::query_as::<_, RemoteAccount>(&format!(
            "SELECT {REMOTE_ACCOUNT_COLUMNS} FROM remote_accounts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn get_remote_account_by_uri(&self, actor_uri: &str) -> Result<Option<RemoteAccount>> {
        let account = sqlx::query_as::<_, RemoteAccount>(&format!(
            "SELECT {REMOTE_ACCOUNT_COLUMNS} FROM remote_accounts WHERE actor_uri = ?"
        ))
        .bind(actor_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn get_remote_account_by_handle(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<RemoteAccount>> {
        let account = sqlx::query_as::<_, RemoteAccount>(&format!(
            "SELECT {REMOTE_ACCOUNT_COLUMNS} FROM remote_accounts \
             WHERE username = ? COLLATE NOCASE AND domain = ? COLLATE NOCASE \
             ORDER BY julianday(last_fetched_at) DESC LIMIT 1"
        ))
        .bind(username)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn upsert_remote_account(&self, account: &RemoteAccount) -> Result<RemoteAccount> {
        let stored = sqlx::query_as::<_, RemoteAccount>(&format!(
            r#"
            INSERT INTO remote_accounts (
                id, username, domain, actor_uri, display_name, summary, inbox_uri,
                outbox_uri, public_key_pem, public_key_id, last_fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor_uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                display_name = excluded.display_name,
                summary = excluded.summary,
                inbox_uri = excluded.inbox_uri,
                outbox_uri = excluded.outbox_uri,
                public_key_pem = excluded.public_key_pem,
                public_key_id = excluded.public_key_id,
                last_fetched_at = excluded.last_fetched_at
            RETURNING {REMOTE_ACCOUNT_COLUMNS}
            "#
        ))
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.domain)
        .bind(&account.actor_uri)
        .bind(&account.display_name)
        .bind(&account.summary)
        .bind(&account.inbox_uri)
        .bind(&account.outbox_uri)
        .bind(&account.public_key_pem)
        .bind(&account.public_key_id)
        .bind(account.last_fetched_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn delete_remote_account_by_uri(&self, actor_uri: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM remote_accounts WHERE actor_uri = ?")
            .bind(actor_uri)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    async fn insert_follow_if_absent(&self, follow: &Follow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO follows (id, account_id, target_account_id, uri, accepted, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&follow.id)
        .bind(&follow.account_id)
        .bind(&follow.target_account_id)
        .bind(&follow.uri)
        .bind(follow.accepted)
        .bind(follow.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_follow_by_uri(&self, uri: &str) -> Result<Option<Follow>> {
        let follow = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(follow)
    }

    async fn get_follow(&self, account_id: &str, target_account_id: &str) -> Result<Option<Follow>> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follow)
    }

    async fn accept_follow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE follows SET accepted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_follow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM follows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_follows_for_account(&self, account_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM follows WHERE account_id = ? OR target_account_id = ?")
                .bind(account_id)
                .bind(account_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn list_followers(&self, target_account_id: &str) -> Result<Vec<Follow>> {
        let follows = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE target_account_id = ? ORDER BY created_at ASC",
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    async fn list_following(&self, account_id: &str) -> Result<Vec<Follow>> {
        let follows = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE account_id = ? ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    async fn follower_inboxes(&self, local_account_id: &str) -> Result<Vec<String>> {
        let inboxes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT r.inbox_uri
            FROM follows f
            JOIN remote_accounts r ON r.id = f.account_id
            WHERE f.target_account_id = ? AND f.accepted = 1
            ORDER BY r.inbox_uri
            "#,
        )
        .bind(local_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(inboxes)
    }

    async fn is_followed_locally(&self, remote_account_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM follows f
                JOIN local_accounts l ON l.id = f.account_id
                WHERE f.target_account_id = ? AND f.accepted = 1
            )
            "#,
        )
        .bind(remote_account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    // =========================================================================
    // Relays
    // =========================================================================

    async fn insert_relay(&self, relay: &Relay) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relays (id, actor_uri, inbox_uri, follow_uri, status, accepted_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&relay.id)
        .bind(&relay.actor_uri)
        .bind(&relay.inbox_uri)
        .bind(&relay.follow_uri)
        .bind(&relay.status)
        .bind(relay.accepted_at)
        .bind(relay.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_relay(&self, id: &str) -> Result<Option<Relay>> {
        let relay = sqlx::query_as::<_, Relay>(&format!(
            "SELECT {RELAY_COLUMNS} FROM relays WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(relay)
    }

    async fn get_relay_by_actor_uri(&self, actor_uri: &str) -> Result<Option<Relay>> {
        let relay = sqlx::query_as::<_, Relay>(&format!(
            "SELECT {RELAY_COLUMNS} FROM relays WHERE actor_uri = ?"
        ))
        .bind(actor_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(relay)
    }

    async fn get_relay_by_follow_uri(&self, follow_uri: &str) -> Result<Option<Relay>> {
        let relay = sqlx::query_as::<_, Relay>(&format!(
            "SELECT {RELAY_COLUMNS} FROM relays WHERE follow_uri = ?"
        ))
        .bind(follow_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(relay)
    }

    async fn get_relay_by_inbox(&self, inbox_uri: &str) -> Result<Option<Relay>> {
        let relay = sqlx::query_as::<_, Relay>(&format!(
            "SELECT {RELAY_COLUMNS} FROM relays WHERE inbox_uri = ? LIMIT 1"
        ))
        .bind(inbox_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(relay)
    }

    async fn list_relays(&self) -> Result<Vec<Relay>> {
        let relays = sqlx::query_as::<_, Relay>(&format!(
            "SELECT {RELAY_COLUMNS} FROM relays ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(relays)
    }

    async fn update_relay_status(
        &self,
        id: &str,
        status: RelayStatus,
        accepted_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE relays SET status = ?, accepted_at = COALESCE(?, accepted_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(accepted_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_relay(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM relays WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_relay_inboxes(&self) -> Result<Vec<String>> {
        let inboxes = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT inbox_uri FROM relays WHERE status = ? ORDER BY inbox_uri",
        )
        .bind(RelayStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(inboxes)
    }
}
