//! Database tests

use super::*;
use chrono::{Duration, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (SqliteStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = SqliteStore::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn local_account(username: &str) -> LocalAccount {
    LocalAccount {
        id: EntityId::new().0,
        username: username.to_string(),
        display_name: Some("Test User".to_string()),
        summary: None,
        private_key_pem: "test_private_key".to_string(),
        public_key_pem: "test_public_key".to_string(),
        created_at: Utc::now(),
    }
}

fn remote_account(actor_uri: &str) -> RemoteAccount {
    RemoteAccount {
        id: EntityId::new().0,
        username: "alice".to_string(),
        domain: "remote.example".to_string(),
        actor_uri: actor_uri.to_string(),
        display_name: None,
        summary: None,
        inbox_uri: format!("{actor_uri}/inbox"),
        outbox_uri: None,
        public_key_pem: "pem".to_string(),
        public_key_id: format!("{actor_uri}#main-key"),
        last_fetched_at: Utc::now(),
    }
}

fn note(account_id: &str, uri: &str) -> Note {
    Note {
        id: EntityId::new().0,
        account_id: account_id.to_string(),
        uri: uri.to_string(),
        content: "<p>Hello, world!</p>".to_string(),
        source: "Hello, world!".to_string(),
        in_reply_to_uri: None,
        like_count: 0,
        boost_count: 0,
        created_at: Utc::now(),
        updated_at: None,
    }
}

fn create_activity(activity_uri: &str, object_uri: &str) -> Activity {
    Activity {
        id: EntityId::new().0,
        activity_uri: activity_uri.to_string(),
        activity_type: "Create".to_string(),
        actor_uri: "https://remote.example/users/alice".to_string(),
        object_uri: Some(object_uri.to_string()),
        in_reply_to_uri: None,
        content: Some("<p>remote</p>".to_string()),
        raw_json: "{}".to_string(),
        processed: false,
        local: false,
        from_relay: false,
        like_count: 0,
        boost_count: 0,
        created_at: Utc::now(),
        updated_at: None,
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (db, _temp_dir) = create_test_db().await;
    assert_eq!(db.count_local_accounts().await.unwrap(), 0);
}

#[tokio::test]
async fn test_local_account_lookup_is_case_insensitive() {
    let (db, _temp_dir) = create_test_db().await;
    let account = local_account("Alice");
    db.insert_local_account(&account).await.unwrap();

    let found = db.get_local_account_by_username("alice").await.unwrap();
    assert_eq!(found.map(|a| a.id), Some(account.id));
}

#[tokio::test]
async fn test_activity_insert_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let activity = create_activity(
        "https://remote.example/activities/1",
        "https://remote.example/notes/1",
    );

    assert!(db.insert_activity_if_absent(&activity).await.unwrap());

    let replay = Activity {
        id: EntityId::new().0,
        ..activity.clone()
    };
    assert!(!db.insert_activity_if_absent(&replay).await.unwrap());

    let stored = db
        .get_activity_by_uri(&activity.activity_uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, activity.id);
}

#[tokio::test]
async fn test_deleted_object_stays_deduplicated() {
    let (db, _temp_dir) = create_test_db().await;
    let activity = create_activity(
        "https://remote.example/activities/2",
        "https://remote.example/notes/2",
    );
    db.insert_activity_if_absent(&activity).await.unwrap();

    let removed = db
        .delete_activities_by_object_uri("https://remote.example/notes/2")
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(
        db.get_activity_by_object_uri("https://remote.example/notes/2")
            .await
            .unwrap()
            .is_none()
    );
    assert!(!db.insert_activity_if_absent(&activity).await.unwrap());
}

#[tokio::test]
async fn test_only_unprocessed_activity_is_released() {
    let (db, _temp_dir) = create_test_db().await;
    let pending = create_activity(
        "https://remote.example/activities/3",
        "https://remote.example/notes/3",
    );
    let done = create_activity(
        "https://remote.example/activities/4",
        "https://remote.example/notes/4",
    );
    db.insert_activity_if_absent(&pending).await.unwrap();
    db.insert_activity_if_absent(&done).await.unwrap();
    db.mark_activity_processed(&done.activity_uri).await.unwrap();

    assert!(db.delete_unprocessed_activity(&pending.activity_uri).await.unwrap());
    assert!(db.get_activity_by_uri(&pending.activity_uri).await.unwrap().is_none());
    assert!(db.insert_activity_if_absent(&pending).await.unwrap());

    assert!(!db.delete_unprocessed_activity(&done.activity_uri).await.unwrap());
    assert!(db.get_activity_by_uri(&done.activity_uri).await.unwrap().is_some());
}

#[tokio::test]
async fn test_like_updates_counter_atomically() {
    let (db, _temp_dir) = create_test_db().await;
    let account = local_account("bob");
    db.insert_local_account(&account).await.unwrap();
    let note = note(&account.id, "http://localhost/notes/abc");
    db.insert_note(&note, &[]).await.unwrap();

    let like = Like {
        id: EntityId::new().0,
        account_id: account.id.clone(),
        object_uri: note.uri.clone(),
        uri: None,
        created_at: Utc::now(),
    };
    assert!(db.create_like(&like).await.unwrap());
    assert!(!db.create_like(&like).await.unwrap());
    assert_eq!(db.get_note(&note.id).await.unwrap().unwrap().like_count, 1);

    assert!(db.delete_like(&account.id, &note.uri).await.unwrap().is_some());
    assert!(db.delete_like(&account.id, &note.uri).await.unwrap().is_none());
    assert_eq!(db.get_note(&note.id).await.unwrap().unwrap().like_count, 0);
}

#[tokio::test]
async fn test_claim_leases_due_items_once() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();
    let due = DeliveryQueueItem {
        next_retry_at: now - Duration::seconds(1),
        ..DeliveryQueueItem::new("https://a.example/inbox", "{}")
    };
    let later = DeliveryQueueItem {
        next_retry_at: now + Duration::seconds(30),
        ..DeliveryQueueItem::new("https://b.example/inbox", "{}")
    };
    db.enqueue_deliveries(&[due.clone(), later]).await.unwrap();

    let lease = Duration::seconds(120);
    let claimed = db.claim_due_deliveries(now, 10, lease).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due.id);
    assert!(db.claim_due_deliveries(now, 10, lease).await.unwrap().is_empty());

    db.reschedule_delivery(&due.id, 1, now - Duration::seconds(1), "boom")
        .await
        .unwrap();
    let reclaimed = db.claim_due_deliveries(now, 10, lease).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 1);
    assert_eq!(reclaimed[0].last_error.as_deref(), Some("boom"));

    db.complete_delivery(&due.id).await.unwrap();
    assert_eq!(db.count_deliveries().await.unwrap(), 1);
}

#[tokio::test]
async fn test_remote_account_upsert_keeps_id() {
    let (db, _temp_dir) = create_test_db().await;
    let first = db
        .upsert_remote_account(&remote_account("https://remote.example/users/alice"))
        .await
        .unwrap();

    let mut refreshed = remote_account("https://remote.example/users/alice");
    refreshed.display_name = Some("Alice".to_string());
    let second = db.upsert_remote_account(&refreshed).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.display_name.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn test_follower_inboxes_only_include_accepted_remote_followers() {
    let (db, _temp_dir) = create_test_db().await;
    let local = local_account("carol");
    db.insert_local_account(&local).await.unwrap();

    let accepted = db
        .upsert_remote_account(&remote_account("https://a.example/users/alice"))
        .await
        .unwrap();
    let pending = db
        .upsert_remote_account(&remote_account("https://b.example/users/alice"))
        .await
        .unwrap();

    for (remote, is_accepted) in [(&accepted, true), (&pending, false)] {
        let follow = Follow {
            id: EntityId::new().0,
            account_id: remote.id.clone(),
            target_account_id: local.id.clone(),
            uri: Some(format!("{}/follows/1", remote.actor_uri)),
            accepted: is_accepted,
            created_at: Utc::now(),
        };
        assert!(db.insert_follow_if_absent(&follow).await.unwrap());
    }

    let inboxes = db.follower_inboxes(&local.id).await.unwrap();
    assert_eq!(inboxes, vec![accepted.inbox_uri.clone()]);
    assert!(!db.is_followed_locally(&accepted.id).await.unwrap());
}

#[tokio::test]
async fn test_relay_status_transitions() {
    let (db, _temp_dir) = create_test_db().await;
    let relay = Relay {
        id: EntityId::new().0,
        actor_uri: "https://relay.example/actor".to_string(),
        inbox_uri: "https://relay.example/inbox".to_string(),
        follow_uri: "http://localhost/actor#follows/1".to_string(),
        status: RelayStatus::Pending.as_str().to_string(),
        accepted_at: None,
        created_at: Utc::now(),
    };
    db.insert_relay(&relay).await.unwrap();
    assert!(db.active_relay_inboxes().await.unwrap().is_empty());

    db.update_relay_status(&relay.id, RelayStatus::Active, Some(Utc::now()))
        .await
        .unwrap();
    assert_eq!(
        db.active_relay_inboxes().await.unwrap(),
        vec![relay.inbox_uri.clone()]
    );

    let stored = db.get_relay_by_follow_uri(&relay.follow_uri).await.unwrap().unwrap();
    assert_eq!(stored.status(), RelayStatus::Active);
    assert!(stored.accepted_at.is_some());
}
