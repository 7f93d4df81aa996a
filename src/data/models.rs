//! Data models
//!
//! Rust structs representing persisted federation state.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local accounts
// =============================================================================

/// A user hosted on this server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalAccount {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    /// RSA private key (PKCS#8 PEM)
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    /// RSA public key (SPKI PEM)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notes
// =============================================================================

/// A locally authored post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    pub account_id: String,
    /// Canonical ActivityPub URI (`<base>/notes/<id>`)
    pub uri: String,
    /// Rendered HTML
    pub content: String,
    /// Text as typed by the author
    pub source: String,
    pub in_reply_to_uri: Option<String>,
    pub like_count: i64,
    pub boost_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// `@user@domain` found in a local note
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NoteMention {
    pub id: String,
    pub note_id: String,
    pub username: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Activity log
// =============================================================================

/// Inbound or outbound activity, keyed by its ActivityPub id
///
/// Remote notes live here as `Create` rows; `object_uri` is the note URI
/// and `content` the sanitized HTML.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: String,
    pub activity_uri: String,
    pub activity_type: String,
    pub actor_uri: String,
    pub object_uri: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub content: Option<String>,
    pub raw_json: String,
    pub processed: bool,
    pub local: bool,
    pub from_relay: bool,
    pub like_count: i64,
    pub boost_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Delivery queue
// =============================================================================

/// One pending delivery of a serialized activity to one inbox
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryQueueItem {
    pub id: String,
    pub inbox_uri: String,
    pub activity_json: String,
    pub attempts: i64,
    pub next_retry_at: DateTime<Utc>,
    /// Set while a worker holds the item
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryQueueItem {
    /// Item due immediately
    pub fn new(inbox_uri: impl Into<String>, activity_json: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            inbox_uri: inbox_uri.into(),
            activity_json: activity_json.into(),
            attempts: 0,
            next_retry_at: now,
            locked_until: None,
            last_error: None,
            created_at: now,
        }
    }
}

// =============================================================================
// Remote accounts
// =============================================================================

/// Cached remote actor document
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteAccount {
    pub id: String,
    pub username: String,
    pub domain: String,
    pub actor_uri: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_uri: String,
    pub outbox_uri: Option<String>,
    pub public_key_pem: String,
    pub public_key_id: String,
    pub last_fetched_at: DateTime<Utc>,
}

impl RemoteAccount {
    /// `user@domain`
    pub fn handle(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_fetched_at < ttl
    }
}

// =============================================================================
// Social graph
// =============================================================================

/// Directed follow edge; ids point at local or remote accounts
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: String,
    pub account_id: String,
    pub target_account_id: String,
    /// ActivityPub id of the Follow activity; None for local-only follows
    pub uri: Option<String>,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

/// Like edge from an account to a note or remote activity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Like {
    pub id: String,
    pub account_id: String,
    pub object_uri: String,
    pub uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Boost edge; same shape as `Like`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Boost {
    pub id: String,
    pub account_id: String,
    pub object_uri: String,
    pub uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized counters on notes and activities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Likes,
    Boosts,
}

impl CounterKind {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Likes => "like_count",
            Self::Boosts => "boost_count",
        }
    }
}

// =============================================================================
// Relays
// =============================================================================

/// Relay subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Pending,
    Active,
    Failed,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Subscription to a relay actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relay {
    pub id: String,
    pub actor_uri: String,
    pub inbox_uri: String,
    /// Id of the Follow we sent; matched against the relay's Accept
    pub follow_uri: String,
    pub status: String,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Relay {
    pub fn status(&self) -> RelayStatus {
        RelayStatus::parse(&self.status).unwrap_or(RelayStatus::Failed)
    }
}
