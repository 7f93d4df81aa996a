//! Inbound activity dispatch
//!
//! Every activity handed to [`InboxDispatcher::dispatch`] has already passed
//! signature verification. Dispatch parses it into an [`ActivityKind`],
//! checks that the signing actor may perform it, records it in the activity
//! log (which doubles as the replay guard) and only then applies effects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::content::sanitize_remote_html;
use super::delivery::builder;
use super::outbound::object_id;
use super::queue::DeliveryQueue;
use super::relay::RelayManager;
use super::resolver::IdentityResolver;
use super::urls::LocalUrls;
use crate::data::{Activity, EntityId, FederationStore, Follow, RemoteAccount};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED_TOTAL, DISPATCH_OUTCOMES_TOTAL};

/// Actor types that a `Delete`/`Update` may target
const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group", "Organization"];

/// A remote Note as carried by Create/Update
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNote {
    pub id: String,
    pub attributed_to: Option<String>,
    /// Raw remote HTML; sanitized before storage
    pub content: String,
    pub in_reply_to: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

impl RemoteNote {
    fn parse(object: &Value) -> Result<Self, AppError> {
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Note has no id".to_string()))?;

        Ok(Self {
            id: id.to_string(),
            attributed_to: object.get("attributedTo").and_then(object_id),
            content: object
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            in_reply_to: object.get("inReplyTo").and_then(object_id),
            published: object
                .get("published")
                .and_then(Value::as_str)
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc)),
        })
    }
}

/// The undone activity inside an `Undo`
#[derive(Debug, Clone, PartialEq)]
pub enum UndoTarget {
    Follow {
        id: Option<String>,
        object: Option<String>,
    },
    /// Undo of anything else, e.g. Like or Announce
    Other(String),
}

/// Every inbound activity shape the dispatcher understands
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    Follow { object: String },
    Accept {
        follow_id: Option<String>,
        follow_actor: Option<String>,
        follow_object: Option<String>,
    },
    Undo(UndoTarget),
    CreateNote(RemoteNote),
    UpdateNote(RemoteNote),
    UpdateActor { id: String },
    DeleteObject { id: String },
    DeleteActor { id: String },
    Like { object: String },
    /// Known envelope with an unsupported object, or an unknown type
    Unsupported(String),
}

impl ActivityKind {
    /// Parse the activity envelope and the parts of its object we need
    ///
    /// # Errors
    /// `Validation` when a required field is missing.
    pub fn parse(activity: &Value) -> Result<Self, AppError> {
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;
        let object = activity.get("object");
        let object_type = object
            .and_then(|object| object.get("type"))
            .and_then(Value::as_str);
        let require_object = || {
            object.and_then(object_id).ok_or_else(|| {
                AppError::Validation(format!("{} activity has no object", activity_type))
            })
        };

        let kind = match activity_type {
            "Follow" => Self::Follow {
                object: require_object()?,
            },
            "Accept" => Self::Accept {
                follow_id: object.and_then(object_id),
                follow_actor: object
                    .and_then(|object| object.get("actor"))
                    .and_then(object_id),
                follow_object: object
                    .and_then(|object| object.get("object"))
                    .and_then(object_id),
            },
            "Undo" => {
                let object = object.ok_or_else(|| {
                    AppError::Validation("Undo activity has no object".to_string())
                })?;
                match object_type {
                    Some("Follow") => Self::Undo(UndoTarget::Follow {
                        id: object.get("id").and_then(Value::as_str).map(ToString::to_string),
                        object: object.get("object").and_then(object_id),
                    }),
                    Some(other) => Self::Undo(UndoTarget::Other(other.to_string())),
                    // Bare URI; only Follow ids can be matched
                    None => Self::Undo(UndoTarget::Follow {
                        id: object_id(object),
                        object: None,
                    }),
                }
            }
            "Create" => match (object_type, object) {
                (Some("Note"), Some(object)) => Self::CreateNote(RemoteNote::parse(object)?),
                (other, _) => Self::Unsupported(format!("Create({})", other.unwrap_or("?"))),
            },
            "Update" => match (object_type, object) {
                (Some("Note"), Some(object)) => Self::UpdateNote(RemoteNote::parse(object)?),
                (Some(kind), Some(_)) if ACTOR_TYPES.contains(&kind) => Self::UpdateActor {
                    id: require_object()?,
                },
                (other, _) => Self::Unsupported(format!("Update({})", other.unwrap_or("?"))),
            },
            "Delete" => {
                let id = require_object()?;
                let actor = activity.get("actor").and_then(object_id);
                let is_actor = object_type.is_some_and(|kind| ACTOR_TYPES.contains(&kind))
                    || actor.as_deref() == Some(id.as_str());
                if is_actor {
                    Self::DeleteActor { id }
                } else {
                    Self::DeleteObject { id }
                }
            }
            "Like" => Self::Like {
                object: require_object()?,
            },
            other => Self::Unsupported(other.to_string()),
        };

        Ok(kind)
    }

    /// Label used in metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Follow { .. } => "Follow",
            Self::Accept { .. } => "Accept",
            Self::Undo(_) => "Undo",
            Self::CreateNote(_) => "Create",
            Self::UpdateNote(_) | Self::UpdateActor { .. } => "Update",
            Self::DeleteObject { .. } | Self::DeleteActor { .. } => "Delete",
            Self::Like { .. } => "Like",
            Self::Unsupported(_) => "Other",
        }
    }

    /// Object URI recorded on the activity log row
    fn object_uri(&self) -> Option<String> {
        match self {
            Self::Follow { object } | Self::Like { object } => Some(object.clone()),
            Self::Accept { follow_id, .. } => follow_id.clone(),
            Self::Undo(UndoTarget::Follow { id, .. }) => id.clone(),
            Self::CreateNote(note) | Self::UpdateNote(note) => Some(note.id.clone()),
            Self::UpdateActor { id } | Self::DeleteObject { id } | Self::DeleteActor { id } => {
                Some(id.clone())
            }
            Self::Undo(UndoTarget::Other(_)) | Self::Unsupported(_) => None,
        }
    }
}

/// Result of a successful dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Effects applied
    Processed,
    /// Accepted with nothing to do
    Acknowledged,
    /// Same activity id seen before; no effects
    Duplicate,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Acknowledged => "acknowledged",
            Self::Duplicate => "duplicate",
        }
    }
}

/// What a handler decided before anything is written
enum Plan {
    /// Record the activity, then run the effect
    Apply(Effect),
    /// Nothing to store or change
    Acknowledge,
}

enum Effect {
    FollowUser { local_account_id: String, target_uri: String },
    FollowInstance,
    AcceptFollow { follow_id: String },
    AcceptRelay { relay_id: String },
    DeleteFollow { follow_id: String },
    StoreNote,
    UpdateNote(RemoteNote),
    RefreshActor,
    DeleteObject { id: String },
    DeleteActor,
    RecordOnly,
}

pub struct InboxDispatcher {
    store: Arc<dyn FederationStore>,
    resolver: Arc<IdentityResolver>,
    queue: DeliveryQueue,
    relays: Arc<RelayManager>,
    urls: LocalUrls,
}

impl InboxDispatcher {
    pub fn new(
        store: Arc<dyn FederationStore>,
        resolver: Arc<IdentityResolver>,
        queue: DeliveryQueue,
        relays: Arc<RelayManager>,
        urls: LocalUrls,
    ) -> Self {
        Self {
            store,
            resolver,
            queue,
            relays,
            urls,
        }
    }

    /// Handle one verified activity signed by `signer`
    ///
    /// # Errors
    /// `AuthorizationDenied` when the signer may not perform the activity,
    /// `Validation` for malformed payloads. No state changes in either case.
    pub async fn dispatch(
        &self,
        activity: &Value,
        signer: &RemoteAccount,
    ) -> Result<DispatchOutcome, AppError> {
        let result = self.dispatch_inner(activity, signer).await;

        let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or("");
        match &result {
            Ok(outcome) => {
                DISPATCH_OUTCOMES_TOTAL
                    .with_label_values(&[outcome.as_str()])
                    .inc();
                tracing::info!(
                    activity_id,
                    actor = %signer.actor_uri,
                    outcome = outcome.as_str(),
                    "Inbound activity"
                );
            }
            Err(error) => {
                DISPATCH_OUTCOMES_TOTAL.with_label_values(&["rejected"]).inc();
                tracing::warn!(
                    activity_id,
                    actor = %signer.actor_uri,
                    outcome = "rejected",
                    %error,
                    "Inbound activity"
                );
            }
        }
        result
    }

    async fn dispatch_inner(
        &self,
        activity: &Value,
        signer: &RemoteAccount,
    ) -> Result<DispatchOutcome, AppError> {
        let activity_uri = activity
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Activity has no id".to_string()))?;

        let actor = activity
            .get("actor")
            .and_then(object_id)
            .ok_or_else(|| AppError::Validation("Activity has no actor".to_string()))?;
        if actor != signer.actor_uri {
            return Err(AppError::AuthorizationDenied(format!(
                "{} signed an activity for {}",
                signer.actor_uri, actor
            )));
        }
        if self.urls.is_local(activity_uri) {
            return Err(AppError::AuthorizationDenied(format!(
                "Remote actor used a local activity id {}",
                activity_uri
            )));
        }

        let kind = ActivityKind::parse(activity)?;
        ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[kind.label()])
            .inc();

        if self.store.get_activity_by_uri(activity_uri).await?.is_some() {
            return Ok(DispatchOutcome::Duplicate);
        }

        let effect = match self.plan(&kind, signer).await? {
            Plan::Apply(effect) => effect,
            Plan::Acknowledge => return Ok(DispatchOutcome::Acknowledged),
        };

        let from_relay = self
            .store
            .get_relay_by_actor_uri(&signer.actor_uri)
            .await?
            .is_some();
        let row = self.log_row(activity_uri, activity, &kind, signer, from_relay);
        if !self.store.insert_activity_if_absent(&row).await? {
            // Lost the race against a concurrent re-delivery
            return Ok(DispatchOutcome::Duplicate);
        }

        let outcome = match self.apply(effect, activity, signer).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // The sender retries on error; the log row must not turn that into a duplicate
                if let Err(cleanup) = self.store.delete_unprocessed_activity(activity_uri).await {
                    tracing::warn!(
                        activity = %activity_uri,
                        error = %cleanup,
                        "Failed to release activity after error"
                    );
                }
                return Err(err);
            }
        };
        self.store.mark_activity_processed(activity_uri).await?;
        Ok(outcome)
    }

    /// Authorization and preconditions; reads only
    async fn plan(&self, kind: &ActivityKind, signer: &RemoteAccount) -> Result<Plan, AppError> {
        match kind {
            ActivityKind::Follow { object } => {
                if *object == self.urls.instance_actor() {
                    return Ok(Plan::Apply(Effect::FollowInstance));
                }
                let account = match self.urls.username_from_actor(object) {
                    Some(username) => self.store.get_local_account_by_username(username).await?,
                    None => None,
                };
                let Some(account) = account else {
                    return Err(AppError::Validation(format!(
                        "Follow target is not a local actor: {}",
                        object
                    )));
                };
                Ok(Plan::Apply(Effect::FollowUser {
                    local_account_id: account.id,
                    target_uri: object.clone(),
                }))
            }

            ActivityKind::Accept {
                follow_id,
                follow_actor,
                follow_object,
            } => {
                self.plan_accept(
                    follow_id.as_deref(),
                    follow_actor.as_deref(),
                    follow_object.as_deref(),
                    signer,
                )
                .await
            }

            ActivityKind::Undo(UndoTarget::Follow { id, object }) => {
                self.plan_undo_follow(id.as_deref(), object.as_deref(), signer)
                    .await
            }
            ActivityKind::Undo(UndoTarget::Other(_)) => Ok(Plan::Acknowledge),

            ActivityKind::CreateNote(note) => {
                self.authorize_note_author(note, signer)?;
                if self.urls.is_local(&note.id) {
                    return Err(AppError::AuthorizationDenied(format!(
                        "Remote actor created local object {}",
                        note.id
                    )));
                }
                if self.store.get_activity_by_object_uri(&note.id).await?.is_some() {
                    return Ok(Plan::Acknowledge);
                }

                let followed = self.store.is_followed_locally(&signer.id).await?;
                let replies_to_local = match &note.in_reply_to {
                    Some(parent) => self.store.get_note_by_uri(parent).await?.is_some(),
                    None => false,
                };
                if followed || replies_to_local {
                    Ok(Plan::Apply(Effect::StoreNote))
                } else {
                    Ok(Plan::Acknowledge)
                }
            }

            ActivityKind::UpdateNote(note) => {
                self.authorize_note_author(note, signer)?;
                match self.store.get_activity_by_object_uri(&note.id).await? {
                    Some(stored) if stored.actor_uri != signer.actor_uri => {
                        Err(AppError::AuthorizationDenied(format!(
                            "{} does not own {}",
                            signer.actor_uri, note.id
                        )))
                    }
                    Some(_) => Ok(Plan::Apply(Effect::UpdateNote(note.clone()))),
                    None => Ok(Plan::Acknowledge),
                }
            }

            ActivityKind::UpdateActor { id } => {
                if *id != signer.actor_uri {
                    return Err(AppError::AuthorizationDenied(format!(
                        "{} cannot update actor {}",
                        signer.actor_uri, id
                    )));
                }
                Ok(Plan::Apply(Effect::RefreshActor))
            }

            ActivityKind::DeleteObject { id } => {
                if self.urls.is_local(id) {
                    return Err(AppError::AuthorizationDenied(format!(
                        "Remote actor cannot delete local object {}",
                        id
                    )));
                }
                match self.store.get_activity_by_object_uri(id).await? {
                    Some(stored) if stored.actor_uri != signer.actor_uri => {
                        Err(AppError::AuthorizationDenied(format!(
                            "{} does not own {}",
                            signer.actor_uri, id
                        )))
                    }
                    Some(_) => Ok(Plan::Apply(Effect::DeleteObject { id: id.clone() })),
                    None => Ok(Plan::Acknowledge),
                }
            }

            ActivityKind::DeleteActor { id } => {
                if *id != signer.actor_uri {
                    return Err(AppError::AuthorizationDenied(format!(
                        "{} cannot delete actor {}",
                        signer.actor_uri, id
                    )));
                }
                Ok(Plan::Apply(Effect::DeleteActor))
            }

            ActivityKind::Like { object } => {
                let known = self.store.get_note_by_uri(object).await?.is_some()
                    || self.store.get_activity_by_object_uri(object).await?.is_some();
                if known {
                    Ok(Plan::Apply(Effect::RecordOnly))
                } else {
                    Ok(Plan::Acknowledge)
                }
            }

            ActivityKind::Unsupported(kind) => {
                tracing::debug!(kind = %kind, "Ignoring unsupported activity");
                Ok(Plan::Acknowledge)
            }
        }
    }

    fn authorize_note_author(&self, note: &RemoteNote, signer: &RemoteAccount) -> Result<(), AppError> {
        match &note.attributed_to {
            Some(author) if *author != signer.actor_uri => Err(AppError::AuthorizationDenied(
                format!("{} is not the author of {}", signer.actor_uri, note.id),
            )),
            _ => Ok(()),
        }
    }

    async fn plan_accept(
        &self,
        follow_id: Option<&str>,
        follow_actor: Option<&str>,
        follow_object: Option<&str>,
        signer: &RemoteAccount,
    ) -> Result<Plan, AppError> {
        if let Some(follow_id) = follow_id {
            if let Some(relay) = self.relays.find_by_follow_uri(follow_id).await? {
                if relay.actor_uri != signer.actor_uri {
                    return Err(AppError::AuthorizationDenied(format!(
                        "{} cannot accept the follow of relay {}",
                        signer.actor_uri, relay.actor_uri
                    )));
                }
                return Ok(Plan::Apply(Effect::AcceptRelay { relay_id: relay.id }));
            }

            if let Some(follow) = self.store.get_follow_by_uri(follow_id).await? {
                if follow.target_account_id != signer.id {
                    return Err(AppError::AuthorizationDenied(format!(
                        "{} cannot accept a follow addressed to someone else",
                        signer.actor_uri
                    )));
                }
                return Ok(self.accept_plan(follow));
            }
        }

        // Some servers answer with an Accept whose object lost its id; match
        // on both ends of the follow instead
        if follow_object != Some(signer.actor_uri.as_str()) {
            return Ok(Plan::Acknowledge);
        }
        let local = match follow_actor.and_then(|actor| self.urls.username_from_actor(actor)) {
            Some(username) => self.store.get_local_account_by_username(username).await?,
            None => None,
        };
        let Some(local) = local else {
            return Ok(Plan::Acknowledge);
        };
        for follow in self.store.list_followers(&signer.id).await? {
            if follow.account_id == local.id && follow.uri.is_some() && !follow.accepted {
                return Ok(self.accept_plan(follow));
            }
        }

        Ok(Plan::Acknowledge)
    }

    fn accept_plan(&self, follow: Follow) -> Plan {
        if follow.accepted {
            Plan::Acknowledge
        } else {
            Plan::Apply(Effect::AcceptFollow {
                follow_id: follow.id,
            })
        }
    }

    async fn plan_undo_follow(
        &self,
        id: Option<&str>,
        object: Option<&str>,
        signer: &RemoteAccount,
    ) -> Result<Plan, AppError> {
        let follow = match (id, object) {
            (Some(id), _) => self.store.get_follow_by_uri(id).await?,
            (None, Some(object)) => {
                let local = match self.urls.username_from_actor(object) {
                    Some(username) => self.store.get_local_account_by_username(username).await?,
                    None => None,
                };
                match local {
                    Some(local) => self.store.get_follow(&signer.id, &local.id).await?,
                    None => None,
                }
            }
            (None, None) => None,
        };

        let Some(follow) = follow else {
            return Ok(Plan::Acknowledge);
        };
        if follow.account_id != signer.id {
            return Err(AppError::AuthorizationDenied(format!(
                "{} did not send follow {}",
                signer.actor_uri,
                follow.uri.as_deref().unwrap_or(&follow.id)
            )));
        }
        Ok(Plan::Apply(Effect::DeleteFollow {
            follow_id: follow.id,
        }))
    }

    fn log_row(
        &self,
        activity_uri: &str,
        activity: &Value,
        kind: &ActivityKind,
        signer: &RemoteAccount,
        from_relay: bool,
    ) -> Activity {
        let now = Utc::now();
        let (content, in_reply_to_uri, created_at) = match kind {
            ActivityKind::CreateNote(note) => (
                Some(sanitize_remote_html(&note.content)),
                note.in_reply_to.clone(),
                note.published.filter(|published| *published <= now).unwrap_or(now),
            ),
            _ => (None, None, now),
        };

        Activity {
            id: EntityId::new().0,
            activity_uri: activity_uri.to_string(),
            activity_type: activity
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(kind.label())
                .to_string(),
            actor_uri: signer.actor_uri.clone(),
            object_uri: kind.object_uri(),
            in_reply_to_uri,
            content,
            raw_json: activity.to_string(),
            processed: false,
            local: false,
            from_relay,
            like_count: 0,
            boost_count: 0,
            created_at,
            updated_at: None,
        }
    }

    async fn apply(
        &self,
        effect: Effect,
        activity: &Value,
        signer: &RemoteAccount,
    ) -> Result<DispatchOutcome, AppError> {
        match effect {
            Effect::FollowUser {
                local_account_id,
                target_uri,
            } => {
                let follow = Follow {
                    id: EntityId::new().0,
                    account_id: signer.id.clone(),
                    target_account_id: local_account_id,
                    uri: activity.get("id").and_then(Value::as_str).map(ToString::to_string),
                    accepted: true,
                    created_at: Utc::now(),
                };
                if !self.store.insert_follow_if_absent(&follow).await? {
                    tracing::debug!(follower = %signer.actor_uri, "Follow edge already present");
                }
                self.send_accept(&target_uri, activity, signer).await?;
            }
            Effect::FollowInstance => {
                self.send_accept(&self.urls.instance_actor(), activity, signer)
                    .await?;
            }
            Effect::AcceptFollow { follow_id } => {
                self.store.accept_follow(&follow_id).await?;
                tracing::info!(followee = %signer.actor_uri, "Follow accepted");
            }
            Effect::AcceptRelay { relay_id } => {
                if let Some(relay) = self.store.get_relay(&relay_id).await? {
                    self.relays.activate(&relay).await?;
                }
            }
            Effect::DeleteFollow { follow_id } => {
                self.store.delete_follow(&follow_id).await?;
                tracing::info!(follower = %signer.actor_uri, "Follow undone");
            }
            Effect::StoreNote => {}
            Effect::UpdateNote(note) => {
                let object = activity.get("object").cloned().unwrap_or(Value::Null);
                self.store
                    .update_activity_object(
                        &note.id,
                        Some(&sanitize_remote_html(&note.content)),
                        &object.to_string(),
                        Utc::now(),
                    )
                    .await?;
            }
            Effect::RefreshActor => {
                self.resolver.refresh_actor(&signer.actor_uri).await?;
            }
            Effect::DeleteObject { id } => {
                let removed = self.store.delete_activities_by_object_uri(&id).await?;
                tracing::info!(object = %id, removed, "Remote object deleted");
            }
            Effect::DeleteActor => {
                let follows = self.store.delete_follows_for_account(&signer.id).await?;
                self.resolver.forget_actor(&signer.actor_uri).await?;
                tracing::info!(actor = %signer.actor_uri, follows, "Remote actor deleted");
            }
            Effect::RecordOnly => return Ok(DispatchOutcome::Acknowledged),
        }
        Ok(DispatchOutcome::Processed)
    }

    async fn send_accept(
        &self,
        local_actor: &str,
        follow: &Value,
        signer: &RemoteAccount,
    ) -> Result<(), AppError> {
        let mut follow = follow.clone();
        if let Some(object) = follow.as_object_mut() {
            object.remove("@context");
        }
        let accept = builder::accept(&self.urls.new_activity(), local_actor, follow);
        self.queue.enqueue(&signer.inbox_uri, &accept).await
    }
}
