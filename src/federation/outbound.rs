//! Outbound federation pipeline
//!
//! Local actions hand an [`OutboundTask`] to the [`Publisher`]. A fixed pool
//! of workers turns each task into one delivery queue item per inbox, so a
//! user-facing request never waits on remote servers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::queue::DeliveryQueue;
use super::resolver::IdentityResolver;
use super::urls::LocalUrls;
use crate::data::{Activity, EntityId, FederationStore};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT_TOTAL, OUTBOUND_BACKLOG};

/// Who receives an outgoing activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Accepted remote followers of a local account (by account id)
    Followers(String),
    /// A single remote actor; the inbox comes from the identity resolver
    Actor(String),
    /// A known inbox URI
    Inbox(String),
    /// Inboxes of every active relay
    Relays,
}

/// One outgoing activity and its recipients
#[derive(Debug, Clone)]
pub struct OutboundTask {
    /// Short label for logs, e.g. "create_note"
    pub action: &'static str,
    pub activity: Value,
    pub audience: Vec<Audience>,
}

impl OutboundTask {
    pub fn new(action: &'static str, activity: Value, audience: Vec<Audience>) -> Self {
        Self {
            action,
            activity,
            audience,
        }
    }
}

/// Expands audiences and fills the delivery queue
pub struct OutboundProcessor {
    store: Arc<dyn FederationStore>,
    resolver: Arc<IdentityResolver>,
    queue: DeliveryQueue,
    urls: LocalUrls,
}

impl OutboundProcessor {
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

    /// Log the activity and queue it once per distinct inbox
    ///
    /// Returns the number of queue items created.
    pub async fn process(&self, task: &OutboundTask) -> Result<usize, AppError> {
        let activity_type = task
            .activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        self.log_activity(&activity_type, &task.activity).await?;

        let inboxes = self.inboxes_for(&task.audience).await?;
        let queued = self.queue.fan_out(inboxes, &task.activity).await?;

        ACTIVITIES_SENT_TOTAL
            .with_label_values(&[activity_type.as_str()])
            .inc();
        tracing::info!(
            action = task.action,
            activity_type = %activity_type,
            queued,
            "Outbound activity queued"
        );
        Ok(queued)
    }

    /// Deduplicated inbox list, in audience order
    pub async fn inboxes_for(&self, audience: &[Audience]) -> Result<Vec<String>, AppError> {
        let mut inboxes = Vec::new();

        for target in audience {
            match target {
                Audience::Followers(account_id) => {
                    inboxes.extend(self.store.follower_inboxes(account_id).await?);
                }
                Audience::Actor(actor_uri) => {
                    if self.urls.is_local(actor_uri) {
                        continue;
                    }
                    match self.resolver.resolve_actor(actor_uri).await {
                        Ok(account) => inboxes.push(account.inbox_uri),
                        Err(error) => {
                            tracing::warn!(actor = %actor_uri, %error, "Skipping unresolvable recipient");
                        }
                    }
                }
                Audience::Inbox(inbox_uri) => inboxes.push(inbox_uri.clone()),
                Audience::Relays => inboxes.extend(self.store.active_relay_inboxes().await?),
            }
        }

        let mut seen = HashSet::new();
        inboxes.retain(|inbox| seen.insert(inbox.clone()));
        Ok(inboxes)
    }

    async fn log_activity(&self, activity_type: &str, activity: &Value) -> Result<(), AppError> {
        let Some(activity_uri) = activity.get("id").and_then(Value::as_str) else {
            return Err(AppError::Validation("Outgoing activity has no id".to_string()));
        };
        let object = activity.get("object");

        let row = Activity {
            id: EntityId::new().0,
            activity_uri: activity_uri.to_string(),
            activity_type: activity_type.to_string(),
            actor_uri: activity
                .get("actor")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            object_uri: object.and_then(object_id),
            in_reply_to_uri: object
                .and_then(|object| object.get("inReplyTo"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            content: None,
            raw_json: activity.to_string(),
            processed: true,
            local: true,
            from_relay: false,
            like_count: 0,
            boost_count: 0,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.store.insert_activity_if_absent(&row).await?;
        Ok(())
    }
}

/// `id` of an embedded object, or the object itself when it is a URI
pub fn object_id(object: &Value) -> Option<String> {
    match object {
        Value::String(uri) => Some(uri.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(ToString::to_string),
        _ => None,
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<OutboundTask>>>;

/// Bounded worker pool in front of [`OutboundProcessor`]
pub struct Publisher {
    sender: Mutex<Option<mpsc::Sender<OutboundTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Publisher {
    /// Spawn `workers` tasks reading from a channel of `capacity`
    pub fn start(processor: Arc<OutboundProcessor>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let processor = processor.clone();
                tokio::spawn(async move { run_worker(worker, receiver, processor).await })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<OutboundTask>> {
        self.sender.lock().ok().and_then(|guard| guard.clone())
    }

    /// Queue a task, waiting for channel capacity
    pub async fn submit(&self, task: OutboundTask) -> Result<(), AppError> {
        let sender = self
            .sender()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Publisher is shut down")))?;

        OUTBOUND_BACKLOG.inc();
        if sender.send(task).await.is_err() {
            OUTBOUND_BACKLOG.dec();
            return Err(AppError::Internal(anyhow::anyhow!(
                "Outbound workers are gone"
            )));
        }
        Ok(())
    }

    /// Queue a task without waiting; the task is handed back when the
    /// channel is full or closed
    pub fn try_submit(&self, task: OutboundTask) -> Result<(), OutboundTask> {
        let Some(sender) = self.sender() else {
            return Err(task);
        };
        sender.try_send(task).map_err(|e| e.into_inner())?;
        OUTBOUND_BACKLOG.inc();
        Ok(())
    }

    /// Close the channel and wait until queued tasks are processed
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);

        let handles = self
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::error!(%error, "Outbound worker panicked");
            }
        }
        tracing::info!("Outbound publisher drained");
    }
}

async fn run_worker(worker: usize, receiver: SharedReceiver, processor: Arc<OutboundProcessor>) {
    loop {
        let task = { receiver.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };
        OUTBOUND_BACKLOG.dec();

        if let Err(error) = processor.process(&task).await {
            // Local state already changed; federation is best effort
            tracing::error!(worker, action = task.action, %error, "Outbound task failed");
        }
    }
    tracing::debug!(worker, "Outbound worker stopped");
}
