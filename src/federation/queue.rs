//! Durable outbound delivery queue
//!
//! One row per `(inbox, activity)`. The worker claims due rows under a
//! lease, POSTs them, deletes them on 2xx and reschedules them with
//! exponential backoff otherwise. Rows are never dropped on failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;

use super::delivery::ActivityDelivery;
use super::keys::KeyRing;
use super::relay::RelayManager;
use crate::data::{DeliveryQueueItem, FederationStore};
use crate::error::AppError;
use crate::metrics::QUEUE_DEPTH;

/// First retry delay
pub const BASE_BACKOFF_SECS: i64 = 10;
/// Retry delay ceiling (24 hours)
pub const MAX_BACKOFF_SECS: i64 = 86_400;

/// Delay before the next attempt after a failure
///
/// `attempts` is the number of failures recorded before this one, so the
/// first retry waits 10 seconds and the delay doubles up to 24 hours.
pub fn backoff_delay(attempts: i64) -> chrono::Duration {
    let exponent = attempts.clamp(0, 32) as u32;
    let secs = BASE_BACKOFF_SECS
        .saturating_mul(2i64.saturating_pow(exponent))
        .min(MAX_BACKOFF_SECS);
    chrono::Duration::seconds(secs)
}

/// Producer side of the queue
#[derive(Clone)]
pub struct DeliveryQueue {
    store: Arc<dyn FederationStore>,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn FederationStore>) -> Self {
        Self { store }
    }

    /// Queue one delivery, due immediately
    pub async fn enqueue(
        &self,
        inbox_uri: &str,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        self.fan_out([inbox_uri.to_string()], activity).await?;
        Ok(())
    }

    /// Queue one item per distinct inbox; returns the number queued
    pub async fn fan_out<I>(
        &self,
        inbox_uris: I,
        activity: &serde_json::Value,
    ) -> Result<usize, AppError>
    where
        I: IntoIterator<Item = String>,
    {
        let body = serde_json::to_string(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let mut seen = HashSet::new();
        let items: Vec<DeliveryQueueItem> = inbox_uris
            .into_iter()
            .filter(|inbox| !inbox.is_empty() && seen.insert(inbox.clone()))
            .map(|inbox| DeliveryQueueItem::new(inbox, body.clone()))
            .collect();

        if items.is_empty() {
            return Ok(0);
        }

        self.store.enqueue_deliveries(&items).await?;
        QUEUE_DEPTH.add(items.len() as i64);
        tracing::debug!(
            count = items.len(),
            activity_id = activity.get("id").and_then(|v| v.as_str()).unwrap_or(""),
            "Queued deliveries"
        );
        Ok(items.len())
    }

    pub async fn depth(&self) -> Result<i64, AppError> {
        self.store.count_deliveries().await
    }
}

/// Summary of one worker tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Queue worker settings
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub batch_size: u32,
    pub lease: chrono::Duration,
    pub concurrency: usize,
}

/// Consumer side of the queue
pub struct QueueWorker {
    store: Arc<dyn FederationStore>,
    delivery: ActivityDelivery,
    keys: Arc<KeyRing>,
    relays: Arc<RelayManager>,
    settings: QueueSettings,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn FederationStore>,
        delivery: ActivityDelivery,
        keys: Arc<KeyRing>,
        relays: Arc<RelayManager>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            delivery,
            keys,
            relays,
            settings,
        }
    }

    /// Deliver every item due at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let items = self
            .store
            .claim_due_deliveries(now, self.settings.batch_size, self.settings.lease)
            .await?;

        let mut report = TickReport {
            claimed: items.len(),
            ..TickReport::default()
        };

        if !items.is_empty() {
            let outcomes: Vec<bool> = futures::stream::iter(items)
                .map(|item| async move { self.process(item, now).await })
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

            report.delivered = outcomes.iter().filter(|delivered| **delivered).count();
            report.failed = outcomes.len() - report.delivered;
        }

        QUEUE_DEPTH.set(self.store.count_deliveries().await?);

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                "Delivery queue tick"
            );
        }
        Ok(report)
    }

    /// Returns true when the item was delivered and removed
    async fn process(&self, item: DeliveryQueueItem, now: DateTime<Utc>) -> bool {
        match self.attempt(&item).await {
            Ok(()) => {
                if let Err(error) = self.store.complete_delivery(&item.id).await {
                    // Delivered but still queued; the lease expiry will resend it
                    tracing::error!(id = %item.id, %error, "Failed to remove delivered item");
                }
                true
            }
            Err(error) => {
                let attempts = item.attempts + 1;
                let next_retry_at = now + backoff_delay(item.attempts);
                tracing::warn!(
                    inbox = %item.inbox_uri,
                    attempts,
                    next_retry_at = %next_retry_at,
                    %error,
                    "Delivery failed; rescheduled"
                );

                if let Err(store_error) = self
                    .store
                    .reschedule_delivery(&item.id, attempts, next_retry_at, &error.to_string())
                    .await
                {
                    tracing::error!(id = %item.id, error = %store_error, "Failed to reschedule delivery");
                }

                if let Err(relay_error) = self.relays.mark_failed_by_inbox(&item.inbox_uri).await {
                    tracing::error!(inbox = %item.inbox_uri, error = %relay_error, "Failed to update relay status");
                }
                false
            }
        }
    }

    async fn attempt(&self, item: &DeliveryQueueItem) -> Result<(), AppError> {
        let activity: serde_json::Value = serde_json::from_str(&item.activity_json)
            .map_err(|e| AppError::Validation(format!("Queued activity is not JSON: {}", e)))?;
        let actor = activity
            .get("actor")
            .and_then(|value| value.as_str())
            .ok_or_else(|| AppError::Validation("Queued activity has no actor".to_string()))?;

        let signer = self.keys.signer_for_actor(actor).await?;
        self.delivery
            .deliver(&item.inbox_uri, item.activity_json.as_bytes(), &signer)
            .await
    }
}

/// Run `tick` forever on a fixed interval
pub fn spawn_queue_worker(worker: Arc<QueueWorker>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(error) = worker.tick(Utc::now()).await {
                tracing::error!(%error, "Delivery queue tick failed");
            }
        }
    })
}
