//! Dispatcher: publishes delivery tasks for PENDING notifications.
//!
//! Publishing is fire-and-forget: a failed publish leaves the notification
//! PENDING and the periodic sweep re-publishes it once it is older than
//! `stale_pending_threshold`. The sweep also picks up FAILED transport
//! retries whose delayed task never came back from the broker.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use classbell_common::broker::{Broker, DELIVERY_TOPIC, publish_json};
use classbell_common::config::PipelineConfig;
use classbell_common::error::AppError;
use classbell_common::types::{DeliveryTask, Notification, NotificationState};

use crate::registry::RecipientRegistry;
use crate::store::EventStore;

/// Notifications re-published per sweep.
const SWEEP_BATCH: i64 = 500;

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_pending: usize,
    pub stalled_retries: usize,
    pub published: usize,
}

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    registry: Arc<dyn RecipientRegistry>,
    broker: Arc<dyn Broker>,
    config: PipelineConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<dyn RecipientRegistry>,
        broker: Arc<dyn Broker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            config,
        }
    }

    /// Publish a delivery task for `notification`. Returns whether the publish succeeded.
    ///
    /// Never fails the caller: a notification that could not be published stays
    /// PENDING and is recovered by [`sweep`](Self::sweep).
    pub async fn dispatch(&self, notification: &Notification) -> bool {
        let chat_id = match self.registry.resolve(notification.user_id).await {
            Ok(chat_id) => chat_id,
            Err(e) => {
                tracing::debug!(
                    notification_id = %notification.id,
                    error = %e,
                    "Chat id lookup failed at publish time; worker will resolve"
                );
                None
            }
        };

        let task = DeliveryTask {
            notification_id: notification.id,
            chat_id,
        };

        match publish_json(self.broker.as_ref(), DELIVERY_TOPIC, &task).await {
            Ok(()) => {
                tracing::debug!(notification_id = %notification.id, "Delivery task published");
                true
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to publish delivery task; left for sweep"
                );
                false
            }
        }
    }

    /// Dispatch each notification; returns how many were published.
    pub async fn dispatch_all(&self, notifications: &[Notification]) -> usize {
        let mut published = 0;
        for notification in notifications {
            if self.dispatch(notification).await {
                published += 1;
            }
        }
        published
    }

    /// Re-publish tasks for notifications the broker appears to have lost.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.config.stale_pending_threshold)
            .map_err(|e| AppError::Config(format!("Invalid stale threshold: {}", e)))?;
        // A FAILED retry may legitimately sit in the delayed queue for up to the backoff cap.
        let retry_grace = chrono::Duration::from_std(self.config.backoff_max_delay)
            .map_err(|e| AppError::Config(format!("Invalid backoff cap: {}", e)))?;

        let stale = self
            .store
            .find_stale_pending(now - threshold, SWEEP_BATCH)
            .await?;
        let stalled = self
            .store
            .find_stalled_retries(
                now - threshold - retry_grace,
                self.config.max_attempts,
                SWEEP_BATCH,
            )
            .await?;

        let mut report = SweepReport {
            stale_pending: stale.len(),
            stalled_retries: stalled.len(),
            published: 0,
        };
        report.published += self.dispatch_all(&stale).await;
        report.published += self.dispatch_all(&stalled).await;

        if report.stale_pending + report.stalled_retries > 0 {
            tracing::info!(
                stale_pending = report.stale_pending,
                stalled_retries = report.stalled_retries,
                published = report.published,
                "Sweep re-published delivery tasks"
            );
        }

        Ok(report)
    }

    /// Move a FAILED notification back to PENDING and publish it again.
    ///
    /// Used after an operator fixes the recipient's chat mapping. DEAD and SENT
    /// notifications are terminal and are rejected.
    pub async fn retry_failed(&self, notification_id: Uuid) -> Result<Notification, AppError> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Notification {} not found", notification_id))
            })?;

        if notification.state != NotificationState::Failed {
            return Err(AppError::Validation(format!(
                "Notification {} is {}, only failed notifications can be retried",
                notification_id, notification.state
            )));
        }

        let updated = self
            .store
            .update_notification_state(notification_id, NotificationState::Pending, 0, None)
            .await?;

        if updated.state != NotificationState::Pending {
            return Err(AppError::StoreConflict(format!(
                "Notification {} moved to {} concurrently",
                notification_id, updated.state
            )));
        }

        tracing::info!(notification_id = %notification_id, "Failed notification re-driven");
        self.dispatch(&updated).await;
        Ok(updated)
    }
}
