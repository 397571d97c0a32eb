//! Delivery worker: consumes delivery tasks and drives the notification
//! state machine through the chat transport.
//!
//! Per task:
//! 1. Load the notification. Missing, SENT and DEAD are acknowledged and discarded.
//! 2. A FAILED transport notification (a due retry) moves back to PENDING
//!    first. Any other FAILED row is parked for an operator and discarded.
//! 3. Resolve the chat id. Without one the notification is FAILED with
//!    `unknown_chat_identity`, an alert is published, and the task is acked.
//! 4. Send with a timeout. Success is SENT. A transport failure is FAILED and
//!    requeued with exponential backoff, or DEAD once `max_attempts` is reached.
//!
//! Every write is guarded by the attempt count the worker read, so when two
//! workers hold duplicate tasks only one of them settles the notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use classbell_common::broker::{
    Broker, DEAD_LETTER_TOPIC, DELIVERY_GROUP, DELIVERY_TOPIC, Delivery, publish_json,
};
use classbell_common::config::PipelineConfig;
use classbell_common::error::AppError;
use classbell_common::types::{
    DeadLetter, DeliveryTask, FailureDetail, FailureKind, Notification, NotificationState,
};
use classbell_engine::registry::RecipientRegistry;
use classbell_engine::store::EventStore;

use crate::transport::{ChatTransport, TransportError};

/// Tasks pulled from the broker per fetch.
const FETCH_BATCH: usize = 10;

/// Sleep between fetches when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Sleep after a broker error before fetching again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What happened to one delivery task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { attempts: i32 },
    Retrying { attempts: i32, delay: Duration },
    Dead { attempts: i32 },
    NoChatIdentity,
    /// Notification missing, already terminal, or taken by a concurrent worker.
    Discarded,
    Malformed,
}

impl DeliveryOutcome {
    fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Self::Retrying { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}

/// Delay before the retry that follows the `attempts`-th failed send.
///
/// `base × 2^(attempts-1)`, capped at `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.saturating_mul(2u32.pow(exponent)).min(cap)
}

pub struct DeliveryWorker {
    name: String,
    store: Arc<dyn EventStore>,
    registry: Arc<dyn RecipientRegistry>,
    broker: Arc<dyn Broker>,
    transport: Arc<dyn ChatTransport>,
    config: PipelineConfig,
}

impl DeliveryWorker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn EventStore>,
        registry: Arc<dyn RecipientRegistry>,
        broker: Arc<dyn Broker>,
        transport: Arc<dyn ChatTransport>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            broker,
            transport,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume tasks until `shutdown` flips to `true`.
    ///
    /// A task in progress is always finished before the loop exits, so a
    /// completed send is never left without its state update.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.name, "Delivery worker started");

        while !*shutdown.borrow() {
            let pause = match self.run_once().await {
                Ok(0) => IDLE_POLL,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "Failed to fetch delivery tasks");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(worker = %self.name, "Delivery worker stopped");
    }

    /// Fetch one batch and handle every task in it. Returns the batch size.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let batch = self
            .broker
            .fetch(DELIVERY_TOPIC, DELIVERY_GROUP, &self.name, FETCH_BATCH)
            .await?;

        for delivery in &batch {
            if let Err(e) = self.handle(delivery).await {
                tracing::warn!(
                    worker = %self.name,
                    entry_id = %delivery.id,
                    error = %e,
                    "Delivery task failed; requeued"
                );
            }
        }

        Ok(batch.len())
    }

    /// Process one broker entry and settle it with `ack` or `nack_and_requeue`.
    ///
    /// Store or registry errors requeue the task after the base delay; the
    /// state machine makes the second pass safe.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeliveryOutcome, AppError> {
        let task: DeliveryTask = match serde_json::from_str(&delivery.payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(
                    worker = %self.name,
                    entry_id = %delivery.id,
                    error = %e,
                    "Dropping malformed delivery task"
                );
                self.broker.ack(delivery).await?;
                return Ok(DeliveryOutcome::Malformed);
            }
        };

        match self.process(&task).await {
            Ok(outcome) => {
                match outcome.requeue_delay() {
                    Some(delay) => self.broker.nack_and_requeue(delivery, delay).await?,
                    None => self.broker.ack(delivery).await?,
                }
                Ok(outcome)
            }
            Err(e) => {
                self.broker
                    .nack_and_requeue(delivery, self.config.backoff_base_delay)
                    .await?;
                Err(e)
            }
        }
    }

    /// Run the state machine for one task. Performs no broker settlement.
    pub async fn process(&self, task: &DeliveryTask) -> Result<DeliveryOutcome, AppError> {
        let id = task.notification_id;

        let Some(mut notification) = self.store.get_notification(id).await? else {
            tracing::warn!(notification_id = %id, "Delivery task for unknown notification");
            return Ok(DeliveryOutcome::Discarded);
        };

        if notification.state.is_terminal() {
            tracing::debug!(
                notification_id = %id,
                state = %notification.state,
                "Duplicate delivery task discarded"
            );
            return Ok(DeliveryOutcome::Discarded);
        }

        if notification.state == NotificationState::Failed {
            if notification.failure_kind != Some(FailureKind::Transport) {
                tracing::debug!(
                    notification_id = %id,
                    failure_kind = ?notification.failure_kind,
                    "Parked notification waits for an operator re-drive"
                );
                return Ok(DeliveryOutcome::Discarded);
            }
            let Some(pending) = self
                .store
                .transition_if_unchanged(
                    id,
                    notification.attempt_count,
                    NotificationState::Pending,
                    0,
                    None,
                )
                .await?
            else {
                tracing::debug!(notification_id = %id, "Retry already taken");
                return Ok(DeliveryOutcome::Discarded);
            };
            notification = pending;
        }

        // The registry is authoritative; the chat id in the task may be stale.
        let Some(chat_id) = self.registry.resolve(notification.user_id).await? else {
            return self.park_without_chat(&notification).await;
        };

        let text = notification.render();
        let result =
            match tokio::time::timeout(self.config.send_timeout, self.transport.send(chat_id, &text))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.send_timeout)),
            };

        match result {
            Ok(()) => {
                let Some(sent) = self
                    .store
                    .transition_if_unchanged(
                        id,
                        notification.attempt_count,
                        NotificationState::Sent,
                        1,
                        None,
                    )
                    .await?
                else {
                    tracing::warn!(
                        notification_id = %id,
                        "Delivered, but a concurrent worker settled the notification first"
                    );
                    return Ok(DeliveryOutcome::Discarded);
                };
                tracing::info!(
                    notification_id = %id,
                    attempts = sent.attempt_count,
                    "Notification delivered"
                );
                Ok(DeliveryOutcome::Sent {
                    attempts: sent.attempt_count,
                })
            }
            Err(e) => self.record_failure(&notification, e).await,
        }
    }

    /// Count a failed send. The losing side of a race records nothing and is
    /// not requeued.
    async fn record_failure(
        &self,
        notification: &Notification,
        error: TransportError,
    ) -> Result<DeliveryOutcome, AppError> {
        let id = notification.id;
        let retry_after = error.retry_after();
        let error = AppError::from(error);
        let detail = FailureDetail::new(FailureKind::Transport, error.to_string());

        let Some(failed) = self
            .store
            .transition_if_unchanged(
                id,
                notification.attempt_count,
                NotificationState::Failed,
                1,
                Some(&detail),
            )
            .await?
        else {
            tracing::debug!(notification_id = %id, error = %error, "Failure lost a race; ignored");
            return Ok(DeliveryOutcome::Discarded);
        };

        let attempts = failed.attempt_count;
        if attempts >= self.config.max_attempts {
            let Some(dead) = self
                .store
                .transition_if_unchanged(id, attempts, NotificationState::Dead, 0, None)
                .await?
            else {
                return Ok(DeliveryOutcome::Discarded);
            };
            tracing::error!(
                notification_id = %id,
                attempts,
                error = %error,
                "Notification is dead after exhausting attempts"
            );
            self.alert(&dead, FailureKind::Transport).await;
            return Ok(DeliveryOutcome::Dead { attempts });
        }

        let backoff = backoff_delay(
            self.config.backoff_base_delay,
            self.config.backoff_max_delay,
            u32::try_from(attempts).unwrap_or(0),
        );
        let delay = retry_after.map_or(backoff, |floor| floor.max(backoff));

        tracing::warn!(
            notification_id = %id,
            attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Delivery failed; retry scheduled"
        );
        Ok(DeliveryOutcome::Retrying { attempts, delay })
    }

    async fn park_without_chat(
        &self,
        notification: &Notification,
    ) -> Result<DeliveryOutcome, AppError> {
        let reason = AppError::UnknownChatIdentity(notification.user_id);
        let detail = FailureDetail::new(FailureKind::UnknownChatIdentity, reason.to_string());
        let Some(failed) = self
            .store
            .transition_if_unchanged(
                notification.id,
                notification.attempt_count,
                NotificationState::Failed,
                0,
                Some(&detail),
            )
            .await?
        else {
            return Ok(DeliveryOutcome::Discarded);
        };

        tracing::warn!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            "Recipient has no chat identity; notification parked until fixed"
        );
        self.alert(&failed, FailureKind::UnknownChatIdentity).await;
        Ok(DeliveryOutcome::NoChatIdentity)
    }

    /// Publish a dead-letter record. Alerting is best-effort; the row is the record.
    async fn alert(&self, notification: &Notification, reason: FailureKind) {
        let letter = DeadLetter {
            notification_id: notification.id,
            user_id: notification.user_id,
            state: notification.state,
            attempts: notification.attempt_count,
            reason,
            last_error: notification.last_error.clone(),
            failed_at: Utc::now(),
        };
        if let Err(e) = publish_json(self.broker.as_ref(), DEAD_LETTER_TOPIC, &letter).await {
            tracing::warn!(notification_id = %notification.id, error = %e, "Failed to publish dead letter");
        }
    }
}
