//! Event store: durable raw events and notifications.
//!
//! The store is the only writable system of record. Every cross-component
//! guarantee rests on three atomic operations:
//! 1. `claim_unprocessed_events` reserves raw events with a lease so two
//!    transformers never work the same row at once
//! 2. `mark_processed_and_create_notification` flips `processed` and inserts the
//!    notification in one transaction (exactly-once transformation)
//! 3. `update_notification_state` moves a notification forward under a row lock
//!    and refuses to leave SENT or DEAD
//!
//! Every transaction is scoped to one call; a dropped, uncommitted
//! transaction rolls back.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use classbell_common::error::AppError;
use classbell_common::types::{
    BacklogSummary, FailureDetail, Notification, NotificationDraft, NotificationState, RawEvent,
    Schedule, User,
};

/// Result of an idempotent create: the notification, and whether this call inserted it.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub notification: Notification,
    pub created: bool,
}

/// Pipeline-side operations on the store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Reserve up to `limit` unprocessed events for `lease`. Empty when none are claimable.
    async fn claim_unprocessed_events(
        &self,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<RawEvent>, AppError>;

    /// Drop the lease on an event so the next claim cycle picks it up again.
    async fn release_claim(&self, event_id: Uuid) -> Result<(), AppError>;

    /// Find the user a raw event's recipient address belongs to.
    async fn find_user_by_recipient(&self, recipient: &str) -> Result<Option<User>, AppError>;

    /// Atomically mark the event processed and insert its notification.
    ///
    /// Returns the existing notification when the event was already processed.
    async fn mark_processed_and_create_notification(
        &self,
        event_id: Uuid,
        draft: &NotificationDraft,
    ) -> Result<Transformed, AppError>;

    /// Insert a notification without a source event, once per `dedupe_key`.
    async fn create_keyed_notification(
        &self,
        dedupe_key: &str,
        draft: &NotificationDraft,
    ) -> Result<Transformed, AppError>;

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    /// Move a notification to `new_state`, adding `attempt_increment` attempts.
    ///
    /// A no-op returning the current row when the move is not a forward step
    /// (in particular whenever the notification is already SENT or DEAD).
    /// A SENT transition also sets `notification_sent` on the source event.
    async fn update_notification_state(
        &self,
        id: Uuid,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<Notification, AppError>;

    /// Like [`update_notification_state`](Self::update_notification_state), but applied
    /// only while the row still carries `expected_attempts` attempts.
    ///
    /// `None` means nothing changed: another writer moved the notification
    /// first, or the move is not a forward step.
    async fn transition_if_unchanged(
        &self,
        id: Uuid,
        expected_attempts: i32,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<Option<Notification>, AppError>;

    /// PENDING notifications whose last activity is older than `older_than`.
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// FAILED transport notifications with attempts left whose retry never came back.
    async fn find_stalled_retries(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// Active timetable entries for a weekday (0 = Monday).
    async fn active_schedules_for_day(&self, day_of_week: i16) -> Result<Vec<Schedule>, AppError>;
}

/// Read-only queries used by chat commands and the operator API.
#[async_trait]
pub trait QueryStore: Send + Sync {
    async fn find_user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<User>, AppError>;

    async fn schedules_for_user(
        &self,
        user_id: Uuid,
        day_of_week: i16,
    ) -> Result<Vec<Schedule>, AppError>;

    async fn recent_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// DEAD notifications, newest first.
    async fn dead_notifications(&self, limit: i64) -> Result<Vec<Notification>, AppError>;

    async fn backlog_summary(&self) -> Result<BacklogSummary, AppError>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Row-locked transition shared by the guarded and unguarded updates.
    /// Returns the resulting row and whether this call changed it.
    async fn apply_transition(
        &self,
        id: Uuid,
        expected_attempts: Option<i32>,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<(Notification, bool), AppError> {
        let mut tx = self.pool.begin().await?;

        let current: Notification =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        let unchanged = expected_attempts.is_none_or(|n| n == current.attempt_count);
        if !unchanged || !current.state.can_transition_to(new_state) {
            tracing::debug!(
                notification_id = %id,
                current = %current.state,
                requested = %new_state,
                attempts = current.attempt_count,
                "State transition ignored"
            );
            return Ok((current, false));
        }

        let updated: Notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET state = $2,
                attempt_count = attempt_count + $3,
                last_attempt_at = CASE WHEN $3 > 0 THEN NOW() ELSE last_attempt_at END,
                failure_kind = COALESCE($4, failure_kind),
                last_error = COALESCE($5, last_error)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_state.to_string())
        .bind(attempt_increment)
        .bind(failure.map(|f| f.kind.to_string()))
        .bind(failure.map(|f| f.message.clone()))
        .fetch_one(&mut *tx)
        .await?;

        if new_state == NotificationState::Sent
            && let Some(event_id) = updated.source_event_id
        {
            sqlx::query("UPDATE raw_events SET notification_sent = true WHERE id = $1")
                .bind(event_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            notification_id = %id,
            from = %current.state,
            to = %updated.state,
            attempts = updated.attempt_count,
            "Notification state changed"
        );

        Ok((updated, true))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn claim_unprocessed_events(
        &self,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<RawEvent>, AppError> {
        // SKIP LOCKED keeps concurrent claimers from waiting on each other.
        let mut events: Vec<RawEvent> = sqlx::query_as(
            r#"
            UPDATE raw_events
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM raw_events
                WHERE processed = false
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY received_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        events.sort_by_key(|e| e.received_at);

        if !events.is_empty() {
            tracing::debug!(count = events.len(), "Claimed raw events");
        }
        Ok(events)
    }

    async fn release_claim(&self, event_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE raw_events SET claimed_until = NULL WHERE id = $1 AND processed = false")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_user_by_recipient(&self, recipient: &str) -> Result<Option<User>, AppError> {
        let user: Option<User> =
            sqlx::query_as("SELECT * FROM users WHERE lower(email) = lower($1)")
                .bind(recipient.trim())
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    async fn mark_processed_and_create_notification(
        &self,
        event_id: Uuid,
        draft: &NotificationDraft,
    ) -> Result<Transformed, AppError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes racing transformers on the same event.
        let event: RawEvent = sqlx::query_as("SELECT * FROM raw_events WHERE id = $1 FOR UPDATE")
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Raw event {} not found", event_id)))?;

        if event.processed {
            let existing: Option<Notification> =
                sqlx::query_as("SELECT * FROM notifications WHERE source_event_id = $1")
                    .bind(event_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            return match existing {
                Some(notification) => {
                    tracing::debug!(
                        event_id = %event_id,
                        notification_id = %notification.id,
                        "Event already processed, returning existing notification"
                    );
                    Ok(Transformed {
                        notification,
                        created: false,
                    })
                }
                None => Err(AppError::Internal(format!(
                    "Raw event {} is processed but has no notification",
                    event_id
                ))),
            };
        }

        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (id, user_id, notification_type, title, content, state, attempt_count, source_event_id)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.user_id)
        .bind(draft.notification_type.to_string())
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(NotificationState::Pending.to_string())
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE raw_events SET processed = true, claimed_until = NULL WHERE id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            event_id = %event_id,
            notification_id = %notification.id,
            user_id = %notification.user_id,
            notification_type = %notification.notification_type,
            "Notification created from raw event"
        );

        Ok(Transformed {
            notification,
            created: true,
        })
    }

    async fn create_keyed_notification(
        &self,
        dedupe_key: &str,
        draft: &NotificationDraft,
    ) -> Result<Transformed, AppError> {
        let inserted: Option<Notification> = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (id, user_id, notification_type, title, content, state, attempt_count, dedupe_key)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.user_id)
        .bind(draft.notification_type.to_string())
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(NotificationState::Pending.to_string())
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(notification) = inserted {
            tracing::info!(
                notification_id = %notification.id,
                dedupe_key,
                "Keyed notification created"
            );
            return Ok(Transformed {
                notification,
                created: true,
            });
        }

        let notification: Notification =
            sqlx::query_as("SELECT * FROM notifications WHERE dedupe_key = $1")
                .bind(dedupe_key)
                .fetch_one(&self.pool)
                .await?;

        Ok(Transformed {
            notification,
            created: false,
        })
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let notification: Option<Notification> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(notification)
    }

    async fn update_notification_state(
        &self,
        id: Uuid,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<Notification, AppError> {
        let (notification, _) = self
            .apply_transition(id, None, new_state, attempt_increment, failure)
            .await?;
        Ok(notification)
    }

    async fn transition_if_unchanged(
        &self,
        id: Uuid,
        expected_attempts: i32,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<Option<Notification>, AppError> {
        let (notification, applied) = self
            .apply_transition(
                id,
                Some(expected_attempts),
                new_state,
                attempt_increment,
                failure,
            )
            .await?;
        Ok(applied.then_some(notification))
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE state = 'pending'
              AND COALESCE(last_attempt_at, created_at) < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn find_stalled_retries(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE state = 'failed'
              AND failure_kind = 'transport'
              AND attempt_count < $2
              AND last_attempt_at < $1
            ORDER BY last_attempt_at
            LIMIT $3
            "#,
        )
        .bind(older_than)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn active_schedules_for_day(&self, day_of_week: i16) -> Result<Vec<Schedule>, AppError> {
        let schedules: Vec<Schedule> = sqlx::query_as(
            r#"
            SELECT * FROM schedules
            WHERE day_of_week = $1 AND is_active = true
            ORDER BY user_id, start_time
            "#,
        )
        .bind(day_of_week)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }
}

#[async_trait]
impl QueryStore for PgEventStore {
    async fn find_user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<User>, AppError> {
        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE telegram_id = $1")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn schedules_for_user(
        &self,
        user_id: Uuid,
        day_of_week: i16,
    ) -> Result<Vec<Schedule>, AppError> {
        let schedules: Vec<Schedule> = sqlx::query_as(
            r#"
            SELECT * FROM schedules
            WHERE user_id = $1 AND day_of_week = $2 AND is_active = true
            ORDER BY start_time
            "#,
        )
        .bind(user_id)
        .bind(day_of_week)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn recent_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications: Vec<Notification> = sqlx::query_as(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn dead_notifications(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        let notifications: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE state = 'dead'
            ORDER BY COALESCE(last_attempt_at, created_at) DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn backlog_summary(&self) -> Result<BacklogSummary, AppError> {
        let (unprocessed_events,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM raw_events WHERE processed = false")
                .fetch_one(&self.pool)
                .await?;

        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM notifications GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut summary = BacklogSummary {
            unprocessed_events,
            ..Default::default()
        };
        for (state, count) in counts {
            match state.as_str() {
                "pending" => summary.pending = count,
                "sent" => summary.sent = count,
                "failed" => summary.failed = count,
                "dead" => summary.dead = count,
                other => tracing::warn!(state = other, "Unknown notification state in backlog"),
            }
        }
        Ok(summary)
    }
}
