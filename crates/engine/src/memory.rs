//! In-process store with the same guarantees as [`PgEventStore`](crate::store::PgEventStore).
//!
//! A single mutex stands in for row locks: every trait method runs as one
//! critical section, which is exactly the atomicity the Postgres transactions
//! provide. Used by tests across the workspace and for local dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use classbell_common::error::AppError;
use classbell_common::types::{
    BacklogSummary, FailureDetail, FailureKind, Notification, NotificationDraft,
    NotificationState, RawEvent, Schedule, User,
};

use crate::registry::RecipientRegistry;
use crate::store::{EventStore, QueryStore, Transformed};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    schedules: Vec<Schedule>,
    events: HashMap<Uuid, RawEvent>,
    notifications: HashMap<Uuid, Notification>,
    /// Every applied transition, in order: (notification id, new state).
    transitions: Vec<(Uuid, NotificationState)>,
    /// Keyed inserts left to fail before the store recovers.
    failing_keyed_inserts: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, user: User) {
        self.lock().users.insert(user.id, user);
    }

    pub fn add_schedule(&self, schedule: Schedule) {
        self.lock().schedules.push(schedule);
    }

    /// Insert a raw event the way the ingester would.
    pub fn insert_event(&self, event: RawEvent) {
        self.lock().events.insert(event.id, event);
    }

    pub fn event(&self, id: Uuid) -> Option<RawEvent> {
        self.lock().events.get(&id).cloned()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.lock().notifications.values().cloned().collect();
        all.sort_by_key(|n| n.created_at);
        all
    }

    /// Make the next `times` keyed inserts fail, simulating a database outage.
    pub fn fail_keyed_inserts(&self, times: usize) {
        self.lock().failing_keyed_inserts = times;
    }

    /// States a notification has moved through after creation, in order.
    pub fn state_history(&self, id: Uuid) -> Vec<NotificationState> {
        self.lock()
            .transitions
            .iter()
            .filter(|(nid, _)| *nid == id)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Change a user's chat identity, as the onboarding flow would.
    pub fn set_telegram_id(&self, user_id: Uuid, telegram_id: Option<i64>) {
        if let Some(user) = self.lock().users.get_mut(&user_id) {
            user.telegram_id = telegram_id;
        }
    }

    fn apply_transition(
        &self,
        id: Uuid,
        expected_attempts: Option<i32>,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<(Notification, bool), AppError> {
        let mut inner = self.lock();

        let notification = inner
            .notifications
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        let unchanged = expected_attempts.is_none_or(|n| n == notification.attempt_count);
        if !unchanged || !notification.state.can_transition_to(new_state) {
            return Ok((notification.clone(), false));
        }

        notification.state = new_state;
        notification.attempt_count += attempt_increment;
        if attempt_increment > 0 {
            notification.last_attempt_at = Some(Utc::now());
        }
        if let Some(failure) = failure {
            notification.failure_kind = Some(failure.kind);
            notification.last_error = Some(failure.message.clone());
        }
        let updated = notification.clone();

        if new_state == NotificationState::Sent
            && let Some(event_id) = updated.source_event_id
            && let Some(event) = inner.events.get_mut(&event_id)
        {
            event.notification_sent = true;
        }

        inner.transitions.push((id, new_state));
        Ok((updated, true))
    }

    fn new_notification(draft: &NotificationDraft) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            notification_type: draft.notification_type,
            title: draft.title.clone(),
            content: draft.content.clone(),
            state: NotificationState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            created_at: Utc::now(),
            source_event_id: None,
            dedupe_key: None,
            failure_kind: None,
            last_error: None,
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn claim_unprocessed_events(
        &self,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<RawEvent>, AppError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| AppError::Validation(format!("Invalid lease: {}", e)))?;
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut inner = self.lock();
        let mut claimable: Vec<&mut RawEvent> = inner
            .events
            .values_mut()
            .filter(|e| !e.processed && e.claimed_until.is_none_or(|until| until < now))
            .collect();
        claimable.sort_by_key(|e| e.received_at);

        Ok(claimable
            .into_iter()
            .take(limit)
            .map(|e| {
                e.claimed_until = Some(now + lease);
                e.clone()
            })
            .collect())
    }

    async fn release_claim(&self, event_id: Uuid) -> Result<(), AppError> {
        if let Some(event) = self.lock().events.get_mut(&event_id)
            && !event.processed
        {
            event.claimed_until = None;
        }
        Ok(())
    }

    async fn find_user_by_recipient(&self, recipient: &str) -> Result<Option<User>, AppError> {
        let wanted = recipient.trim().to_lowercase();
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.email.as_deref().map(str::to_lowercase).as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    async fn mark_processed_and_create_notification(
        &self,
        event_id: Uuid,
        draft: &NotificationDraft,
    ) -> Result<Transformed, AppError> {
        let mut inner = self.lock();

        let processed = inner
            .events
            .get(&event_id)
            .map(|e| e.processed)
            .ok_or_else(|| AppError::NotFound(format!("Raw event {} not found", event_id)))?;

        if processed {
            return inner
                .notifications
                .values()
                .find(|n| n.source_event_id == Some(event_id))
                .cloned()
                .map(|notification| Transformed {
                    notification,
                    created: false,
                })
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "Raw event {} is processed but has no notification",
                        event_id
                    ))
                });
        }

        let mut notification = Self::new_notification(draft);
        notification.source_event_id = Some(event_id);
        inner
            .notifications
            .insert(notification.id, notification.clone());

        if let Some(event) = inner.events.get_mut(&event_id) {
            event.processed = true;
            event.claimed_until = None;
        }

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
        let mut inner = self.lock();

        if inner.failing_keyed_inserts > 0 {
            inner.failing_keyed_inserts -= 1;
            return Err(AppError::Internal(format!(
                "Simulated failure inserting {}",
                dedupe_key
            )));
        }

        if let Some(existing) = inner
            .notifications
            .values()
            .find(|n| n.dedupe_key.as_deref() == Some(dedupe_key))
        {
            return Ok(Transformed {
                notification: existing.clone(),
                created: false,
            });
        }

        let mut notification = Self::new_notification(draft);
        notification.dedupe_key = Some(dedupe_key.to_string());
        inner
            .notifications
            .insert(notification.id, notification.clone());

        Ok(Transformed {
            notification,
            created: true,
        })
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self.lock().notifications.get(&id).cloned())
    }

    async fn update_notification_state(
        &self,
        id: Uuid,
        new_state: NotificationState,
        attempt_increment: i32,
        failure: Option<&FailureDetail>,
    ) -> Result<Notification, AppError> {
        let (notification, _) =
            self.apply_transition(id, None, new_state, attempt_increment, failure)?;
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
        let (notification, applied) = self.apply_transition(
            id,
            Some(expected_attempts),
            new_state,
            attempt_increment,
            failure,
        )?;
        Ok(applied.then_some(notification))
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut stale: Vec<Notification> = self
            .lock()
            .notifications
            .values()
            .filter(|n| {
                n.state == NotificationState::Pending
                    && n.last_attempt_at.unwrap_or(n.created_at) < older_than
            })
            .cloned()
            .collect();
        stale.sort_by_key(|n| n.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn find_stalled_retries(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut stalled: Vec<Notification> = self
            .lock()
            .notifications
            .values()
            .filter(|n| {
                n.state == NotificationState::Failed
                    && n.failure_kind == Some(FailureKind::Transport)
                    && n.attempt_count < max_attempts
                    && n.last_attempt_at.is_some_and(|at| at < older_than)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|n| n.last_attempt_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn active_schedules_for_day(&self, day_of_week: i16) -> Result<Vec<Schedule>, AppError> {
        let mut schedules: Vec<Schedule> = self
            .lock()
            .schedules
            .iter()
            .filter(|s| s.is_active && s.day_of_week == day_of_week)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| (s.user_id, s.start_time));
        Ok(schedules)
    }
}

#[async_trait]
impl QueryStore for MemoryStore {
    async fn find_user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<User>, AppError> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.telegram_id == Some(telegram_id))
            .cloned())
    }

    async fn schedules_for_user(
        &self,
        user_id: Uuid,
        day_of_week: i16,
    ) -> Result<Vec<Schedule>, AppError> {
        let mut schedules: Vec<Schedule> = self
            .lock()
            .schedules
            .iter()
            .filter(|s| s.user_id == user_id && s.is_active && s.day_of_week == day_of_week)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.start_time);
        Ok(schedules)
    }

    async fn recent_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut recent: Vec<Notification> = self
            .lock()
            .notifications
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn dead_notifications(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut dead: Vec<Notification> = self
            .lock()
            .notifications
            .values()
            .filter(|n| n.state == NotificationState::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| {
            b.last_attempt_at
                .unwrap_or(b.created_at)
                .cmp(&a.last_attempt_at.unwrap_or(a.created_at))
        });
        dead.truncate(limit);
        Ok(dead)
    }

    async fn backlog_summary(&self) -> Result<BacklogSummary, AppError> {
        let inner = self.lock();
        let mut summary = BacklogSummary {
            unprocessed_events: inner.events.values().filter(|e| !e.processed).count() as i64,
            ..Default::default()
        };
        for n in inner.notifications.values() {
            match n.state {
                NotificationState::Pending => summary.pending += 1,
                NotificationState::Sent => summary.sent += 1,
                NotificationState::Failed => summary.failed += 1,
                NotificationState::Dead => summary.dead += 1,
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl RecipientRegistry for MemoryStore {
    async fn resolve(&self, user_id: Uuid) -> Result<Option<i64>, AppError> {
        Ok(self
            .lock()
            .users
            .get(&user_id)
            .and_then(|u| u.telegram_id))
    }
}
