//! Transformer: turns raw events and schedule ticks into notifications.
//!
//! For each claimed raw event:
//! 1. Resolve the recipient address to a user (unknown → release the claim, retry next cycle)
//! 2. Build the notification draft (pure)
//! 3. Mark processed + insert the notification atomically via the store
//!
//! Concurrent transformer passes are safe: the claim lease keeps them apart and
//! the atomic mark makes a second pass over the same event a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};
use uuid::Uuid;

use classbell_common::config::PipelineConfig;
use classbell_common::error::AppError;
use classbell_common::types::{
    Notification, NotificationDraft, NotificationType, RawEvent, Schedule, User,
};

use crate::store::{EventStore, Transformed};

/// Appended to truncated content.
const ELLIPSIS: char = '…';

/// Outcome of one claim-and-transform pass.
#[derive(Debug, Default)]
pub struct TransformReport {
    /// Notifications inserted by this pass; each must be dispatched once.
    pub created: Vec<Notification>,
    /// Events that were already processed by a racing pass.
    pub duplicates: usize,
    /// Events left unprocessed because no user matches the recipient.
    pub unknown_recipients: usize,
    /// Events that hit a store error; their lease expires and they are retried.
    pub errors: usize,
}

/// Outcome of one schedule digest pass.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Digests inserted by this pass; each must be dispatched once.
    pub created: Vec<Notification>,
    /// Users whose digest insert failed. A rerun for the same date picks them up.
    pub failed: usize,
}

impl ScheduleReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

pub struct Transformer {
    store: Arc<dyn EventStore>,
    config: PipelineConfig,
}

impl Transformer {
    pub fn new(store: Arc<dyn EventStore>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Claim a batch of raw events and transform each one.
    ///
    /// One bad event never stops the batch; failures are counted and logged.
    pub async fn run_once(&self) -> Result<TransformReport, AppError> {
        let events = self
            .store
            .claim_unprocessed_events(self.config.claim_batch_size, self.config.claim_lease)
            .await?;

        let mut report = TransformReport::default();

        for event in &events {
            match self.transform_event(event).await {
                Ok(Transformed {
                    notification,
                    created: true,
                }) => report.created.push(notification),
                Ok(Transformed { created: false, .. }) => report.duplicates += 1,
                Err(AppError::UnknownRecipient(recipient)) => {
                    tracing::warn!(
                        event_id = %event.id,
                        recipient = %recipient,
                        sender = %event.sender,
                        "No user matches raw event recipient; leaving unprocessed"
                    );
                    report.unknown_recipients += 1;
                    self.release(event.id).await;
                }
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "Failed to transform raw event");
                    report.errors += 1;
                    self.release(event.id).await;
                }
            }
        }

        if !events.is_empty() {
            tracing::info!(
                claimed = events.len(),
                created = report.created.len(),
                duplicates = report.duplicates,
                unknown_recipients = report.unknown_recipients,
                errors = report.errors,
                "Transform pass complete"
            );
        }

        Ok(report)
    }

    /// Transform a single raw event. Fails with `UnknownRecipient` without touching the event.
    pub async fn transform_event(&self, event: &RawEvent) -> Result<Transformed, AppError> {
        let user = self
            .store
            .find_user_by_recipient(&event.recipient)
            .await?
            .ok_or_else(|| AppError::UnknownRecipient(event.recipient.clone()))?;

        let draft = Self::email_draft(&user, event, self.config.content_truncate_length);
        self.store
            .mark_processed_and_create_notification(event.id, &draft)
            .await
    }

    /// Create one schedule digest per user with active lessons on `date`.
    ///
    /// Safe to call repeatedly for the same date: digests are keyed by user and date.
    /// Per-user insert failures are counted in the report, not raised.
    pub async fn run_schedule_tick(&self, date: NaiveDate) -> Result<ScheduleReport, AppError> {
        let day = day_of_week(date);
        let schedules = self.store.active_schedules_for_day(day).await?;

        let mut by_user: BTreeMap<Uuid, Vec<Schedule>> = BTreeMap::new();
        for entry in schedules {
            by_user.entry(entry.user_id).or_default().push(entry);
        }

        let mut report = ScheduleReport::default();
        for (user_id, entries) in &by_user {
            let Some(draft) = Self::schedule_draft(*user_id, entries, date) else {
                continue;
            };
            let key = Self::schedule_dedupe_key(*user_id, date);
            match self.store.create_keyed_notification(&key, &draft).await {
                Ok(t) if t.created => report.created.push(t.notification),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Failed to create schedule digest");
                    report.failed += 1;
                }
            }
        }

        if !report.created.is_empty() || report.failed > 0 {
            tracing::info!(
                date = %date,
                digests = report.created.len(),
                failed = report.failed,
                "Schedule digest pass complete"
            );
        }
        Ok(report)
    }

    async fn release(&self, event_id: Uuid) {
        if let Err(e) = self.store.release_claim(event_id).await {
            // The lease still expires on its own.
            tracing::warn!(event_id = %event_id, error = %e, "Failed to release claim");
        }
    }

    /// Build the notification for a school email.
    pub fn email_draft(user: &User, event: &RawEvent, max_chars: usize) -> NotificationDraft {
        let subject = event.subject.trim();
        NotificationDraft {
            user_id: user.id,
            notification_type: NotificationType::Email,
            title: if subject.is_empty() {
                "(no subject)".to_string()
            } else {
                subject.to_string()
            },
            content: truncate_content(&event.content, max_chars),
        }
    }

    /// Build the daily schedule digest. `None` when there are no entries.
    pub fn schedule_draft(
        user_id: Uuid,
        entries: &[Schedule],
        date: NaiveDate,
    ) -> Option<NotificationDraft> {
        if entries.is_empty() {
            return None;
        }

        let mut sorted: Vec<&Schedule> = entries.iter().collect();
        sorted.sort_by_key(|s| s.start_time);

        let lines: Vec<String> = sorted
            .iter()
            .map(|s| {
                format!(
                    "{}–{} {} · {} · room {}",
                    s.start_time.format("%H:%M"),
                    s.end_time.format("%H:%M"),
                    s.subject,
                    s.teacher,
                    s.classroom
                )
            })
            .collect();

        Some(NotificationDraft {
            user_id,
            notification_type: NotificationType::Schedule,
            title: format!("Schedule for {}, {}", weekday_name(date.weekday()), date),
            content: lines.join("\n"),
        })
    }

    pub fn schedule_dedupe_key(user_id: Uuid, date: NaiveDate) -> String {
        format!("schedule:{}:{}", user_id, date)
    }
}

/// Cut `content` to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut truncated: String = content.chars().take(max_chars - 1).collect();
    truncated.push(ELLIPSIS);
    truncated
}

/// 0 = Monday .. 6 = Sunday, matching `schedules.day_of_week`.
pub fn day_of_week(date: NaiveDate) -> i16 {
    date.weekday().num_days_from_monday() as i16
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
