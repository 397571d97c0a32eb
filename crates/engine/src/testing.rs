//! Fixture builders shared by unit tests across the workspace.

use chrono::{NaiveTime, Utc};
use uuid::Uuid;

use classbell_common::types::{RawEvent, Schedule, User, UserRole};

/// A parent with email `parent@example.com` and the given chat id.
pub fn make_user(telegram_id: Option<i64>) -> User {
    User {
        id: Uuid::new_v4(),
        telegram_id,
        role: UserRole::Parent,
        full_name: "Test Parent".to_string(),
        email: Some("parent@example.com".to_string()),
        phone: None,
        created_at: Utc::now(),
    }
}

/// An unprocessed school email addressed to `recipient`.
pub fn email_event(recipient: &str) -> RawEvent {
    RawEvent {
        id: Uuid::new_v4(),
        sender: "teacher@school.com".to_string(),
        recipient: recipient.to_string(),
        subject: "Homework".to_string(),
        content: "Pages 10-12".to_string(),
        received_at: Utc::now(),
        processed: false,
        notification_sent: false,
        claimed_until: None,
    }
}

/// An active timetable entry; `start`/`end` are `(hour, minute)`.
pub fn make_schedule(
    user_id: Uuid,
    day_of_week: i16,
    subject: &str,
    start: (u32, u32),
    end: (u32, u32),
) -> Schedule {
    Schedule {
        id: Uuid::new_v4(),
        user_id,
        subject: subject.to_string(),
        teacher: "Ms. Novak".to_string(),
        classroom: "101".to_string(),
        start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN),
        end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN),
        day_of_week,
        is_active: true,
    }
}
