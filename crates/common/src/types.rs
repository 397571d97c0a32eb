use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a user is a parent or a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Parent,
    Student,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Parent => write!(f, "parent"),
            UserRole::Student => write!(f, "student"),
        }
    }
}

/// Kind of notification content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Schedule,
    Email,
    Reminder,
    Announcement,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Schedule => write!(f, "schedule"),
            NotificationType::Email => write!(f, "email"),
            NotificationType::Reminder => write!(f, "reminder"),
            NotificationType::Announcement => write!(f, "announcement"),
        }
    }
}

/// Notification delivery state.
///
/// Allowed transitions: `Pending → Sent | Failed`, `Failed → Pending | Dead`.
/// `Sent` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    Pending,
    Sent,
    Failed,
    Dead,
}

impl NotificationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationState::Sent | NotificationState::Dead)
    }

    /// Whether moving from `self` to `next` is a forward step of the delivery state machine.
    pub fn can_transition_to(self, next: NotificationState) -> bool {
        match (self, next) {
            (NotificationState::Pending, NotificationState::Sent)
            | (NotificationState::Pending, NotificationState::Failed)
            | (NotificationState::Failed, NotificationState::Pending)
            | (NotificationState::Failed, NotificationState::Dead) => true,
            (NotificationState::Pending, _)
            | (NotificationState::Failed, _)
            | (NotificationState::Sent, _)
            | (NotificationState::Dead, _) => false,
        }
    }
}

impl std::fmt::Display for NotificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationState::Pending => write!(f, "pending"),
            NotificationState::Sent => write!(f, "sent"),
            NotificationState::Failed => write!(f, "failed"),
            NotificationState::Dead => write!(f, "dead"),
        }
    }
}

/// Why a notification ended up FAILED or DEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Send failed on the wire; retried with backoff.
    Transport,
    /// The user has no chat identity; needs an operator fix.
    UnknownChatIdentity,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::UnknownChatIdentity => write!(f, "unknown_chat_identity"),
        }
    }
}

/// A parent or student.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    /// Telegram chat id. Set once during onboarding.
    pub telegram_id: Option<i64>,
    pub role: UserRole,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A recurring timetable entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subject: String,
    pub teacher: String,
    pub classroom: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// 0 = Monday .. 6 = Sunday
    pub day_of_week: i16,
    pub is_active: bool,
}

/// An inbound item (currently school email) waiting to become a notification.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawEvent {
    pub id: Uuid,
    pub sender: String,
    /// Recipient address, matched against `users.email`.
    pub recipient: String,
    pub subject: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
    /// A notification has been created from this event.
    pub processed: bool,
    /// Mirror of the linked notification reaching SENT.
    pub notification_sent: bool,
    /// Claim lease; the row is reserved by a transformer until this instant.
    pub claimed_until: Option<DateTime<Utc>>,
}

/// A deliverable message tracked through the delivery state machine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub content: String,
    pub state: NotificationState,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub source_event_id: Option<Uuid>,
    /// Uniqueness key for notifications without a source event (schedule digests).
    pub dedupe_key: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub last_error: Option<String>,
}

impl Notification {
    /// Text sent over the chat transport.
    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }
}

/// Content of a notification before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDraft {
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub content: String,
}

/// Failure details recorded alongside a FAILED/DEAD transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Broker payload asking a worker to deliver one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub notification_id: Uuid,
    /// Chat id known at publish time. Workers re-resolve it before sending.
    pub chat_id: Option<i64>,
}

/// Broker payload for the alerting consumer when a notification cannot be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub notification_id: Uuid,
    pub user_id: Uuid,
    pub state: NotificationState,
    pub attempts: i32,
    pub reason: FailureKind,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// Counts behind the operator backlog view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSummary {
    pub unprocessed_events: i64,
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub dead: i64,
}
