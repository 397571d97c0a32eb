//! Chat commands: read-only queries answered through the chat transport.

use std::sync::Arc;

use chrono::NaiveDate;

use classbell_common::error::AppError;
use classbell_common::types::User;
use classbell_engine::store::QueryStore;
use classbell_engine::transformer::{Transformer, day_of_week};

/// Notifications listed by `/notifications`.
const RECENT_LIMIT: i64 = 5;

const HELP_TEXT: &str = "Available commands:\n\n\
    /schedule - View today's schedule\n\
    /homework - Check homework assignments\n\
    /grades - View recent grades\n\
    /notifications - Your latest notifications\n\
    /help - Show this help message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Schedule,
    Notifications,
    Homework,
    Grades,
}

impl Command {
    /// Parse `/name`, `/name args` or `/name@bot args`.
    ///
    /// A command addressed to another bot (`@other`) is not ours.
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let word = word.strip_prefix('/')?;

        let name = match word.split_once('@') {
            Some((name, target)) => {
                if let Some(own) = bot_username
                    && !target.eq_ignore_ascii_case(own)
                {
                    return None;
                }
                name
            }
            None => word,
        };

        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "help" => Some(Self::Help),
            "schedule" => Some(Self::Schedule),
            "notifications" => Some(Self::Notifications),
            "homework" => Some(Self::Homework),
            "grades" => Some(Self::Grades),
            _ => None,
        }
    }
}

pub struct CommandHandler {
    queries: Arc<dyn QueryStore>,
}

impl CommandHandler {
    pub fn new(queries: Arc<dyn QueryStore>) -> Self {
        Self { queries }
    }

    /// Reply text for `command` sent from `chat_id`.
    pub async fn respond(
        &self,
        chat_id: i64,
        command: Command,
        today: NaiveDate,
    ) -> Result<String, AppError> {
        let user = self.queries.find_user_by_telegram_id(chat_id).await?;

        let reply = match (command, user) {
            (Command::Start, Some(user)) => format!(
                "Welcome back, {}!\n\nYou will receive school schedules and important \
                 notifications here.\n\nUse /help to see available commands.",
                user.full_name
            ),
            (Command::Start, None) => format!(
                "Welcome to the School Parent Assistant!\n\n\
                 I will keep you updated with school schedules and important notifications.\n\n\
                 {}",
                not_registered(chat_id)
            ),
            (Command::Help, _) => HELP_TEXT.to_string(),
            (Command::Schedule, Some(user)) => self.today_schedule(&user, today).await?,
            (Command::Notifications, Some(user)) => self.recent(&user).await?,
            (Command::Homework, _) => "Homework tracking is not connected yet.".to_string(),
            (Command::Grades, _) => "Grades are not available yet.".to_string(),
            (Command::Schedule | Command::Notifications, None) => not_registered(chat_id),
        };

        Ok(reply)
    }

    async fn today_schedule(&self, user: &User, today: NaiveDate) -> Result<String, AppError> {
        let entries = self
            .queries
            .schedules_for_user(user.id, day_of_week(today))
            .await?;

        Ok(match Transformer::schedule_draft(user.id, &entries, today) {
            Some(draft) => format!("{}\n\n{}", draft.title, draft.content),
            None => "No lessons today.".to_string(),
        })
    }

    async fn recent(&self, user: &User) -> Result<String, AppError> {
        let notifications = self
            .queries
            .recent_notifications(user.id, RECENT_LIMIT)
            .await?;

        if notifications.is_empty() {
            return Ok("You have no notifications yet.".to_string());
        }

        let lines: Vec<String> = notifications
            .iter()
            .map(|n| {
                format!(
                    "[{}] {} ({})",
                    n.state,
                    n.title,
                    n.created_at.format("%Y-%m-%d %H:%M")
                )
            })
            .collect();
        Ok(format!("Latest notifications:\n\n{}", lines.join("\n")))
    }
}

fn not_registered(chat_id: i64) -> String {
    format!(
        "Your Telegram account is not linked yet. Ask the school office to register chat id {}.",
        chat_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use classbell_common::types::{NotificationDraft, NotificationState, NotificationType};
    use classbell_engine::memory::MemoryStore;
    use classbell_engine::store::EventStore;
    use classbell_engine::testing::{make_schedule, make_user};

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(Command::parse("/start", None), Some(Command::Start));
        assert_eq!(Command::parse("  /Help  ", None), Some(Command::Help));
        assert_eq!(
            Command::parse("/schedule tomorrow", None),
            Some(Command::Schedule)
        );
        assert_eq!(
            Command::parse("/grades@classbell_bot", Some("classbell_bot")),
            Some(Command::Grades)
        );
        assert_eq!(Command::parse("/grades@other_bot", Some("classbell_bot")), None);
        assert_eq!(Command::parse("hello", None), None);
        assert_eq!(Command::parse("/unknown", None), None);
        assert_eq!(Command::parse("", None), None);
    }

    #[tokio::test]
    async fn test_unregistered_sender() {
        let store = Arc::new(MemoryStore::new());
        let handler = CommandHandler::new(store);

        let reply = handler
            .respond(4242, Command::Schedule, monday())
            .await
            .unwrap();
        assert!(reply.contains("not linked"));
        assert!(reply.contains("4242"));

        let help = handler.respond(4242, Command::Help, monday()).await.unwrap();
        assert!(help.contains("/notifications"));
    }

    #[tokio::test]
    async fn test_schedule_for_today() {
        let store = Arc::new(MemoryStore::new());
        let user = make_user(Some(7));
        store.add_user(user.clone());
        store.add_schedule(make_schedule(user.id, 0, "Physics", (10, 0), (10, 45)));
        store.add_schedule(make_schedule(user.id, 0, "Math", (8, 0), (8, 45)));
        store.add_schedule(make_schedule(user.id, 1, "Art", (8, 0), (8, 45)));
        let handler = CommandHandler::new(store);

        let reply = handler.respond(7, Command::Schedule, monday()).await.unwrap();

        assert!(reply.starts_with("Schedule for Monday, 2025-01-06"));
        let math = reply.find("Math").unwrap();
        let physics = reply.find("Physics").unwrap();
        assert!(math < physics);
        assert!(!reply.contains("Art"));

        let tuesday = monday().succ_opt().unwrap();
        let sunday = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        assert!(
            handler
                .respond(7, Command::Schedule, tuesday)
                .await
                .unwrap()
                .contains("Art")
        );
        assert_eq!(
            handler.respond(7, Command::Schedule, sunday).await.unwrap(),
            "No lessons today."
        );
    }

    #[tokio::test]
    async fn test_recent_notifications() {
        let store = Arc::new(MemoryStore::new());
        let user = make_user(Some(7));
        store.add_user(user.clone());
        let handler = CommandHandler::new(store.clone());

        assert_eq!(
            handler
                .respond(7, Command::Notifications, monday())
                .await
                .unwrap(),
            "You have no notifications yet."
        );

        let created = store
            .create_keyed_notification(
                "announcement:1",
                &NotificationDraft {
                    user_id: user.id,
                    notification_type: NotificationType::Announcement,
                    title: "Sports day".to_string(),
                    content: "Friday".to_string(),
                },
            )
            .await
            .unwrap();
        store
            .update_notification_state(created.notification.id, NotificationState::Sent, 1, None)
            .await
            .unwrap();

        let reply = handler
            .respond(7, Command::Notifications, monday())
            .await
            .unwrap();
        assert!(reply.contains("[sent] Sports day"));
    }

    #[tokio::test]
    async fn test_start_greets_known_user() {
        let store = Arc::new(MemoryStore::new());
        let user = make_user(Some(7));
        store.add_user(user.clone());
        let handler = CommandHandler::new(store);

        let reply = handler.respond(7, Command::Start, monday()).await.unwrap();
        assert!(reply.contains("Welcome back, Test Parent"));
    }
}
