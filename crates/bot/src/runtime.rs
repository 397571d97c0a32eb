//! Long-running loops of the bot process.
//!
//! Every loop checks a shared `watch` shutdown flag between iterations and
//! never abandons a store operation halfway.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tokio::sync::watch;

use classbell_common::broker::Broker;
use classbell_common::config::PipelineConfig;
use classbell_common::error::AppError;
use classbell_engine::dispatcher::{Dispatcher, SweepReport};
use classbell_engine::registry::RecipientRegistry;
use classbell_engine::store::EventStore;
use classbell_engine::transformer::Transformer;
use classbell_notifier::transport::{ChatTransport, TelegramTransport, Update};

use crate::commands::{Command, CommandHandler};

/// Long-poll window for `getUpdates`.
const LONG_POLL: Duration = Duration::from_secs(30);

/// Pause after a failed `getUpdates` call.
const UPDATES_RETRY: Duration = Duration::from_secs(5);

const FALLBACK_REPLY: &str = "Something went wrong, please try again later.";

/// Transformer and dispatcher wired together for the periodic loops.
pub struct Pipeline {
    transformer: Transformer,
    dispatcher: Arc<Dispatcher>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<dyn RecipientRegistry>,
        broker: Arc<dyn Broker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transformer: Transformer::new(store.clone(), config.clone()),
            dispatcher: Arc::new(Dispatcher::new(store, registry, broker, config.clone())),
            config,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// One transformer pass; every newly created notification is published.
    pub async fn transform_tick(&self) -> Result<usize, AppError> {
        let report = self.transformer.run_once().await?;
        Ok(self.dispatcher.dispatch_all(&report.created).await)
    }

    /// Sweep, then build the daily schedule digest once the digest hour is reached.
    ///
    /// `last_digest` remembers the last date a digest pass completed for every
    /// user, so the pass runs once per day per process. A pass with failed
    /// inserts leaves it unset and the next sweep retries; the dedupe key keeps
    /// the rerun from duplicating digests that did go through.
    pub async fn sweep_tick(
        &self,
        now: DateTime<Utc>,
        last_digest: &mut Option<NaiveDate>,
    ) -> Result<SweepReport, AppError> {
        let report = self.dispatcher.sweep().await?;

        let today = now.date_naive();
        if now.hour() >= self.config.schedule_digest_hour && *last_digest != Some(today) {
            let digests = self.transformer.run_schedule_tick(today).await?;
            self.dispatcher.dispatch_all(&digests.created).await;
            if digests.is_complete() {
                *last_digest = Some(today);
            } else {
                tracing::warn!(
                    date = %today,
                    failed = digests.failed,
                    "Schedule digest pass incomplete; retrying on next sweep"
                );
            }
        }

        Ok(report)
    }

    pub async fn run_transform_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.transform_interval.as_millis() as u64,
            "Transform loop started"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.transform_tick().await {
                tracing::error!(error = %e, "Transform pass failed");
            }
            if !pause(&mut shutdown, self.config.transform_interval).await {
                break;
            }
        }

        tracing::info!("Transform loop stopped");
    }

    pub async fn run_sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            digest_hour = self.config.schedule_digest_hour,
            "Sweep loop started"
        );

        let mut last_digest = None;
        while !*shutdown.borrow() {
            if let Err(e) = self.sweep_tick(Utc::now(), &mut last_digest).await {
                tracing::error!(error = %e, "Sweep pass failed");
            }
            if !pause(&mut shutdown, self.config.sweep_interval).await {
                break;
            }
        }

        tracing::info!("Sweep loop stopped");
    }
}

/// Sleep for `period` or until shutdown. Returns `false` when the loop should stop.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    let changed = tokio::select! {
        changed = shutdown.changed() => changed,
        _ = tokio::time::sleep(period) => return true,
    };
    changed.is_ok() && !*shutdown.borrow()
}

/// Reply for one incoming update, if it carries a command we answer.
pub async fn reply_to(
    handler: &CommandHandler,
    bot_username: Option<&str>,
    update: &Update,
    today: NaiveDate,
) -> Option<(i64, String)> {
    let message = update.message.as_ref()?;
    let command = Command::parse(message.text.as_deref()?, bot_username)?;
    let chat_id = message.chat.id;

    match handler.respond(chat_id, command, today).await {
        Ok(reply) => Some((chat_id, reply)),
        Err(e) => {
            tracing::error!(chat_id, ?command, error = %e, "Command failed");
            Some((chat_id, FALLBACK_REPLY.to_string()))
        }
    }
}

/// Answer chat commands received through `getUpdates` long polling.
pub async fn run_command_loop(
    transport: Arc<TelegramTransport>,
    handler: CommandHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let username = transport.bot().username.clone();
    let mut offset = 0;
    tracing::info!("Command loop started");

    while !*shutdown.borrow() {
        let result = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            result = transport.get_updates(offset, LONG_POLL) => result,
        };

        let updates = match result {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, "getUpdates failed");
                if !pause(&mut shutdown, UPDATES_RETRY).await {
                    break;
                }
                continue;
            }
        };

        for update in &updates {
            offset = offset.max(update.update_id + 1);
            let today = Utc::now().date_naive();
            if let Some((chat_id, text)) =
                reply_to(&handler, username.as_deref(), update, today).await
                && let Err(e) = transport.send(chat_id, &text).await
            {
                tracing::warn!(chat_id, error = %e, "Failed to send command reply");
            }
        }
    }

    tracing::info!("Command loop stopped");
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use classbell_common::broker::{DELIVERY_TOPIC, MemoryBroker};
    use classbell_common::types::NotificationType;
    use classbell_engine::memory::MemoryStore;
    use classbell_engine::testing::{email_event, make_schedule, make_user};
    use classbell_notifier::transport::{Chat, Message};

    fn pipeline(store: &Arc<MemoryStore>, broker: &Arc<MemoryBroker>) -> Pipeline {
        Pipeline::new(
            store.clone(),
            store.clone(),
            broker.clone(),
            PipelineConfig::default(),
        )
    }

    fn text_update(chat_id: i64, text: &str) -> Update {
        Update {
            update_id: 10,
            message: Some(Message {
                message_id: 1,
                chat: Chat { id: chat_id },
                text: Some(text.to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn test_transform_tick_publishes_new_notifications() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::default());
        store.add_user(make_user(Some(1)));
        store.insert_event(email_event("parent@example.com"));
        store.insert_event(email_event("ghost@nowhere.com"));

        let pipeline = pipeline(&store, &broker);
        assert_eq!(pipeline.transform_tick().await.unwrap(), 1);
        assert_eq!(broker.published(DELIVERY_TOPIC).len(), 1);

        // A second pass finds nothing new.
        assert_eq!(pipeline.transform_tick().await.unwrap(), 0);
        assert_eq!(broker.published(DELIVERY_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_tick_builds_digest_once_after_digest_hour() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let user = make_user(Some(1));
        store.add_user(user.clone());
        store.add_schedule(make_schedule(user.id, 0, "Math", (8, 0), (8, 45)));
        let pipeline = pipeline(&store, &broker);

        let mut last_digest = None;
        let early = Utc.with_ymd_and_hms(2025, 1, 6, 5, 0, 0).unwrap();
        pipeline.sweep_tick(early, &mut last_digest).await.unwrap();
        assert!(store.notifications().is_empty());
        assert_eq!(last_digest, None);

        let after = Utc.with_ymd_and_hms(2025, 1, 6, 7, 0, 0).unwrap();
        pipeline.sweep_tick(after, &mut last_digest).await.unwrap();
        pipeline.sweep_tick(after, &mut last_digest).await.unwrap();

        let all = store.notifications();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].notification_type, NotificationType::Schedule);
        assert_eq!(broker.published(DELIVERY_TOPIC).len(), 1);
        assert_eq!(last_digest, Some(after.date_naive()));
    }

    #[tokio::test]
    async fn test_sweep_tick_retries_incomplete_digest() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let user = make_user(Some(1));
        store.add_user(user.clone());
        store.add_schedule(make_schedule(user.id, 0, "Math", (8, 0), (8, 45)));
        store.fail_keyed_inserts(1);
        let pipeline = pipeline(&store, &broker);

        let mut last_digest = None;
        let after = Utc.with_ymd_and_hms(2025, 1, 6, 7, 0, 0).unwrap();
        pipeline.sweep_tick(after, &mut last_digest).await.unwrap();
        assert_eq!(last_digest, None);
        assert!(store.notifications().is_empty());

        pipeline.sweep_tick(after, &mut last_digest).await.unwrap();
        assert_eq!(last_digest, Some(after.date_naive()));
        assert_eq!(store.notifications().len(), 1);
        assert_eq!(broker.published(DELIVERY_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_reply_to_command() {
        let store = Arc::new(MemoryStore::new());
        let handler = CommandHandler::new(store);
        let today = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();

        let (chat_id, text) = reply_to(&handler, None, &text_update(55, "/help"), today)
            .await
            .unwrap();
        assert_eq!(chat_id, 55);
        assert!(text.starts_with("Available commands"));

        assert!(
            reply_to(&handler, None, &text_update(55, "thanks!"), today)
                .await
                .is_none()
        );
        let empty = Update {
            update_id: 11,
            message: None,
        };
        assert!(reply_to(&handler, None, &empty, today).await.is_none());
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let pipeline = Arc::new(pipeline(&store, &broker));
        let (tx, rx) = watch::channel(false);

        let transform = {
            let pipeline = pipeline.clone();
            let rx = rx.clone();
            tokio::spawn(async move { pipeline.run_transform_loop(rx).await })
        };
        let sweep = tokio::spawn(async move { pipeline.run_sweep_loop(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            transform.await.unwrap();
            sweep.await.unwrap();
        })
        .await
        .unwrap();
    }
}
