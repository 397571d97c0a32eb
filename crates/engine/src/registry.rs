//! Recipient registry: maps a user id to Telegram chat id.
//!
//! Chat identities are written by the onboarding flow; the pipeline only reads them.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use classbell_common::error::AppError;

#[async_trait]
pub trait RecipientRegistry: Send + Sync {
    /// Chat id for `user_id`, or `None` when the user is unknown or not onboarded.
    async fn resolve(&self, user_id: Uuid) -> Result<Option<i64>, AppError>;
}

/// Registry backed by `users.telegram_id`.
#[derive(Clone)]
pub struct PgRecipientRegistry {
    pool: PgPool,
}

impl PgRecipientRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientRegistry for PgRecipientRegistry {
    async fn resolve(&self, user_id: Uuid) -> Result<Option<i64>, AppError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT telegram_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(telegram_id,)| telegram_id))
    }
}
