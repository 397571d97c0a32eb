//! Chat transport: the capability that puts a message in front of a user.
//!
//! [`TelegramTransport`] speaks the Telegram Bot API over HTTPS. Every failure
//! is classified into a [`TransportError`] so the delivery worker can decide
//! between a backoff retry and giving up.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use classbell_common::error::AppError;

/// Extra time allowed on top of a long-poll timeout before the HTTP call gives up.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request failed before a response arrived (DNS, TLS, reset).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// The API asked us to slow down.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The API answered but refused the call.
    #[error("Rejected with HTTP {status}: {description}")]
    Rejected { status: u16, description: String },
}

impl TransportError {
    /// Minimum wait the transport itself demands before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<TransportError> for AppError {
    fn from(e: TransportError) -> Self {
        AppError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Deliver `text` to the chat identified by `chat_id`.
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;

    /// Release the session. Sends after this call are not expected.
    async fn disconnect(&self) {}
}

// ---------------------------------------------------------------------------
// Telegram wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: &'static [&'static str],
}

// ---------------------------------------------------------------------------
// TelegramTransport
// ---------------------------------------------------------------------------

pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    bot: BotUser,
}

impl TelegramTransport {
    /// Build a client and validate the bot token with `getMe`.
    pub async fn connect(
        api_base: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = format!("{}/bot{}", api_base.trim_end_matches('/'), token);

        let response = client.get(format!("{}/getMe", base_url)).send().await?;
        let bot: BotUser = read_result(response).await?;

        tracing::info!(
            bot_id = bot.id,
            username = bot.username.as_deref().unwrap_or(""),
            "Connected to Telegram"
        );

        Ok(Self {
            client,
            base_url,
            bot,
        })
    }

    pub fn bot(&self) -> &BotUser {
        &self.bot
    }

    /// Long-poll for incoming messages with `update_id >= offset`.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let body = GetUpdates {
            offset,
            timeout: timeout.as_secs(),
            allowed_updates: &["message"],
        };
        let response = self
            .client
            .post(format!("{}/getUpdates", self.base_url))
            .timeout(timeout + LONG_POLL_SLACK)
            .json(&body)
            .send()
            .await?;
        read_result(response).await
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&SendMessage { chat_id, text })
            .send()
            .await?;
        let _: Message = read_result(response).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        tracing::info!(bot_id = self.bot.id, "Telegram transport closed");
    }
}

/// Decode a Bot API envelope, classifying failures.
async fn read_result<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status().as_u16();
    let envelope: TelegramResponse<T> = response.json().await?;
    classify(status, envelope)
}

fn classify<T>(status: u16, envelope: TelegramResponse<T>) -> Result<T, TransportError> {
    if status == 429 {
        let retry_after = envelope
            .parameters
            .and_then(|p| p.retry_after)
            .unwrap_or(1);
        return Err(TransportError::RateLimited {
            retry_after: Duration::from_secs(retry_after),
        });
    }

    match (envelope.ok, envelope.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(TransportError::Rejected {
            status,
            description: envelope
                .description
                .unwrap_or_else(|| "no description".to_string()),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
