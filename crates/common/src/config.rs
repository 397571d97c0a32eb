use std::time::Duration;

use serde::Deserialize;

/// Minimum gap between the send timeout and the broker visibility timeout.
const VISIBILITY_MARGIN: Duration = Duration::from_secs(5);

/// Knobs of the delivery pipeline, passed by reference into each component.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Delivery attempts before a notification goes DEAD (default: 3)
    pub max_attempts: i32,

    /// Delay before the first retry. The retry after failed attempt n waits
    /// `base × 2^(n-1)`, capped at `backoff_max_delay`
    pub backoff_base_delay: Duration,

    /// Upper bound for a single retry delay
    pub backoff_max_delay: Duration,

    /// PENDING notifications older than this are re-published by the sweep
    pub stale_pending_threshold: Duration,

    /// Email bodies longer than this many characters are truncated
    pub content_truncate_length: usize,

    /// Timeout for a single chat-transport send
    pub send_timeout: Duration,

    /// Unacked broker entries older than this are redelivered
    pub broker_visibility_timeout: Duration,

    /// How long a claimed raw event stays reserved for one transformer
    pub claim_lease: Duration,

    /// Raw events claimed per transformer pass
    pub claim_batch_size: i64,

    /// Transformer loop period
    pub transform_interval: Duration,

    /// Sweep loop period
    pub sweep_interval: Duration,

    /// Delivery workers per process
    pub worker_concurrency: usize,

    /// UTC hour from which the daily schedule digest is generated
    pub schedule_digest_hour: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_delay: Duration::from_secs(1),
            backoff_max_delay: Duration::from_secs(300),
            stale_pending_threshold: Duration::from_secs(300),
            content_truncate_length: 4000,
            send_timeout: Duration::from_secs(10),
            broker_visibility_timeout: Duration::from_secs(60),
            claim_lease: Duration::from_secs(60),
            claim_batch_size: 50,
            transform_interval: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
            worker_concurrency: 4,
            schedule_digest_hour: 6,
        }
    }
}

impl PipelineConfig {
    /// Reject combinations that would break delivery guarantees.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts < 1 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.broker_visibility_timeout <= self.send_timeout + VISIBILITY_MARGIN {
            anyhow::bail!(
                "BROKER_VISIBILITY_TIMEOUT_MS must exceed SEND_TIMEOUT_MS by more than {}s",
                VISIBILITY_MARGIN.as_secs()
            );
        }
        if self.worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.schedule_digest_hour > 23 {
            anyhow::bail!("SCHEDULE_DIGEST_HOUR must be between 0 and 23");
        }
        Ok(())
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (delivery broker)
    pub redis_url: String,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL
    pub telegram_api_base: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Operator API listen port
    pub api_port: u16,

    /// Bearer token guarding the operator API. Unset disables the check.
    pub ops_api_token: Option<String>,

    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PipelineConfig::default();

        let pipeline = PipelineConfig {
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base_delay: millis_or(
                &lookup,
                "BACKOFF_BASE_DELAY_MS",
                defaults.backoff_base_delay,
            )?,
            backoff_max_delay: millis_or(
                &lookup,
                "BACKOFF_MAX_DELAY_MS",
                defaults.backoff_max_delay,
            )?,
            stale_pending_threshold: Duration::from_secs(parse_or(
                &lookup,
                "STALE_PENDING_THRESHOLD_SECS",
                defaults.stale_pending_threshold.as_secs(),
            )?),
            content_truncate_length: parse_or(
                &lookup,
                "CONTENT_TRUNCATE_LENGTH",
                defaults.content_truncate_length,
            )?,
            send_timeout: millis_or(&lookup, "SEND_TIMEOUT_MS", defaults.send_timeout)?,
            broker_visibility_timeout: millis_or(
                &lookup,
                "BROKER_VISIBILITY_TIMEOUT_MS",
                defaults.broker_visibility_timeout,
            )?,
            claim_lease: Duration::from_secs(parse_or(
                &lookup,
                "CLAIM_LEASE_SECS",
                defaults.claim_lease.as_secs(),
            )?),
            claim_batch_size: parse_or(&lookup, "CLAIM_BATCH_SIZE", defaults.claim_batch_size)?,
            transform_interval: millis_or(
                &lookup,
                "TRANSFORM_INTERVAL_MS",
                defaults.transform_interval,
            )?,
            sweep_interval: millis_or(&lookup, "SWEEP_INTERVAL_MS", defaults.sweep_interval)?,
            worker_concurrency: parse_or(
                &lookup,
                "WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            schedule_digest_hour: parse_or(
                &lookup,
                "SCHEDULE_DIGEST_HOUR",
                defaults.schedule_digest_hour,
            )?,
        };
        pipeline.validate()?;

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            telegram_bot_token: lookup("TELEGRAM_BOT_TOKEN"),
            telegram_api_base: lookup("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_or(&lookup, "API_PORT", 3000)?,
            ops_api_token: lookup("OPS_API_TOKEN").filter(|t| !t.is_empty()),
            pipeline,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> anyhow::Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("DATABASE_URL", "postgres://localhost/classbell")]).unwrap();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.content_truncate_length, 4000);
        assert_eq!(config.db_max_connections, 20);
        assert!(config.ops_api_token.is_none());
    }

    #[test]
    fn test_database_url_required() {
        assert!(config_from(&[]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://db/classbell"),
            ("MAX_ATTEMPTS", "5"),
            ("BACKOFF_BASE_DELAY_MS", "250"),
            ("STALE_PENDING_THRESHOLD_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.pipeline.max_attempts, 5);
        assert_eq!(
            config.pipeline.backoff_base_delay,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.pipeline.stale_pending_threshold,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_invalid_number_rejected() {
        let result = config_from(&[("DATABASE_URL", "x"), ("MAX_ATTEMPTS", "three")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_visibility_timeout_must_exceed_send_timeout() {
        let result = config_from(&[
            ("DATABASE_URL", "x"),
            ("SEND_TIMEOUT_MS", "30000"),
            ("BROKER_VISIBILITY_TIMEOUT_MS", "32000"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_digest_hour_bounds() {
        let config = config_from(&[("DATABASE_URL", "x"), ("SCHEDULE_DIGEST_HOUR", "18")]).unwrap();
        assert_eq!(config.pipeline.schedule_digest_hour, 18);
        assert!(config_from(&[("DATABASE_URL", "x"), ("SCHEDULE_DIGEST_HOUR", "24")]).is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = config_from(&[("DATABASE_URL", "x"), ("MAX_ATTEMPTS", "0")]);
        assert!(result.is_err());
    }
}
