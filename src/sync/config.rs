use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PROTOCOL_ERROR_THRESHOLD: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_POLL_MIN_AGE_MS: u64 = 15_000;
pub const DEFAULT_PUSH_FRESH_MS: u64 = 30_000;
pub const DEFAULT_POLL_RETRIES: u32 = 3;
pub const DEFAULT_POLL_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STALE_AFTER_MS: u64 = 300_000;
pub const DEFAULT_RETRY_CEILING: u32 = 3;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BOOTSTRAP_GRACE_MS: u64 = 3_000;
pub const DEFAULT_PERSIST_EVERY_UPDATES: u32 = 20;
pub const DEFAULT_PERSIST_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 1_000;
pub const MIN_BACKOFF_MS: u64 = 100;
pub const MAX_BACKOFF_MS: u64 = 60_000;
pub const MIN_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 100;
pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 120_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;
pub const MIN_STALE_AFTER_MS: u64 = 1_000;
pub const MAX_STALE_AFTER_MS: u64 = 86_400_000;
pub const MAX_RETRY_CEILING: u32 = 50;
pub const MAX_POLL_RETRIES: u32 = 10;
pub const MAX_PERSIST_EVERY_UPDATES: u32 = 10_000;

const ENV_PREFIX: &str = "PRICE_SYNC_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigArgs {
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub protocol_error_threshold: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub poll_min_age_ms: Option<u64>,
    pub push_fresh_ms: Option<u64>,
    pub poll_retries: Option<u32>,
    pub poll_retry_delay_ms: Option<u64>,
    pub poll_timeout_ms: Option<u64>,
    pub stale_after_ms: Option<u64>,
    pub retry_ceiling: Option<u32>,
    pub drain_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub bootstrap_grace_ms: Option<u64>,
    pub persist_every_updates: Option<u32>,
    pub persist_interval_ms: Option<u64>,
    pub dispatch_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub protocol_error_threshold: u32,
    pub poll_interval: Duration,
    pub poll_min_age: Duration,
    pub push_fresh: Duration,
    pub poll_retries: u32,
    pub poll_retry_delay: Duration,
    pub poll_timeout: Duration,
    pub stale_after: Duration,
    pub retry_ceiling: u32,
    pub drain_timeout: Duration,
    pub send_timeout: Duration,
    pub bootstrap_grace: Duration,
    pub persist_every_updates: u32,
    pub persist_interval: Duration,
    pub dispatch_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            protocol_error_threshold: DEFAULT_PROTOCOL_ERROR_THRESHOLD,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_min_age: Duration::from_millis(DEFAULT_POLL_MIN_AGE_MS),
            push_fresh: Duration::from_millis(DEFAULT_PUSH_FRESH_MS),
            poll_retries: DEFAULT_POLL_RETRIES,
            poll_retry_delay: Duration::from_millis(DEFAULT_POLL_RETRY_DELAY_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            stale_after: Duration::from_millis(DEFAULT_STALE_AFTER_MS),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            bootstrap_grace: Duration::from_millis(DEFAULT_BOOTSTRAP_GRACE_MS),
            persist_every_updates: DEFAULT_PERSIST_EVERY_UPDATES,
            persist_interval: Duration::from_millis(DEFAULT_PERSIST_INTERVAL_MS),
            dispatch_timeout: Duration::from_millis(DEFAULT_DISPATCH_TIMEOUT_MS),
        }
    }
}

fn bounded_ms(
    name: &str,
    value: Option<u64>,
    default: u64,
    min: u64,
    max: u64,
) -> Result<Duration, AppError> {
    let value = value.unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(Duration::from_millis(value))
}

fn bounded_count(
    name: &str,
    value: Option<u32>,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, AppError> {
    let value = value.unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

fn env_value<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

impl SyncConfigArgs {
    /// Reads `PRICE_SYNC_*` overrides; unset or unparsable variables fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            backoff_initial_ms: env_value("BACKOFF_INITIAL_MS"),
            backoff_max_ms: env_value("BACKOFF_MAX_MS"),
            max_reconnect_attempts: env_value("MAX_RECONNECT_ATTEMPTS"),
            connect_timeout_ms: env_value("CONNECT_TIMEOUT_MS"),
            protocol_error_threshold: env_value("PROTOCOL_ERROR_THRESHOLD"),
            poll_interval_ms: env_value("POLL_INTERVAL_MS"),
            poll_min_age_ms: env_value("POLL_MIN_AGE_MS"),
            push_fresh_ms: env_value("PUSH_FRESH_MS"),
            poll_retries: env_value("POLL_RETRIES"),
            poll_retry_delay_ms: env_value("POLL_RETRY_DELAY_MS"),
            poll_timeout_ms: env_value("POLL_TIMEOUT_MS"),
            stale_after_ms: env_value("STALE_AFTER_MS"),
            retry_ceiling: env_value("RETRY_CEILING"),
            drain_timeout_ms: env_value("DRAIN_TIMEOUT_MS"),
            send_timeout_ms: env_value("SEND_TIMEOUT_MS"),
            bootstrap_grace_ms: env_value("BOOTSTRAP_GRACE_MS"),
            persist_every_updates: env_value("PERSIST_EVERY_UPDATES"),
            persist_interval_ms: env_value("PERSIST_INTERVAL_MS"),
            dispatch_timeout_ms: env_value("DISPATCH_TIMEOUT_MS"),
        }
    }

    pub fn normalize(self) -> Result<SyncConfig, AppError> {
        let backoff_initial = bounded_ms(
            "backoffInitialMs",
            self.backoff_initial_ms,
            DEFAULT_BACKOFF_INITIAL_MS,
            MIN_BACKOFF_MS,
            MAX_BACKOFF_MS,
        )?;
        let backoff_max = bounded_ms(
            "backoffMaxMs",
            self.backoff_max_ms,
            DEFAULT_BACKOFF_MAX_MS,
            MIN_BACKOFF_MS,
            MAX_BACKOFF_MS,
        )?;
        if backoff_max < backoff_initial {
            return Err(AppError::InvalidArgument(
                "backoffMaxMs must not be below backoffInitialMs".to_string(),
            ));
        }

        let poll_interval = bounded_ms(
            "pollIntervalMs",
            self.poll_interval_ms,
            DEFAULT_POLL_INTERVAL_MS,
            MIN_POLL_INTERVAL_MS,
            MAX_POLL_INTERVAL_MS,
        )?;
        let poll_min_age = bounded_ms(
            "pollMinAgeMs",
            self.poll_min_age_ms,
            DEFAULT_POLL_MIN_AGE_MS,
            0,
            MAX_POLL_INTERVAL_MS,
        )?;
        let stale_after = bounded_ms(
            "staleAfterMs",
            self.stale_after_ms,
            DEFAULT_STALE_AFTER_MS,
            MIN_STALE_AFTER_MS,
            MAX_STALE_AFTER_MS,
        )?;

        Ok(SyncConfig {
            backoff_initial,
            backoff_max,
            max_reconnect_attempts: bounded_count(
                "maxReconnectAttempts",
                self.max_reconnect_attempts,
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
                MIN_RECONNECT_ATTEMPTS,
                MAX_RECONNECT_ATTEMPTS,
            )?,
            connect_timeout: bounded_ms(
                "connectTimeoutMs",
                self.connect_timeout_ms,
                DEFAULT_CONNECT_TIMEOUT_MS,
                MIN_TIMEOUT_MS,
                MAX_TIMEOUT_MS,
            )?,
            protocol_error_threshold: bounded_count(
                "protocolErrorThreshold",
                self.protocol_error_threshold,
                DEFAULT_PROTOCOL_ERROR_THRESHOLD,
                1,
                MAX_RECONNECT_ATTEMPTS,
            )?,
            poll_interval,
            poll_min_age,
            push_fresh: bounded_ms(
                "pushFreshMs",
                self.push_fresh_ms,
                DEFAULT_PUSH_FRESH_MS,
                0,
                MAX_STALE_AFTER_MS,
            )?,
            poll_retries: bounded_count(
                "pollRetries",
                self.poll_retries,
                DEFAULT_POLL_RETRIES,
                0,
                MAX_POLL_RETRIES,
            )?,
            poll_retry_delay: bounded_ms(
                "pollRetryDelayMs",
                self.poll_retry_delay_ms,
                DEFAULT_POLL_RETRY_DELAY_MS,
                0,
                MAX_TIMEOUT_MS,
            )?,
            poll_timeout: bounded_ms(
                "pollTimeoutMs",
                self.poll_timeout_ms,
                DEFAULT_POLL_TIMEOUT_MS,
                MIN_TIMEOUT_MS,
                MAX_TIMEOUT_MS,
            )?,
            stale_after,
            retry_ceiling: bounded_count(
                "retryCeiling",
                self.retry_ceiling,
                DEFAULT_RETRY_CEILING,
                0,
                MAX_RETRY_CEILING,
            )?,
            drain_timeout: bounded_ms(
                "drainTimeoutMs",
                self.drain_timeout_ms,
                DEFAULT_DRAIN_TIMEOUT_MS,
                MIN_TIMEOUT_MS,
                MAX_TIMEOUT_MS,
            )?,
            send_timeout: bounded_ms(
                "sendTimeoutMs",
                self.send_timeout_ms,
                DEFAULT_SEND_TIMEOUT_MS,
                MIN_TIMEOUT_MS,
                MAX_TIMEOUT_MS,
            )?,
            bootstrap_grace: bounded_ms(
                "bootstrapGraceMs",
                self.bootstrap_grace_ms,
                DEFAULT_BOOTSTRAP_GRACE_MS,
                0,
                MAX_TIMEOUT_MS,
            )?,
            persist_every_updates: bounded_count(
                "persistEveryUpdates",
                self.persist_every_updates,
                DEFAULT_PERSIST_EVERY_UPDATES,
                1,
                MAX_PERSIST_EVERY_UPDATES,
            )?,
            persist_interval: bounded_ms(
                "persistIntervalMs",
                self.persist_interval_ms,
                DEFAULT_PERSIST_INTERVAL_MS,
                MIN_TIMEOUT_MS,
                MAX_TIMEOUT_MS,
            )?,
            dispatch_timeout: bounded_ms(
                "dispatchTimeoutMs",
                self.dispatch_timeout_ms,
                DEFAULT_DISPATCH_TIMEOUT_MS,
                MIN_TIMEOUT_MS,
                MAX_TIMEOUT_MS,
            )?,
        })
    }
}
