//! Application-level configuration loading: daemon timing, wake channel and
//! delivery target.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "GAME_SCHEDULER_CONFIG_PATH";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_NEAR_TERM_HORIZON: Duration = Duration::from_secs(600);
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_DISPATCH_CONCURRENCY: usize = 8;
const DEFAULT_WAKE_CHANNEL: &str = "schedule_wake";
const DEFAULT_JOIN_NOTIFICATION_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Postgres identifiers are truncated past this length.
const MAX_CHANNEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Maximum wait between two daemon cycles.
    pub poll_interval: Duration,
    /// Rows due within this window wake the daemon when written.
    pub near_term_horizon: Duration,
    /// Upper bound on rows fetched by one due-query.
    pub batch_size: usize,
    /// Deliveries in flight at once within a cycle.
    pub dispatch_concurrency: usize,
    /// Name of the database notification channel.
    pub wake_channel: String,
    /// Delay before a join notification fires.
    pub join_notification_delay: Duration,
    /// Where deliveries go.
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Delivery target settings.
pub struct DispatcherConfig {
    /// Message bus endpoint; deliveries go to the SSE hub when unset.
    pub webhook_url: Option<String>,
    /// Sent as `Authorization: Bearer ...` when present.
    pub bearer_token: Option<String>,
    /// Per-request timeout for the webhook.
    pub timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            bearer_token: None,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            near_term_horizon: DEFAULT_NEAR_TERM_HORIZON,
            batch_size: DEFAULT_BATCH_SIZE,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            wake_channel: DEFAULT_WAKE_CHANNEL.to_owned(),
            join_notification_delay: DEFAULT_JOIN_NOTIFICATION_DELAY,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        poll_interval_secs = app_config.poll_interval.as_secs(),
                        wake_channel = %app_config.wake_channel,
                        "loaded scheduler config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and sanitize a JSON document. Absent fields keep their defaults.
    pub fn from_json(contents: &str) -> serde_json::Result<Self> {
        let raw = serde_json::from_str::<RawConfig>(contents)?;
        Ok(raw.into())
    }

    /// The webhook URL, when deliveries should leave the process.
    pub fn webhook_url(&self) -> Option<&str> {
        self.dispatcher.webhook_url.as_deref()
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    poll_interval_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    near_term_horizon_secs: Option<Duration>,
    batch_size: Option<usize>,
    dispatch_concurrency: Option<usize>,
    wake_channel: Option<String>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    join_notification_delay_secs: Option<Duration>,
    dispatcher: RawDispatcher,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDispatcher {
    webhook_url: Option<String>,
    bearer_token: Option<String>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    timeout_secs: Option<Duration>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let wake_channel = match value.wake_channel {
            Some(channel) if is_valid_channel(&channel) => channel,
            Some(channel) => {
                warn!(
                    channel = %channel,
                    "wake channel must match [a-z0-9_]{{1,63}}; using default"
                );
                DEFAULT_WAKE_CHANNEL.to_owned()
            }
            None => DEFAULT_WAKE_CHANNEL.to_owned(),
        };

        Self {
            poll_interval: non_zero(value.poll_interval_secs, DEFAULT_POLL_INTERVAL),
            near_term_horizon: value
                .near_term_horizon_secs
                .unwrap_or(DEFAULT_NEAR_TERM_HORIZON),
            batch_size: value
                .batch_size
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            dispatch_concurrency: value
                .dispatch_concurrency
                .filter(|count| *count > 0)
                .unwrap_or(DEFAULT_DISPATCH_CONCURRENCY),
            wake_channel,
            join_notification_delay: value
                .join_notification_delay_secs
                .unwrap_or(DEFAULT_JOIN_NOTIFICATION_DELAY),
            dispatcher: DispatcherConfig {
                webhook_url: value.dispatcher.webhook_url.filter(|url| !url.trim().is_empty()),
                bearer_token: value
                    .dispatcher
                    .bearer_token
                    .filter(|token| !token.is_empty()),
                timeout: non_zero(value.dispatcher.timeout_secs, DEFAULT_DISPATCH_TIMEOUT),
            },
        }
    }
}

fn non_zero(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|duration| !duration.is_zero()).unwrap_or(default)
}

/// The channel name is interpolated into the trigger DDL.
fn is_valid_channel(channel: &str) -> bool {
    !channel.is_empty()
        && channel.len() <= MAX_CHANNEL_LEN
        && channel
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_')
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(AppConfig::from_json("{}").unwrap(), AppConfig::default());
    }

    #[test]
    fn durations_are_read_as_seconds() {
        let config = AppConfig::from_json(
            r#"{
                "poll_interval_secs": 15,
                "near_term_horizon_secs": 120,
                "join_notification_delay_secs": 0,
                "dispatcher": {"webhook_url": "http://bus.local/events", "timeout_secs": 3}
            }"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.near_term_horizon, Duration::from_secs(120));
        assert_eq!(config.join_notification_delay, Duration::ZERO);
        assert_eq!(config.webhook_url(), Some("http://bus.local/events"));
        assert_eq!(config.dispatcher.timeout, Duration::from_secs(3));
    }

    #[test]
    fn zero_sizes_and_bad_channels_are_replaced() {
        let config = AppConfig::from_json(
            r#"{
                "poll_interval_secs": 0,
                "batch_size": 0,
                "dispatch_concurrency": 0,
                "wake_channel": "wake'; DROP TABLE game_sessions; --",
                "dispatcher": {"webhook_url": "  ", "bearer_token": ""}
            }"#,
        )
        .unwrap();

        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn channel_names_are_restricted() {
        assert!(is_valid_channel("schedule_wake_2"));
        assert!(!is_valid_channel(""));
        assert!(!is_valid_channel("Schedule"));
        assert!(!is_valid_channel(&"a".repeat(64)));
    }

    #[test]
    fn negative_durations_fail_to_parse() {
        assert!(AppConfig::from_json(r#"{"poll_interval_secs": -5}"#).is_err());
    }
}
