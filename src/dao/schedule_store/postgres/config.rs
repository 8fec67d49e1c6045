use std::time::Duration;

use sqlx::postgres::PgConnectOptions;

use super::error::{PgDaoError, PgResult};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_WAKE_CHANNEL: &str = "schedule_wake";
const DEFAULT_NEAR_TERM_HORIZON: Duration = Duration::from_secs(600);

/// Connection settings for the PostgreSQL store.
#[derive(Clone)]
pub struct PgConfig {
    /// Parsed connection options.
    pub options: PgConnectOptions,
    /// Pool size.
    pub max_connections: u32,
    /// Channel the wake trigger notifies on.
    pub wake_channel: String,
    /// Only rows due within this window produce a notification.
    pub near_term_horizon: Duration,
}

impl PgConfig {
    /// Settings from a connection URL, the rest from defaults.
    pub fn from_url(url: &str) -> PgResult<Self> {
        let options = url
            .parse::<PgConnectOptions>()
            .map_err(|source| PgDaoError::InvalidUrl { source })?;

        Ok(Self {
            options,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            wake_channel: DEFAULT_WAKE_CHANNEL.to_owned(),
            near_term_horizon: DEFAULT_NEAR_TERM_HORIZON,
        })
    }

    /// Settings from the environment.
    pub fn from_env() -> PgResult<Self> {
        let url = std::env::var("DATABASE_URL").map_err(|_| PgDaoError::MissingEnvVar {
            var: "DATABASE_URL",
        })?;
        let mut config = Self::from_url(&url)?;
        if let Some(max) = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|raw| raw.parse::<u32>().ok())
            .filter(|max| *max > 0)
        {
            config.max_connections = max;
        }
        Ok(config)
    }

    /// Override the wake channel settings baked into the trigger.
    pub fn with_wake(mut self, channel: impl Into<String>, horizon: Duration) -> Self {
        self.wake_channel = channel.into();
        self.near_term_horizon = horizon;
        self
    }
}
