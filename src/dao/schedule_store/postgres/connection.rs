use std::time::Duration;

use sqlx::{PgPool, postgres::PgPoolOptions};

use super::{
    config::PgConfig,
    error::{PgDaoError, PgResult},
};
use crate::dao::schedule_store::retry::{Exhausted, with_backoff};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the pool, retrying with backoff until the server answers.
pub async fn establish_pool(config: &PgConfig) -> PgResult<PgPool> {
    with_backoff("PostgreSQL connection", || {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(config.options.clone())
    })
    .await
    .map_err(|Exhausted { attempts, source }| PgDaoError::Connect { attempts, source })
}
