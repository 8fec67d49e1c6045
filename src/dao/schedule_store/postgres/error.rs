use thiserror::Error;
use uuid::Uuid;

use crate::dao::models::UnknownValue;

/// Result alias for the PostgreSQL store.
pub type PgResult<T> = std::result::Result<T, PgDaoError>;

/// Failures raised by the PostgreSQL store.
#[derive(Debug, Error)]
pub enum PgDaoError {
    #[error("missing environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    #[error("failed to parse PostgreSQL connection URL")]
    InvalidUrl {
        #[source]
        source: sqlx::Error,
    },
    #[error("PostgreSQL connection failed after {attempts} attempt(s)")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to ensure the scheduling schema")]
    EnsureSchema {
        #[source]
        source: sqlx::Error,
    },
    #[error("PostgreSQL health check failed")]
    HealthPing {
        #[source]
        source: sqlx::Error,
    },
    #[error("`{operation}` failed")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("game `{id}` does not exist")]
    MissingGame { id: Uuid },
    #[error("stored row does not decode")]
    Decode {
        #[from]
        source: UnknownValue,
    },
    #[error("failed to listen on channel `{channel}`")]
    Listen {
        channel: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("listener connection on channel `{channel}` was lost")]
    ListenerLost { channel: String },
}

impl PgDaoError {
    pub(crate) fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| PgDaoError::Query { operation, source }
    }
}
