mod config;
mod connection;
mod error;
mod models;
mod schema;
/// Store implementation.
pub mod store;

pub use config::PgConfig;
pub use error::PgDaoError;
pub use store::PostgresScheduleStore;

use crate::dao::storage::StorageError;

impl From<PgDaoError> for StorageError {
    fn from(err: PgDaoError) -> Self {
        match err {
            PgDaoError::MissingGame { id } => {
                StorageError::conflict(format!("game `{id}` does not exist"))
            }
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
