mod config;
mod connection;
mod error;
mod models;
/// Store implementation.
pub mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoScheduleStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::MissingGame { id } => {
                StorageError::conflict(format!("game `{id}` does not exist"))
            }
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
