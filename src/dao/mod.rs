/// Database model definitions.
pub mod models;
/// Persistence of scheduled events and the games they belong to.
pub mod schedule_store;
/// Storage abstraction layer for database operations.
pub mod storage;
