//! SQLite adapters for the persistence gateway.

pub mod connection;
pub mod migrations;
pub mod task_store;

pub use connection::{open_memory_pool, open_pool, StoreOpenError};
pub use migrations::{apply_pending, schema_version, SchemaError};
pub use task_store::SqliteTaskStore;
