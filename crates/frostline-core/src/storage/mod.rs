pub mod models;
pub mod queries;
pub mod sqlite;

pub use queries::Snapshot;
pub use sqlite::Database;
