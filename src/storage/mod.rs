//! Storage layer for workflow state.

pub mod models;
pub mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
