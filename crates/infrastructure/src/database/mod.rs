//! Job与告警的持久化（SQLite）

pub mod sqlite;

pub use sqlite::{DatabaseManager, SqliteJobRepository};
