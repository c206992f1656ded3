//! # Scheduler Infrastructure
//!
//! 传输层、文件存储、领域存储和Job持久化的具体实现。

pub mod database;
pub mod file_lock;
pub mod in_memory_store;
pub mod metrics;
pub mod notifier;
pub mod storage;
pub mod transport;

pub use database::{DatabaseManager, SqliteJobRepository};
pub use file_lock::FileLock;
pub use in_memory_store::InMemoryStore;
pub use notifier::{build_notifier, SmtpNotifier, TracingNotifier};
pub use storage::FileStorage;
pub use transport::{fetch_server_logs, TcpConnector};
