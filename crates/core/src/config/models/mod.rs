pub mod app_config;
pub mod observability;
pub mod scheduling;
pub mod storage;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use observability::{NotificationConfig, ObservabilityConfig, SmtpConfig, UserAddress};
pub use scheduling::{ListenerConfig, TasksConfig, TransportConfig};
pub use storage::{DatabaseConfig, PathsConfig, RepositoriesConfig};
