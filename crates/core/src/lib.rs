//! # Scheduler Core
//!
//! MASH 调度系统的基础库：统一错误类型、消息模型、传输与通知接口，以及配置模型。
//! 其余 crate 只通过这里定义的类型相互协作。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use models::{Alert, JobStatus, Message, MessageSignature, ParamKind, Value};
pub use traits::{Channel, Connector, Delivery, Notifier};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
