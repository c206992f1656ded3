//! # 数据模型
//!
//! 调度核心共享的基础数据结构：
//!
//! - [`Message`] 统一的消息信封，同时用于命令、事件和与远程服务器的线路协议
//! - [`Alert`] 任务失败时附带的告警
//! - [`JobStatus`] 任务（Job）的生命周期状态

pub mod alert;
pub mod job_status;
pub mod message;

pub use alert::*;
pub use job_status::*;
pub use message::*;
