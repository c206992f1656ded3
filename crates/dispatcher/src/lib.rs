//! # Scheduler Dispatcher
//!
//! 调度核心：Job 生命周期、每个任务的 Job 队列与驱动器、服务器认领、
//! 消息路由，以及各个具体任务的协议状态机。
//!
//! 每个活跃的 Job 由一个独立的 tokio 任务驱动，路由器只负责分发消息，从不阻塞在某个 Job 上。

pub mod context;
pub mod job;
pub mod job_queue;
pub mod router;
pub mod runner;
pub mod selection;
pub mod server_claims;
pub mod task;
pub mod tasks;

pub use context::{TaskContext, TaskSettings};
pub use job::{Job, JobBinding};
pub use job_queue::{Enqueue, JobHandle, JobQueue, NewJob};
pub use router::Dispatcher;
pub use runner::{TaskHandle, TaskRunner};
pub use server_claims::ServerClaims;
pub use task::{CommandOutcome, Task};
