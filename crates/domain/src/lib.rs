//! # Scheduler Domain
//!
//! 领域实体、仓储接口，以及调度器的命令和事件词汇表。

pub mod entities;
pub mod messages;
pub mod repositories;

pub use entities::*;
pub use messages::{commands, events, is_event, Command, Event};
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
