//! # Scheduler API
//!
//! 调度器对外的命令入口：一个基于文本行协议的TCP监听器。
//!
//! ## 协议
//!
//! 每行一条消息，协议版本 `1.2`：
//!
//! - `STATUS` -> `READY`
//! - `INFO` -> `TYPE Scheduler`，`PROTOCOL 1.2`
//! - `DONE` -> `GOODBYE`，随后关闭连接
//! - 已注册的命令 -> 转发给调度器，回复 `OK`；参数不符时回复 `INVALID_ARGUMENT`
//! - 其他 -> `UNKNOWN_COMMAND <name>`
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use scheduler_api::CommandListener;
//! use tokio::sync::{broadcast, mpsc};
//!
//! # async fn example() -> scheduler_core::SchedulerResult<()> {
//! let (sender, _inbox) = mpsc::unbounded_channel();
//! let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//! let listener = CommandListener::bind("127.0.0.1:10000", Vec::new(), sender).await?;
//! listener.run(shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod listener;

pub use listener::{CommandListener, PROTOCOL};
