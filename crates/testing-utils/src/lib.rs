//! # Scheduler Testing Utils
//!
//! 测试共用的工具：按脚本应答的远程服务器、记录通知的通知器、实体构建器，
//! 以及准备好临时目录和内存存储的测试环境。
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
