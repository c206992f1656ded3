//! 配置管理
//!
//! 配置按以下顺序合并，后者覆盖前者：
//!
//! 1. 内置默认值
//! 2. TOML 配置文件
//! 3. 环境变量（前缀 `SCHEDULER__`，层级分隔符 `__`，例如 `SCHEDULER__TASKS__RETRY_DELAY_SECONDS`）
//!
//! 加载后会调用 [`AppConfig::validate`] 检查配置的有效性。

pub mod models;

pub use models::*;
