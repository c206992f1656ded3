use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 命令监听器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:10000".to_string(),
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("无效的监听地址: {}", self.bind_address));
        }
        Ok(())
    }
}

/// 任务执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// 每个任务类型同时运行的最大Job数
    pub max_jobs_per_task: usize,
    /// 没有可用服务器时的重试间隔（秒）
    pub retry_delay_seconds: u64,
    /// 两次服务器状态检查之间的最小间隔（毫秒）
    pub servers_check_min_interval_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_task: 20,
            retry_delay_seconds: 60,
            servers_check_min_interval_ms: 2000,
        }
    }
}

impl TasksConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_jobs_per_task == 0 {
            return Err(anyhow::anyhow!("每个任务的最大Job数必须大于0"));
        }

        if self.retry_delay_seconds == 0 {
            return Err(anyhow::anyhow!("重试间隔必须大于0"));
        }

        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

/// 远程服务器连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_seconds: u64,
    /// 服务器一次声明的数据（报告、结果、日志文件）的最大长度
    pub max_data_size_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            max_data_size_bytes: 256 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        if self.max_data_size_bytes == 0 {
            return Err(anyhow::anyhow!("数据长度上限必须大于0"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn max_data_size(&self) -> usize {
        usize::try_from(self.max_data_size_bytes).unwrap_or(usize::MAX)
    }
}
