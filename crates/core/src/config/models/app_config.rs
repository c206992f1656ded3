use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    observability::{NotificationConfig, ObservabilityConfig},
    scheduling::{ListenerConfig, TasksConfig, TransportConfig},
    storage::{DatabaseConfig, PathsConfig, RepositoriesConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listener: ListenerConfig,
    pub database: DatabaseConfig,
    pub tasks: TasksConfig,
    pub transport: TransportConfig,
    pub paths: PathsConfig,
    pub repositories: RepositoriesConfig,
    pub observability: ObservabilityConfig,
    pub notifications: NotificationConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: SCHEDULER__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("生成默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        // 1. Load config file if provided
        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/mash-scheduler.toml", "mash-scheduler.toml"];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        // 2. Environment variable overrides - highest priority
        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.listener.validate().context("监听器配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.tasks.validate().context("任务配置验证失败")?;
        self.transport.validate().context("连接配置验证失败")?;
        self.paths.validate().context("路径配置验证失败")?;
        self.repositories.validate().context("仓库配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        self.notifications
            .validate()
            .context("通知配置验证失败")?;

        Ok(())
    }
}
