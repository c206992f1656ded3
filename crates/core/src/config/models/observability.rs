use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_log_levels
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.log_format));
        }

        if self.metrics_enabled
            && self
                .metrics_bind_address
                .parse::<std::net::SocketAddr>()
                .is_err()
        {
            return Err(anyhow::anyhow!(
                "无效的指标监听地址: {}",
                self.metrics_bind_address
            ));
        }

        Ok(())
    }
}

/// 通知配置
///
/// 没有 `smtp` 时通知只写入日志。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// 管理员邮箱
    pub admins: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpConfig>,
    /// 作者的邮箱，未列出的作者收不到错误报告邮件
    pub users: Vec<UserAddress>,
}

impl NotificationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let Some(smtp) = &self.smtp else {
            return Ok(());
        };
        if smtp.host.trim().is_empty() {
            return Err(anyhow::anyhow!("SMTP服务器地址不能为空"));
        }
        if smtp.from.trim().is_empty() {
            return Err(anyhow::anyhow!("发件人地址不能为空"));
        }
        if self.admins.is_empty() {
            return Err(anyhow::anyhow!("启用SMTP时至少需要一个管理员邮箱"));
        }
        Ok(())
    }

    /// 作者的邮箱（作者名不区分大小写）
    pub fn user_email(&self, user: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(user))
            .map(|entry| entry.email.as_str())
    }
}

/// SMTP 服务器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    /// 默认 587；465 使用隐式 TLS
    #[serde(default)]
    pub port: Option<u16>,
    /// 关闭后使用明文连接
    #[serde(default = "default_smtp_tls")]
    pub tls: bool,
    pub from: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_smtp_tls() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAddress {
    pub name: String,
    pub email: String,
}
