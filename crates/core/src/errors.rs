use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("协议错误: 期望 {expected}, 实际收到 {got}")]
    Protocol { expected: String, got: String },

    #[error("无效的消息: {0}")]
    InvalidMessage(String),

    #[error("{kind}未找到: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("通知发送失败: {0}")]
    Notification(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        SchedulerError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// 是否是远程服务器不可达类的错误（连接被拒绝、连接中断等）
    pub fn is_network(&self) -> bool {
        matches!(self, SchedulerError::Network(_))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
