use serde::{Deserialize, Serialize};

/// 任务失败时附带的告警
///
/// `message` 是简短描述，`details` 是完整诊断信息（例如收集到的服务器日志）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    pub details: Option<String>,
}

impl Alert {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// 远程服务器返回了非预期的响应
    pub fn unexpected_response(expected: &str, got: &impl std::fmt::Display) -> Self {
        Alert::new("Unknown response").with_details(format!("Expected: {expected}, got: {got}"))
    }

    /// 在已有详情后追加内容
    pub fn append_details(&mut self, extra: &str) {
        match self.details.as_mut() {
            Some(details) => {
                details.push_str("\n\n");
                details.push_str(extra);
            }
            None => self.details = Some(extra.to_string()),
        }
    }
}
