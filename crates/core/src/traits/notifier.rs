use async_trait::async_trait;

use crate::SchedulerResult;

/// 一条通知的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 邮件已交给邮件服务器
    Sent,
    /// 没有可用的投递方式，只写入了日志
    Logged,
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// 通知服务接口
///
/// 失败的任务需要通知管理员；检查出错的启发式需要通知作者。
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 通知管理员
    async fn notify_admins(&self, subject: &str, body: &str) -> SchedulerResult<Delivery>;

    /// 通知某个用户
    async fn notify_user(&self, user: &str, subject: &str, body: &str) -> SchedulerResult<Delivery>;
}
