use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use scheduler_core::{AppConfig, Connector, Message, Notifier};
use scheduler_domain::{Command, Event, Repositories};
use scheduler_infrastructure::FileStorage;

use crate::server_claims::ServerClaims;

/// 任务运行参数
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub max_jobs_per_task: usize,
    /// 没有可用服务器时的重试间隔
    pub retry_delay: Duration,
    /// 上传区仓库地址，检查启发式时告诉编译服务器
    pub upload_url: String,
    /// 已验证启发式仓库地址
    pub heuristics_url: String,
    pub servers_check_min_interval: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_jobs_per_task: 20,
            retry_delay: Duration::from_secs(60),
            upload_url: "file:///var/mash/repositories/upload".to_string(),
            heuristics_url: "file:///var/mash/repositories/heuristics".to_string(),
            servers_check_min_interval: Duration::from_secs(2),
        }
    }
}

impl TaskSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_jobs_per_task: config.tasks.max_jobs_per_task,
            retry_delay: config.tasks.retry_delay(),
            upload_url: config.repositories.upload_url.clone(),
            heuristics_url: config.repositories.heuristics_url.clone(),
            servers_check_min_interval: Duration::from_millis(config.tasks.servers_check_min_interval_ms),
        }
    }
}

/// 任务与 Job 共享的运行环境
#[derive(Clone)]
pub struct TaskContext {
    pub repositories: Repositories,
    pub connector: Arc<dyn Connector>,
    pub notifier: Arc<dyn Notifier>,
    pub claims: ServerClaims,
    pub storage: Arc<FileStorage>,
    pub settings: Arc<TaskSettings>,
    outbox: mpsc::UnboundedSender<Message>,
}

impl TaskContext {
    pub fn new(
        repositories: Repositories,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
        storage: Arc<FileStorage>,
        settings: TaskSettings,
        outbox: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            repositories,
            connector,
            notifier,
            claims: ServerClaims::new(),
            storage,
            settings: Arc::new(settings),
            outbox,
        }
    }

    /// 路由器收件箱的发送端
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbox.clone()
    }

    /// 把消息发回路由器
    pub fn send(&self, message: Message) {
        if self.outbox.send(message.clone()).is_err() {
            warn!("路由器已关闭，丢弃消息: {}", message);
        }
    }

    pub fn emit(&self, event: Event) {
        self.send(event.to_message());
    }

    pub fn submit(&self, command: Command) {
        self.send(command.to_message());
    }
}
