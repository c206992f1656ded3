use std::sync::Arc;

use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// 关闭的起因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 调度器自行退出（出错或所有输入已关闭）
    SchedulerExited,
}

/// 进程内的关闭信号
///
/// 第一次 [`trigger`](Shutdown::trigger) 的起因被保留，之后的调用无效果。
/// 调度器和命令监听器通过 [`subscribe`](Shutdown::subscribe) 收到通知，
/// 起因确定之后才订阅的接收器立即收到通知。
#[derive(Clone)]
pub struct Shutdown {
    reason: Arc<watch::Sender<Option<ShutdownReason>>>,
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        let (notify, _) = broadcast::channel(1);
        Self {
            reason: Arc::new(reason),
            notify,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        // 先订阅再检查，避免错过两者之间的触发
        let rx = self.notify.subscribe();
        if self.reason().is_none() {
            return rx;
        }

        let (tx, rx) = broadcast::channel(1);
        if tx.send(()).is_err() {
            debug!("关闭通知没有接收者");
        }
        rx
    }

    /// 记录起因并通知所有订阅者，返回是否是第一次触发
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if !first {
            debug!("关闭已经触发，忽略 {:?}", reason);
            return false;
        }

        info!("触发关闭: {:?}", reason);
        if let Err(e) = self.notify.send(()) {
            debug!("关闭通知没有接收者: {e}");
        }
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.borrow()
    }

    /// 等待关闭被触发，返回起因
    pub async fn triggered(&self) -> ShutdownReason {
        let mut rx = self.reason.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::SchedulerExited),
            // 发送端由 self 持有，不会提前关闭
            Err(_) => ShutdownReason::SchedulerExited,
        };
        reason
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待操作系统的关闭信号
pub async fn os_signal() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
    }
}
