use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use scheduler_core::{JobStatus, Message, SchedulerResult};
use scheduler_domain::{JobRecord, JobRepository};

/// 队列中一个 Job 的句柄
///
/// Job 本身由驱动器独占，句柄只用于查询状态、取消和唤醒。
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: i64,
    pub command: Message,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// 未终止且未被取消
    pub fn is_live(&self) -> bool {
        !self.status().is_terminal() && !self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 提前结束延迟等待
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 等待 Job 进入终止状态
    pub async fn wait_terminal(&mut self) -> JobStatus {
        loop {
            let status = *self.status.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

/// 新创建的 Job，交给驱动器
pub struct NewJob {
    pub record: JobRecord,
    pub command: Message,
    pub status_tx: watch::Sender<JobStatus>,
    pub cancel: CancellationToken,
    pub wake: Arc<Notify>,
}

/// 入队结果
pub enum Enqueue {
    Created(NewJob),
    /// 已有处理相同命令的 Job
    Existing(i64),
}

/// 一个任务的 Job 队列
///
/// 同一个命令（名称和参数都相同）同时最多只有一个活跃的 Job。
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<Vec<JobHandle>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为命令创建 Job，检查和插入在同一把锁内完成
    pub async fn add_job(&self, command: Message, repository: &dyn JobRepository) -> SchedulerResult<Enqueue> {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|job| !job.status().is_terminal());

        if let Some(existing) = jobs.iter().find(|job| job.command == command && job.is_live()) {
            debug!("命令 {} 已有Job {}，不再重复创建", command, existing.id);
            return Ok(Enqueue::Existing(existing.id));
        }

        let record = repository.create(&command.to_string()).await?;
        let (status_tx, status_rx) = watch::channel(record.status);
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        jobs.push(JobHandle {
            id: record.id,
            command: command.clone(),
            cancel: cancel.clone(),
            wake: wake.clone(),
            status: status_rx,
        });

        Ok(Enqueue::Created(NewJob {
            record,
            command,
            status_tx,
            cancel,
            wake,
        }))
    }

    pub async fn has_job(&self, command: &Message) -> bool {
        self.jobs
            .lock()
            .await
            .iter()
            .any(|job| &job.command == command && job.is_live())
    }

    /// 处理该命令的活跃 Job
    pub async fn get_jobs(&self, command: &Message) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| &job.command == command && job.is_live())
            .cloned()
            .collect()
    }

    pub async fn get_jobs_by_name(&self, name: &str) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| job.command.is(name) && job.is_live())
            .cloned()
            .collect()
    }

    /// 所有活跃的 Job
    pub async fn jobs(&self) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| job.is_live())
            .cloned()
            .collect()
    }

    pub async fn remove(&self, id: i64) {
        self.jobs.lock().await.retain(|job| job.id != id);
    }

    pub async fn len(&self) -> usize {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| job.is_live())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
