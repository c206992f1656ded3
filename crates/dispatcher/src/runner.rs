use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use scheduler_core::{Alert, JobStatus, Message, MessageSignature, SchedulerError, SchedulerResult};

use crate::context::TaskContext;
use crate::job::Job;
use crate::job_queue::{Enqueue, JobHandle, JobQueue, NewJob};
use crate::task::{CommandOutcome, Task};

/// 路由器看到的任务接口
#[async_trait]
pub trait TaskHandle: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_commands(&self) -> &'static [MessageSignature];

    fn supported_events(&self) -> &'static [MessageSignature];

    /// 调用任务的启动钩子，为返回的命令创建 Job
    async fn start(&self) -> SchedulerResult<()>;

    async fn handle_command(&self, command: Message);

    async fn handle_event(&self, event: Message);

    async fn jobs(&self) -> Vec<JobHandle>;

    /// 停止所有驱动器，正在运行的 Job 回到 Scheduled 以便下次启动时恢复
    async fn stop(&self);
}

struct RunnerInner<T: Task> {
    task: T,
    queue: JobQueue,
    ctx: TaskContext,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

/// 驱动一个任务的所有 Job，每个 Job 一个 tokio 任务
pub struct TaskRunner<T: Task> {
    inner: Arc<RunnerInner<T>>,
}

impl<T: Task> Clone for TaskRunner<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Task> TaskRunner<T> {
    pub fn new(task: T, ctx: TaskContext) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.settings.max_jobs_per_task));
        Self {
            inner: Arc::new(RunnerInner {
                task,
                queue: JobQueue::new(),
                ctx,
                permits,
                shutdown: CancellationToken::new(),
                drivers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn task(&self) -> &T {
        &self.inner.task
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// 为命令创建 Job 并启动驱动器；已有相同命令的 Job 时返回 None
    pub async fn enqueue(&self, command: Message) -> SchedulerResult<Option<i64>> {
        if self.inner.shutdown.is_cancelled() {
            warn!("任务 {} 已停止，忽略命令: {}", self.inner.task.name(), command);
            return Ok(None);
        }

        let repository = self.inner.ctx.repositories.jobs.clone();
        match self.inner.queue.add_job(command, repository.as_ref()).await? {
            Enqueue::Created(new_job) => {
                let id = new_job.record.id;
                info!(
                    "任务 {} 创建Job {}: {}",
                    self.inner.task.name(),
                    id,
                    new_job.command
                );
                self.spawn(new_job).await;
                Ok(Some(id))
            }
            Enqueue::Existing(_) => Ok(None),
        }
    }

    async fn spawn(&self, new_job: NewJob) {
        let handle = tokio::spawn(drive(self.inner.clone(), new_job));
        let mut drivers = self.inner.drivers.lock().await;
        drivers.retain(|driver| !driver.is_finished());
        drivers.push(handle);
    }

    async fn enqueue_all(&self, commands: Vec<Message>) -> SchedulerResult<()> {
        for command in commands {
            self.enqueue(command).await?;
        }
        Ok(())
    }

    async fn prepare_command(&self, command: &Message) -> SchedulerResult<()> {
        let outcome = self
            .inner
            .task
            .on_command_received(command, &self.inner.queue, &self.inner.ctx)
            .await?;

        match outcome {
            CommandOutcome::Enqueue => self.enqueue(command.clone()).await.map(|_| ()),
            CommandOutcome::Handled(commands) => self.enqueue_all(commands).await,
        }
    }

    async fn report_preparation_error(&self, message: &Message, err: SchedulerError) {
        error!(
            "任务 {} 准备Job时发生异常, 消息: {}, 错误: {}",
            self.inner.task.name(),
            message,
            err
        );

        let subject = "[MASH ALERT] Exception during the preparation of a job";
        let body = format!("Message: {message}\n\n{err}");
        if let Err(e) = self.inner.ctx.notifier.notify_admins(subject, &body).await {
            warn!("发送告警通知失败: {}", e);
        }
    }
}

#[async_trait]
impl<T: Task> TaskHandle for TaskRunner<T> {
    fn name(&self) -> &'static str {
        self.inner.task.name()
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        self.inner.task.supported_commands()
    }

    fn supported_events(&self) -> &'static [MessageSignature] {
        self.inner.task.supported_events()
    }

    async fn start(&self) -> SchedulerResult<()> {
        info!("启动任务 {}", self.inner.task.name());
        let commands = self.inner.task.on_startup(&self.inner.ctx).await?;
        self.enqueue_all(commands).await
    }

    async fn handle_command(&self, command: Message) {
        if let Err(e) = self.prepare_command(&command).await {
            self.report_preparation_error(&command, e).await;
        }
    }

    async fn handle_event(&self, event: Message) {
        let result = match self
            .inner
            .task
            .on_event_received(&event, &self.inner.queue, &self.inner.ctx)
            .await
        {
            Ok(commands) => self.enqueue_all(commands).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.report_preparation_error(&event, e).await;
        }
    }

    async fn jobs(&self) -> Vec<JobHandle> {
        self.inner.queue.jobs().await
    }

    async fn stop(&self) {
        info!("停止任务 {}", self.inner.task.name());
        self.inner.shutdown.cancel();

        let drivers = std::mem::take(&mut *self.inner.drivers.lock().await);
        for driver in drivers {
            if let Err(e) = driver.await {
                warn!("Job驱动器异常退出: {}", e);
            }
        }
    }
}

enum Wait {
    Ready(OwnedSemaphorePermit),
    Cancelled,
    Shutdown,
}

enum Wake {
    Retry,
    Cancelled,
    Shutdown,
}

async fn drive<T: Task>(inner: Arc<RunnerInner<T>>, new_job: NewJob) {
    let NewJob {
        record,
        command,
        status_tx,
        cancel,
        wake,
    } = new_job;

    let span = info_span!(
        "job",
        task = inner.task.name(),
        job_id = record.id,
        command = %command
    );

    let mut job = Job::<T::State>::new(
        record,
        command,
        status_tx,
        cancel.clone(),
        inner.ctx.clone(),
        inner.task.name(),
    );

    run_job(&inner, &mut job, &cancel, &wake)
        .instrument(span)
        .await;

    inner.queue.remove(job.id()).await;
}

async fn run_job<T: Task>(
    inner: &RunnerInner<T>,
    job: &mut Job<T::State>,
    cancel: &CancellationToken,
    wake: &Notify,
) {
    'job: loop {
        let wait = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wait::Cancelled,
            _ = inner.shutdown.cancelled() => Wait::Shutdown,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => Wait::Ready(permit),
                Err(_) => Wait::Shutdown,
            },
        };

        let permit = match wait {
            Wait::Ready(permit) => permit,
            Wait::Cancelled => {
                cancel_job(inner, job).await;
                break 'job;
            }
            Wait::Shutdown => break 'job,
        };

        job.state = T::State::default();

        // 取消和关闭只在两个步骤之间生效，进行中的步骤总是执行完
        while matches!(job.status(), JobStatus::Scheduled | JobStatus::Running) {
            if cancel.is_cancelled() {
                cancel_job(inner, job).await;
                break 'job;
            }
            if inner.shutdown.is_cancelled() {
                if job.status() == JobStatus::Running {
                    if let Err(e) = job.mark_as_scheduled().await {
                        error!("Job {} 无法回到Scheduled状态: {}", job.id(), e);
                    }
                }
                break 'job;
            }

            if let Err(e) = inner.task.step(job).await {
                if !fail_with_exception(inner, job, e).await {
                    job.abandon().await;
                    break 'job;
                }
            }
        }
        drop(permit);

        if job.status() != JobStatus::Delayed {
            break 'job;
        }

        let delay = job.delay().unwrap_or(inner.ctx.settings.retry_delay);
        let woken = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = inner.shutdown.cancelled() => Wake::Shutdown,
            _ = wake.notified() => Wake::Retry,
            _ = tokio::time::sleep(delay) => Wake::Retry,
        };

        match woken {
            Wake::Retry => {
                if let Err(e) = job.mark_as_scheduled().await {
                    error!("Job {} 无法重新调度: {}", job.id(), e);
                    break 'job;
                }
            }
            Wake::Cancelled => {
                cancel_job(inner, job).await;
                break 'job;
            }
            Wake::Shutdown => break 'job,
        }
    }

    if job.status() == JobStatus::Failed {
        job.notify_failure().await;
    }
    job.record_metrics();
}

async fn cancel_job<T: Task>(inner: &RunnerInner<T>, job: &mut Job<T::State>) {
    if let Err(e) = job.mark_as_cancelled().await {
        error!("取消Job {} 失败: {}", job.id(), e);
    }
    if let Err(e) = inner.task.on_cancelled(job).await {
        error!("Job {} 取消后的处理失败: {}", job.id(), e);
    }
}

/// 步骤返回错误：Job 尚未终止时标记为失败并通知管理员
///
/// 无法记录失败时返回 `false`，Job 不能继续执行。
async fn fail_with_exception<T: Task>(inner: &RunnerInner<T>, job: &mut Job<T::State>, err: SchedulerError) -> bool {
    error!("Job {} 处理过程中发生异常: {}", job.id(), err);

    if job.status().is_terminal() {
        return true;
    }

    let details = err.to_string();
    let alert = Alert::new("Exception during the processing of the job").with_details(details.clone());
    if let Err(e) = job.mark_as_failed(alert).await {
        error!("无法将Job {} 标记为失败: {}", job.id(), e);
        return false;
    }

    let subject = "[MASH ALERT] Exception during the processing of a job";
    let body = format!("Job ID: {}\nCommand: {}\n\n{}", job.id(), job.command(), details);
    match inner.ctx.notifier.notify_admins(subject, &body).await {
        Ok(delivery) => job.set_mail_sent(delivery.is_sent()),
        Err(e) => warn!("发送告警通知失败: {}", e),
    }
    true
}
