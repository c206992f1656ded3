use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scheduler_core::{Alert, Channel, JobStatus, Message, SchedulerError, SchedulerResult};
use scheduler_domain::{ExperimentStatus, JobRecord, Server};
use scheduler_infrastructure::{fetch_server_logs, metrics};

use crate::context::TaskContext;

/// Job日志缓冲区上限，超出时丢弃最早的内容
const MAX_LOG_SIZE: usize = 200 * 1024;
/// 告警通知中每个日志文件保留的最大长度
const MAX_ATTACHED_LOG_SIZE: usize = 10 * 1024;

/// 进入 Running 状态时绑定到 Job 的资源
#[derive(Default)]
pub struct JobBinding {
    server: Option<(Server, Box<dyn Channel>)>,
    heuristic_version_id: Option<i64>,
    experiment_id: Option<i64>,
}

impl JobBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定已认领的服务器及其连接
    pub fn with_server(mut self, server: Server, channel: Box<dyn Channel>) -> Self {
        self.server = Some((server, channel));
        self
    }

    pub fn with_heuristic_version(mut self, heuristic_version_id: i64) -> Self {
        self.heuristic_version_id = Some(heuristic_version_id);
        self
    }

    pub fn with_experiment(mut self, experiment_id: i64) -> Self {
        self.experiment_id = Some(experiment_id);
        self
    }
}

/// 一个进行中的异步操作
///
/// `state` 保存任务特有的工作数据以及下一步要执行的步骤。除 Running 之外的每个状态转换都会
/// 发送 `DONE` 并关闭连接（只关闭一次）、释放服务器认领、更新关联实验的状态。
pub struct Job<S> {
    record: JobRecord,
    command: Message,
    status_tx: watch::Sender<JobStatus>,
    delay: Option<Duration>,
    channel: Option<Box<dyn Channel>>,
    server: Option<Server>,
    alert: Option<Alert>,
    mail_sent: bool,
    log: String,
    cancel: CancellationToken,
    ctx: TaskContext,
    task_name: &'static str,
    started: Instant,
    pub state: S,
}

impl<S: Default> Job<S> {
    pub(crate) fn new(
        record: JobRecord,
        command: Message,
        status_tx: watch::Sender<JobStatus>,
        cancel: CancellationToken,
        ctx: TaskContext,
        task_name: &'static str,
    ) -> Self {
        Self {
            record,
            command,
            status_tx,
            delay: None,
            channel: None,
            server: None,
            alert: None,
            mail_sent: false,
            log: String::new(),
            cancel,
            ctx,
            task_name,
            started: Instant::now(),
            state: S::default(),
        }
    }
}

impl<S> Job<S> {
    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn command(&self) -> &Message {
        &self.command
    }

    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn alert(&self) -> Option<&Alert> {
        self.alert.as_ref()
    }

    pub fn experiment_id(&self) -> Option<i64> {
        self.record.experiment_id
    }

    pub fn heuristic_version_id(&self) -> Option<i64> {
        self.record.heuristic_version_id
    }

    pub fn logs_folder(&self) -> Option<&str> {
        self.record.logs_folder.as_deref()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn ctx(&self) -> &TaskContext {
        &self.ctx
    }

    /// 已经通知过相关人员，失败时不再发送告警通知
    pub fn set_mail_sent(&mut self, sent: bool) {
        self.mail_sent = sent;
    }

    /// 认领服务器时使用的所有者标识
    pub fn key(&self) -> String {
        format!("{}#{}", self.task_name, self.record.id)
    }

    pub fn log_text(&self) -> &str {
        &self.log
    }

    /// 记录一条Job日志
    pub fn log(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        debug!("{}", line);

        self.log.push_str(line);
        self.log.push('\n');

        if self.log.len() > MAX_LOG_SIZE {
            let excess = self.log.len() - MAX_LOG_SIZE;
            let cut = (excess..=self.log.len())
                .find(|i| self.log.is_char_boundary(*i))
                .unwrap_or(self.log.len());
            self.log.drain(..cut);
        }
    }

    fn channel(&mut self) -> SchedulerResult<&mut Box<dyn Channel>> {
        let id = self.record.id;
        self.channel
            .as_mut()
            .ok_or_else(move || SchedulerError::Internal(format!("Job {id} 没有打开的连接")))
    }

    pub async fn send(&mut self, message: Message) -> SchedulerResult<()> {
        debug!("> {}", message);
        self.channel()?.send_message(&message).await
    }

    pub async fn receive(&mut self) -> SchedulerResult<Message> {
        let response = self.channel()?.wait_response().await?;
        debug!("< {}", response);
        Ok(response)
    }

    /// 发送一条消息并等待响应
    pub async fn request(&mut self, message: Message) -> SchedulerResult<Message> {
        self.send(message).await?;
        self.receive().await
    }

    pub async fn send_data(&mut self, data: &[u8]) -> SchedulerResult<()> {
        self.channel()?.send_data(data).await
    }

    pub async fn receive_data(&mut self, size: usize) -> SchedulerResult<Vec<u8>> {
        self.channel()?.wait_data(size).await
    }

    /// 取回远程服务器的日志，保存到本Job的日志目录
    ///
    /// 失败只记录警告，不影响Job的状态。
    pub async fn capture_server_logs(&mut self, filter: Option<&[&str]>) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        let files = match fetch_server_logs(channel.as_mut(), filter).await {
            Ok(files) => files,
            Err(e) => {
                warn!("获取服务器日志失败: {}", e);
                return;
            }
        };

        let store = self.ctx.storage.server_logs.clone();
        let folder = self
            .record
            .logs_folder
            .get_or_insert_with(|| store.new_folder())
            .clone();

        for (name, content) in files {
            if let Err(e) = store.save(&folder, &name, &content).await {
                warn!("保存服务器日志 {} 失败: {}", name, e);
            }
        }

        if let Err(e) = self.persist().await {
            warn!("保存Job {} 的日志目录失败: {}", self.record.id, e);
        }
    }

    /// 服务器返回了非预期的响应：收集日志并标记失败
    pub async fn fail_unexpected(&mut self, expected: &str, response: &Message) -> SchedulerResult<()> {
        self.capture_server_logs(None).await;
        self.mark_as_failed(Alert::unexpected_response(expected, response))
            .await
    }

    pub async fn mark_as_running(&mut self, binding: JobBinding) -> SchedulerResult<()> {
        let JobBinding {
            server,
            heuristic_version_id,
            experiment_id,
        } = binding;

        if let Some((server, channel)) = server {
            self.record.server_id = Some(server.id);
            self.server = Some(server);
            self.channel = Some(channel);
        }
        if heuristic_version_id.is_some() {
            self.record.heuristic_version_id = heuristic_version_id;
        }
        if experiment_id.is_some() {
            self.record.experiment_id = experiment_id;
        }

        if self.record.status != JobStatus::Running {
            self.log(format!("Executing command: {}", self.command));
        }
        self.delay = None;
        self.set_status(JobStatus::Running);
        self.persist().await?;
        self.update_experiment(ExperimentStatus::Running).await
    }

    pub async fn mark_as_scheduled(&mut self) -> SchedulerResult<()> {
        self.delay = None;
        self.log.clear();
        self.finish(JobStatus::Scheduled, ExperimentStatus::Scheduled)
            .await
    }

    pub async fn mark_as_done(&mut self, experiment_status: ExperimentStatus) -> SchedulerResult<()> {
        info!("Job {} 完成: {}", self.record.id, self.command);
        self.finish(JobStatus::Done, experiment_status).await
    }

    pub async fn mark_as_failed(&mut self, alert: Alert) -> SchedulerResult<()> {
        self.log(format!("ERROR - {}", alert.message));
        if let Some(details) = alert.details.clone() {
            self.log(details);
        }
        warn!("Job {} 失败: {}", self.record.id, alert.message);

        // 告警先落盘，失败状态不会在没有告警的情况下出现
        self.ctx
            .repositories
            .jobs
            .save_alert(self.record.id, &alert)
            .await?;
        self.finish(JobStatus::Failed, ExperimentStatus::Failed)
            .await?;

        if let Some(folder) = self.record.logs_folder.clone() {
            if let Err(e) = self
                .ctx
                .storage
                .server_logs
                .save(&folder, "Job.log", self.log.as_bytes())
                .await
            {
                warn!("保存Job日志失败: {}", e);
            }
        }

        self.alert = Some(alert);
        Ok(())
    }

    /// 取消不是错误，关联的实验不会被视为完成
    pub async fn mark_as_cancelled(&mut self) -> SchedulerResult<()> {
        info!("Job {} 已取消: {}", self.record.id, self.command);
        self.finish(JobStatus::Cancelled, ExperimentStatus::Failed)
            .await
    }

    pub async fn mark_as_delayed(&mut self, delay: Duration) -> SchedulerResult<()> {
        self.log(format!("Job delayed for {} seconds", delay.as_secs()));
        self.finish(JobStatus::Delayed, ExperimentStatus::Scheduled)
            .await?;
        self.delay = Some(delay);
        Ok(())
    }

    /// 没有可用的服务器，按配置的重试间隔延后
    pub async fn retry_later(&mut self) -> SchedulerResult<()> {
        let delay = self.ctx.settings.retry_delay;
        self.mark_as_delayed(delay).await
    }

    async fn finish(&mut self, status: JobStatus, experiment_status: ExperimentStatus) -> SchedulerResult<()> {
        self.close_channel().await;
        self.release_server().await;
        self.set_status(status);
        self.persist().await?;
        self.update_experiment(experiment_status).await
    }

    /// 放弃处理：关闭连接、释放服务器，持久化的状态保持不变
    ///
    /// 记录仍为未完成状态，下次启动时重新执行。
    pub async fn abandon(&mut self) {
        warn!("放弃Job {}，保留状态 {:?}", self.record.id, self.record.status);
        self.close_channel().await;
        self.release_server().await;
    }

    async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.send_message(&Message::named("DONE")).await {
                debug!("向 {} 发送 DONE 失败: {}", channel.peer(), e);
            }
            channel.close().await;
        }
    }

    async fn release_server(&mut self) {
        if let Some(server) = self.server.take() {
            let owner = self.key();
            self.ctx.claims.release(server.id, &owner).await;
        }
        self.record.server_id = None;
    }

    fn set_status(&mut self, status: JobStatus) {
        self.record.status = status;
        self.status_tx.send_replace(status);
    }

    async fn persist(&mut self) -> SchedulerResult<()> {
        self.record.updated_at = Utc::now();
        self.ctx.repositories.jobs.update(&self.record).await
    }

    async fn update_experiment(&mut self, status: ExperimentStatus) -> SchedulerResult<()> {
        let Some(id) = self.record.experiment_id else {
            return Ok(());
        };

        let experiments = &self.ctx.repositories.experiments;
        if let Some(mut experiment) = experiments.find_experiment(id).await? {
            experiment.status = status;
            if status != ExperimentStatus::Running {
                experiment.notifications.clear();
            }
            experiments.update_experiment(&experiment).await?;
        }
        Ok(())
    }

    /// 失败且尚未通知时，把告警连同日志发送给管理员
    pub(crate) async fn notify_failure(&mut self) {
        if self.mail_sent {
            return;
        }
        let Some(alert) = self.alert.clone() else {
            return;
        };

        let subject = format!("[MASH ALERT] {}", alert.message);
        let mut body = String::new();
        if let Some(details) = &alert.details {
            body.push_str(details);
            body.push_str("\n\n");
        }
        body.push_str(&format!("Job ID: {}\nCommand: {}\n", self.record.id, self.command));
        if let Some(id) = self.record.heuristic_version_id {
            body.push_str(&format!("Heuristic version: {id}\n"));
        }
        if let Some(id) = self.record.experiment_id {
            body.push_str(&format!("Experiment: {id}\n"));
        }

        match &self.record.logs_folder {
            Some(folder) => match self.ctx.storage.server_logs.read_all(folder).await {
                Ok(files) => {
                    for (name, content) in files {
                        append_log_file(&mut body, &name, &content);
                    }
                }
                Err(e) => warn!("读取Job {} 的日志失败: {}", self.record.id, e),
            },
            None if !self.log.is_empty() => append_log_file(&mut body, "Job.log", self.log.as_bytes()),
            None => {}
        }

        match self.ctx.notifier.notify_admins(&subject, &body).await {
            Ok(delivery) => self.mail_sent = delivery.is_sent(),
            Err(e) => warn!("发送告警通知失败: {}", e),
        }
    }

    pub(crate) fn record_metrics(&self) {
        metrics::record_job_finished(self.task_name, self.record.status.as_str(), self.started.elapsed());
    }
}

fn append_log_file(body: &mut String, name: &str, content: &[u8]) {
    body.push_str("\n\n");
    body.push_str(&"-".repeat(80));
    body.push('\n');
    body.push_str(name);

    if content.len() > MAX_ATTACHED_LOG_SIZE {
        body.push_str(" (truncated)\n\n...\n");
        body.push_str(&String::from_utf8_lossy(
            &content[content.len() - MAX_ATTACHED_LOG_SIZE..],
        ));
    } else {
        body.push_str("\n\n");
        body.push_str(&String::from_utf8_lossy(content));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attached_log_is_truncated() {
        let mut body = String::new();
        let content = vec![b'x'; MAX_ATTACHED_LOG_SIZE + 100];
        append_log_file(&mut body, "Predictor.log", &content);

        assert!(body.contains("Predictor.log (truncated)"));
        assert_eq!(body.matches('x').count(), MAX_ATTACHED_LOG_SIZE);

        let mut body = String::new();
        append_log_file(&mut body, "Job.log", b"short");
        assert!(body.ends_with("Job.log\n\nshort"));
    }
}
