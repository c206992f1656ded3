use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use scheduler_core::{JobStatus, Message, MessageSignature, SchedulerError, SchedulerResult};
use scheduler_domain::{events, is_event};
use scheduler_infrastructure::metrics;

use crate::context::TaskContext;
use crate::runner::{TaskHandle, TaskRunner};
use crate::task::Task;
use crate::tasks;

/// 重启时需要恢复的Job状态
const RESUMABLE: &[JobStatus] = &[JobStatus::Scheduled, JobStatus::Delayed, JobStatus::Running];

struct EventRoute {
    signature: MessageSignature,
    subscribers: Vec<Arc<dyn TaskHandle>>,
}

/// 消息路由器
///
/// 每个命令名称只属于一个任务；事件分发给所有订阅它的任务。
/// 外部命令、任务之间的事件和重启时恢复的命令都经过同一个收件箱。
pub struct Dispatcher {
    ctx: TaskContext,
    inbox: mpsc::UnboundedReceiver<Message>,
    runners: Vec<Arc<dyn TaskHandle>>,
    commands: HashMap<&'static str, (MessageSignature, Arc<dyn TaskHandle>)>,
    events: HashMap<&'static str, EventRoute>,
}

impl Dispatcher {
    /// `inbox` 是 `ctx` 中发送端对应的接收端
    pub fn new(ctx: TaskContext, inbox: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            ctx,
            inbox,
            runners: Vec::new(),
            commands: HashMap::new(),
            events: HashMap::new(),
        }
    }

    /// 注册一个任务，返回它的驱动器
    pub fn register<T: Task>(&mut self, task: T) -> SchedulerResult<TaskRunner<T>> {
        let runner = TaskRunner::new(task, self.ctx.clone());
        let handle: Arc<dyn TaskHandle> = Arc::new(runner.clone());

        for signature in handle.supported_commands() {
            if let Some((_, owner)) = self.commands.get(signature.name) {
                return Err(SchedulerError::Configuration(format!(
                    "命令 {} 已经由任务 {} 处理，无法再注册到 {}",
                    signature.name,
                    owner.name(),
                    handle.name()
                )));
            }
        }

        for signature in handle.supported_commands() {
            self.commands
                .insert(signature.name, (*signature, handle.clone()));
        }
        for signature in handle.supported_events() {
            self.events
                .entry(signature.name)
                .or_insert_with(|| EventRoute {
                    signature: *signature,
                    subscribers: Vec::new(),
                })
                .subscribers
                .push(handle.clone());
        }

        info!("注册任务 {}", handle.name());
        self.runners.push(handle);
        Ok(runner)
    }

    /// 注册全部内置任务
    pub fn register_default_tasks(&mut self) -> SchedulerResult<()> {
        self.register(tasks::ExperimentScheduler::new())?;
        self.register(tasks::ExperimentLauncher::new())?;
        self.register(tasks::HeuristicChecker::new())?;
        self.register(tasks::HeuristicDebugger::new())?;
        self.register(tasks::HeuristicRanker::new())?;
        self.register(tasks::HeuristicsClusterer::new())?;
        self.register(tasks::ServerIdentificator::new())?;
        self.register(tasks::ServersChecker::new())?;
        Ok(())
    }

    /// 收件箱的发送端，监听器用它提交外部命令
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.ctx.sender()
    }

    /// 已注册的命令签名
    pub fn command_signatures(&self) -> Vec<MessageSignature> {
        self.commands.values().map(|(signature, _)| *signature).collect()
    }

    pub fn runners(&self) -> &[Arc<dyn TaskHandle>] {
        &self.runners
    }

    /// 恢复上次未完成的Job，然后调用每个任务的启动钩子
    pub async fn start(&self) -> SchedulerResult<()> {
        let jobs = self.ctx.repositories.jobs.clone();
        let pending = jobs.find_by_statuses(RESUMABLE).await?;
        if !pending.is_empty() {
            info!("恢复 {} 个未完成的Job", pending.len());
        }

        for record in pending {
            match Message::parse(&record.command) {
                Ok(command) => self.route(command).await,
                Err(e) => warn!("无法解析Job {} 的命令 '{}': {}", record.id, record.command, e),
            }
            jobs.delete(record.id).await?;
        }

        for runner in &self.runners {
            if let Err(e) = runner.start().await {
                error!("任务 {} 启动失败: {}", runner.name(), e);
            }
        }
        Ok(())
    }

    /// 分发一条消息
    pub async fn route(&self, message: Message) {
        if is_event(message.name()) {
            self.route_event(message).await;
        } else {
            self.route_command(message).await;
        }
    }

    async fn route_command(&self, message: Message) {
        let Some((signature, runner)) = self.commands.get(message.name()) else {
            warn!("没有任务处理命令: {}", message);
            return;
        };

        let command = match message.conform(signature.params) {
            Ok(command) => command,
            Err(e) => {
                error!("命令参数错误: {}", e);
                return;
            }
        };

        debug!("命令 {} -> 任务 {}", command, runner.name());
        metrics::record_message_routed(signature.name);
        runner.handle_command(command).await;
    }

    async fn route_event(&self, message: Message) {
        let Some(route) = self.events.get(message.name()) else {
            if events::ALL.iter().any(|s| message.is(s.name)) {
                debug!("没有任务订阅事件: {}", message);
            } else {
                warn!("未知的事件: {}", message);
            }
            return;
        };

        let event = match message.conform(route.signature.params) {
            Ok(event) => event,
            Err(e) => {
                error!("事件参数错误: {}", e);
                return;
            }
        };

        metrics::record_message_routed(route.signature.name);
        for runner in &route.subscribers {
            debug!("事件 {} -> 任务 {}", event, runner.name());
            runner.handle_event(event.clone()).await;
        }
    }

    /// 运行路由循环直到收到关闭信号
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        self.start().await?;
        info!("调度器开始处理消息");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("调度器收到关闭信号");
                    break;
                }
                message = self.inbox.recv() => match message {
                    Some(message) => self.route(message).await,
                    None => break,
                },
            }
        }

        self.stop().await;
        Ok(())
    }

    pub async fn stop(&self) {
        for runner in &self.runners {
            runner.stop().await;
        }
        info!("所有任务已停止");
    }
}
