use async_trait::async_trait;

use scheduler_core::{Message, MessageSignature, SchedulerResult};

use crate::context::TaskContext;
use crate::job::Job;
use crate::job_queue::JobQueue;

/// 任务对命令的预处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// 按标准流程为命令创建 Job
    Enqueue,
    /// 命令已经处理，另外为这些命令创建 Job（可以为空）
    Handled(Vec<Message>),
}

/// 任务：一类远程操作的状态机
///
/// 每个任务声明自己支持的命令和事件，拥有一个 Job 队列。`step` 推进 Job 一步，
/// 下一步保存在 `Job::state` 中；驱动器在 Job 处于 Scheduled 或 Running 时不断调用它。
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// 每个 Job 的工作数据，Delayed 之后重新进入时会被重置
    type State: Default + Send + 'static;

    fn name(&self) -> &'static str;

    fn supported_commands(&self) -> &'static [MessageSignature];

    fn supported_events(&self) -> &'static [MessageSignature] {
        &[]
    }

    /// 启动时恢复未完成的工作，返回需要创建 Job 的命令
    async fn on_startup(&self, _ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn on_command_received(
        &self,
        _command: &Message,
        _queue: &JobQueue,
        _ctx: &TaskContext,
    ) -> SchedulerResult<CommandOutcome> {
        Ok(CommandOutcome::Enqueue)
    }

    /// 返回需要在本任务中创建 Job 的命令
    async fn on_event_received(
        &self,
        _event: &Message,
        _queue: &JobQueue,
        _ctx: &TaskContext,
    ) -> SchedulerResult<Vec<Message>> {
        Ok(Vec::new())
    }

    /// 推进 Job 一步
    async fn step(&self, job: &mut Job<Self::State>) -> SchedulerResult<()>;

    /// Job 被取消之后调用
    async fn on_cancelled(&self, _job: &mut Job<Self::State>) -> SchedulerResult<()> {
        Ok(())
    }
}
