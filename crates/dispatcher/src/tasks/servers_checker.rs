use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use scheduler_core::{Message, MessageSignature, SchedulerResult};
use scheduler_domain::{commands, Command, ExperimentStatus, ServerStatus};

use crate::context::TaskContext;
use crate::job::Job;
use crate::job_queue::JobQueue;
use crate::task::{CommandOutcome, Task};

/// 检查所有服务器是否在线
#[derive(Debug, Default)]
pub struct ServersChecker {
    last_check: Mutex<Option<Instant>>,
}

impl ServersChecker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Task for ServersChecker {
    type State = ();

    fn name(&self) -> &'static str {
        "ServersChecker"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::CHECK_SERVERS_STATUS]
    }

    async fn on_startup(&self, _ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        Ok(vec![Command::CheckServersStatus.to_message()])
    }

    /// 已有检查在进行，或者刚刚检查过，忽略这次请求
    async fn on_command_received(
        &self,
        _command: &Message,
        queue: &JobQueue,
        ctx: &TaskContext,
    ) -> SchedulerResult<CommandOutcome> {
        if !queue.is_empty().await {
            return Ok(CommandOutcome::Handled(Vec::new()));
        }

        let recent = self
            .last_check
            .lock()
            .await
            .map(|at| at.elapsed() <= ctx.settings.servers_check_min_interval)
            .unwrap_or(false);

        if recent {
            Ok(CommandOutcome::Handled(Vec::new()))
        } else {
            Ok(CommandOutcome::Enqueue)
        }
    }

    async fn step(&self, job: &mut Job<()>) -> SchedulerResult<()> {
        let ctx = job.ctx().clone();
        let servers = ctx.repositories.servers.find_all().await?;

        for mut server in servers {
            server.status = ServerStatus::Unknown;
            ctx.repositories.servers.update(&server).await?;

            match ctx.connector.connect(&server.address, server.port).await {
                Some(mut channel) => {
                    job.log(format!("Server '{}' at '{}'... ONLINE", server.name, server.endpoint()));
                    server.status = ServerStatus::Online;
                    channel.close().await;
                }
                None => {
                    job.log(format!("Server '{}' at '{}'... OFFLINE", server.name, server.endpoint()));
                    server.status = ServerStatus::Offline;
                }
            }

            ctx.repositories.servers.update(&server).await?;
        }

        *self.last_check.lock().await = Some(Instant::now());
        job.mark_as_done(ExperimentStatus::Done).await
    }
}

