use async_trait::async_trait;

use scheduler_core::{Alert, Message, MessageSignature, SchedulerResult, Value};
use scheduler_domain::{
    commands, Command, DebuggingEntry, DebuggingStatus, ExperimentStatus, ServerSubtype, ServerType,
};

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::selection::{claim_ready_server, find_ready_server, Handshake};
use crate::task::Task;
use crate::tasks::load_version;

/// 在交互式应用服务器上调试启发式，保存调试服务器返回的帧数据
///
/// 需要两台服务器：一台提供目标和环境的交互式应用服务器（只探测，不认领），
/// 以及一台空闲的调试服务器。
#[derive(Debug, Default)]
pub struct HeuristicDebugger;

impl HeuristicDebugger {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Default)]
pub enum DebugStep {
    #[default]
    Start,
    ApplicationServer,
    TaskSelected,
    Repository,
    Data,
}

#[derive(Debug, Default)]
pub struct DebugState {
    step: DebugStep,
    entry: Option<DebuggingEntry>,
    fullname: String,
}

#[async_trait]
impl Task for HeuristicDebugger {
    type State = DebugState;

    fn name(&self) -> &'static str {
        "HeuristicDebugger"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::DEBUG_HEURISTIC]
    }

    /// 先恢复运行中的条目，再安排已计划的条目
    async fn on_startup(&self, ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        let debugging = &ctx.repositories.debugging;
        let mut entries = debugging.find_entries_by_status(DebuggingStatus::Running).await?;
        entries.extend(debugging.find_entries_by_status(DebuggingStatus::Scheduled).await?);

        Ok(entries
            .into_iter()
            .map(|entry| {
                Command::DebugHeuristic {
                    debugging_entry_id: entry.id,
                }
                .to_message()
            })
            .collect())
    }

    async fn step(&self, job: &mut Job<DebugState>) -> SchedulerResult<()> {
        let result = match job.state.step {
            DebugStep::Start => start(job).await,
            DebugStep::ApplicationServer => application_server_selected(job).await,
            DebugStep::TaskSelected => task_selected(job).await,
            DebugStep::Repository => repository_selected(job).await,
            DebugStep::Data => data_received(job).await,
        };

        // 异常也要让条目进入失败状态
        match result {
            Err(e) if !job.status().is_terminal() => {
                let alert = Alert::new(format!("Failed to debug the heuristic '{}'", job.state.fullname))
                    .with_details(format!("Error: {e}"));
                fail(job, alert).await
            }
            other => other,
        }
    }
}

async fn start(job: &mut Job<DebugState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let entry_id = job.command().int_param(0)?;
    let repos = &ctx.repositories;

    let Some(mut entry) = repos.debugging.find_entry(entry_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown debugging entry ID: {entry_id}")))
            .await;
    };

    job.log(format!(
        "Searching a free Interactive Application Server providing the goal '{}' and the environment '{}'...",
        entry.goal, entry.environment
    ));
    let applications: Vec<_> = repos
        .servers
        .find_by_type(ServerType::Application)
        .await?
        .into_iter()
        .filter(|s| s.subtype == ServerSubtype::Interactive && s.provides_goal(&entry.goal, &entry.environment))
        .collect();

    let Some(application) = find_ready_server(&ctx, applications).await else {
        job.log("Failed to find a free Interactive Application Server");
        return job.retry_later().await;
    };
    job.log(format!("Interactive Application Server found: {}", application.endpoint()));

    job.log("Searching a free debugging server...");
    let servers = repos.servers.find_by_type(ServerType::Debugging).await?;
    let Some((server, channel)) = claim_ready_server(&ctx, &job.key(), servers, Handshake::Status).await else {
        job.log("Failed to find a free debugging server");
        return job.retry_later().await;
    };

    job.mark_as_running(
        JobBinding::new()
            .with_server(server, channel)
            .with_heuristic_version(entry.heuristic_version_id),
    )
    .await?;

    let fullname = load_version(&ctx, entry.heuristic_version_id)
        .await?
        .map(|info| info.fullname())
        .unwrap_or_default();

    entry.status = DebuggingStatus::Running;
    repos.debugging.update_entry(&entry).await?;
    job.state.entry = Some(entry);

    if fullname.is_empty() {
        return fail(
            job,
            Alert::new(format!(
                "Unknown heuristic version ID: {}",
                job.heuristic_version_id().unwrap_or_default()
            )),
        )
        .await;
    }
    job.state.fullname = fullname;

    job.send(Message::new(
        "USE_APPLICATION_SERVER",
        vec![application.address.as_str().into(), application.port.into()],
    ))
    .await?;
    job.state.step = DebugStep::ApplicationServer;
    Ok(())
}

async fn application_server_selected(job: &mut Job<DebugState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if !response.is("OK") {
        return fail(
            job,
            Alert::new("Failed to select the Application Server").with_details(format!("Response: {response}")),
        )
        .await;
    }

    let (goal, environment) = match &job.state.entry {
        Some(entry) => (entry.goal.clone(), entry.environment.clone()),
        None => return fail(job, Alert::new("No debugging entry bound to the job")).await,
    };

    job.log("Selecting the task...");
    job.send(Message::new("SELECT_TASK", vec![goal.into(), environment.into()]))
        .await?;
    job.state.step = DebugStep::TaskSelected;
    Ok(())
}

async fn task_selected(job: &mut Job<DebugState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if !response.is("OK") {
        let (goal, environment) = job
            .state
            .entry
            .as_ref()
            .map(|e| (e.goal.clone(), e.environment.clone()))
            .unwrap_or_default();
        let alert = Alert::new("Failed to select the task").with_details(format!(
            "Goal: {goal}\nEnvironment: {environment}\nResponse: {response}"
        ));
        return fail(job, alert).await;
    }

    job.log("Tell the server about the heuristics repository...");
    let url = job.ctx().settings.heuristics_url.clone();
    job.send(Message::new("USE_HEURISTICS_REPOSITORY", vec![url.into()]))
        .await?;
    job.state.step = DebugStep::Repository;
    Ok(())
}

async fn repository_selected(job: &mut Job<DebugState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if !response.is("OK") {
        let url = job.ctx().settings.heuristics_url.clone();
        let alert = Alert::new("Failed to select the heuristics repository")
            .with_details(format!("Repository: {url}\nResponse: {response}"));
        return fail(job, alert).await;
    }

    let Some(entry) = job.state.entry.as_ref() else {
        return fail(job, Alert::new("No debugging entry bound to the job")).await;
    };

    let mut args: Vec<Value> = vec![job.state.fullname.as_str().into(), entry.sequence.into()];
    if entry.start_frame >= 0 {
        args.push(entry.start_frame.into());
        if entry.end_frame >= 0 {
            args.push(entry.end_frame.into());
        }
    }

    job.log("Debug the heuristic...");
    job.send(Message::new("DEBUG_HEURISTIC", args)).await?;
    job.state.step = DebugStep::Data;
    Ok(())
}

async fn data_received(job: &mut Job<DebugState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let response = job.receive().await?;

    let size = match response.int_param(0) {
        Ok(size) if response.is("DATA") && size >= 0 => size as usize,
        _ => {
            let alert = Alert::new(format!("Failed to debug the heuristic '{}'", job.state.fullname))
                .with_details(format!("Response: {response}"));
            return fail(job, alert).await;
        }
    };

    let data = job.receive_data(size).await?;

    let Some(filename) = job.state.entry.as_ref().map(DebuggingEntry::filename) else {
        return fail(job, Alert::new("No debugging entry bound to the job")).await;
    };
    ctx.storage.debugging.write(&filename, &data).await?;

    if let Some(entry) = job.state.entry.as_mut() {
        entry.status = DebuggingStatus::Done;
        ctx.repositories.debugging.update_entry(entry).await?;
    }

    job.log("Debugging done");
    job.mark_as_done(ExperimentStatus::Done).await
}

/// 调试失败：条目标记为失败，收集服务器日志
async fn fail(job: &mut Job<DebugState>, alert: Alert) -> SchedulerResult<()> {
    let debugging = job.ctx().repositories.debugging.clone();

    if let Some(entry) = job.state.entry.as_mut() {
        entry.status = DebuggingStatus::Failed;
        entry.error_details = match &alert.details {
            Some(details) => format!("{}\n{}", alert.message, details),
            None => alert.message.clone(),
        };
        debugging.update_entry(entry).await?;
    }

    job.capture_server_logs(None).await;
    job.mark_as_failed(alert).await
}
