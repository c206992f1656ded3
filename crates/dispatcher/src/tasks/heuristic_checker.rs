use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use scheduler_core::{Alert, Message, MessageSignature, SchedulerResult};
use scheduler_domain::{
    commands, Command, ErrorKind, ErrorReport, Event, ExperimentStatus, Heuristic, HeuristicTestStatus,
    HeuristicVersion, ServerType, TestPhase, VersionStatus,
};

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::selection::{claim_ready_server, Handshake};
use crate::task::Task;
use crate::tasks::load_version;

/// 在编译服务器上编译、分析并测试新上传的启发式
///
/// 测试阶段依次为 Status → Compilation → Analyze → Test，进度记录在 [`HeuristicTestStatus`] 中。
/// 检查通过后源文件被移动到已验证仓库。
#[derive(Debug, Default)]
pub struct HeuristicChecker;

impl HeuristicChecker {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Default)]
pub enum CheckStep {
    #[default]
    Start,
    Repository,
    Compilation,
    Analysis,
    Test,
}

#[derive(Debug)]
pub struct CheckTarget {
    heuristic: Heuristic,
    version: HeuristicVersion,
    fullname: String,
    test_status: HeuristicTestStatus,
}

#[derive(Debug, Default)]
pub struct CheckState {
    step: CheckStep,
    target: Option<CheckTarget>,
}

#[async_trait]
impl Task for HeuristicChecker {
    type State = CheckState;

    fn name(&self) -> &'static str {
        "HeuristicChecker"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::CHECK_HEURISTIC]
    }

    /// 为所有尚未检查的启发式版本创建 Job，旧的检查进度作废
    async fn on_startup(&self, ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        let heuristics = &ctx.repositories.heuristics;
        let mut commands = Vec::new();

        for version in heuristics.find_all_versions().await? {
            if version.checked || !version.is_ok() {
                continue;
            }
            heuristics.delete_test_status(version.id).await?;
            commands.push(
                Command::CheckHeuristic {
                    heuristic_version_id: version.id,
                }
                .to_message(),
            );
        }

        Ok(commands)
    }

    /// 步骤中的异常同样记录在测试进度中；服务器处理启发式期间的异常还会禁用版本
    async fn step(&self, job: &mut Job<CheckState>) -> SchedulerResult<()> {
        let disable_version = matches!(
            job.state.step,
            CheckStep::Compilation | CheckStep::Analysis | CheckStep::Test
        );

        let result = match job.state.step {
            CheckStep::Start => start(job).await,
            CheckStep::Repository => repository_selected(job).await,
            CheckStep::Compilation => compilation_done(job).await,
            CheckStep::Analysis => analysis_done(job).await,
            CheckStep::Test => test_done(job).await,
        };

        match result {
            Err(e) if !job.status().is_terminal() => {
                let alert = Alert::new(format!("Failed to check the heuristic '{}'", fullname(job)))
                    .with_details(format!("Error: {e}"));
                fail(job, alert, disable_version).await
            }
            other => other,
        }
    }
}

async fn start(job: &mut Job<CheckState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let version_id = job.command().int_param(0)?;
    let heuristics = &ctx.repositories.heuristics;

    let Some(info) = load_version(&ctx, version_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown heuristic version ID: {version_id}")))
            .await;
    };

    job.log("Searching a free compilation server...");
    let servers = ctx.repositories.servers.find_by_type(ServerType::Compilation).await?;
    let Some((server, channel)) = claim_ready_server(&ctx, &job.key(), servers, Handshake::Status).await else {
        job.log("Failed to find a free compilation server");
        return job.retry_later().await;
    };

    job.log(format!("Compilation Server found: {}", server.endpoint()));
    job.mark_as_running(
        JobBinding::new()
            .with_server(server, channel)
            .with_heuristic_version(info.version.id),
    )
    .await?;

    let test_status = HeuristicTestStatus {
        heuristic_version_id: info.version.id,
        phase: TestPhase::Status,
        error: false,
        details: String::new(),
    };
    heuristics.save_test_status(&test_status).await?;

    job.state.target = Some(CheckTarget {
        fullname: info.fullname(),
        heuristic: info.heuristic,
        version: info.version,
        test_status,
    });

    job.log("Tell the server about the heuristics repository...");
    let url = ctx.settings.upload_url.clone();
    job.send(Message::new("USE_HEURISTICS_REPOSITORY", vec![url.into()]))
        .await?;
    job.state.step = CheckStep::Repository;
    Ok(())
}

async fn repository_selected(job: &mut Job<CheckState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let response = job.receive().await?;

    if !response.is("OK") {
        let alert = Alert::new("Failed to select the heuristics repository").with_details(format!(
            "Repository: {}\nResponse: {}",
            ctx.settings.upload_url, response
        ));
        return fail(job, alert, false).await;
    }

    advance_phase(job, TestPhase::Compilation).await?;

    let fullname = fullname(job);
    job.log("Check the heuristic...");
    job.send(Message::new("CHECK_HEURISTIC", vec![fullname.into()]))
        .await?;
    job.state.step = CheckStep::Compilation;
    Ok(())
}

async fn compilation_done(job: &mut Job<CheckState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    let fullname = fullname(job);

    if !response.is("COMPILATION_OK") {
        let alert = match response.name() {
            "ERROR" => Alert::new(format!("Failed to check the heuristic '{fullname}'")).with_details(format!(
                "Error during the compilation phase: {}",
                first_param(&response)
            )),
            "COMPILATION_ERROR" => {
                Alert::new(format!("Failed to compile the heuristic '{fullname}'")).with_details(first_param(&response))
            }
            _ => Alert::new(format!("Failed to check the heuristic '{fullname}'")).with_details(format!(
                "Unknown response from the Compilation Server. Expected: COMPILATION_OK, got: {response}"
            )),
        };
        return fail(job, alert, true).await;
    }

    job.log("Compilation OK");
    advance_phase(job, TestPhase::Analyze).await?;
    job.state.step = CheckStep::Analysis;
    Ok(())
}

async fn analysis_done(job: &mut Job<CheckState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    let fullname = fullname(job);

    if !response.is("ANALYZE_OK") {
        let alert = if response.is("ANALYZE_ERROR") {
            Alert::new(format!("Failed to analyze the heuristic '{fullname}'")).with_details(first_param(&response))
        } else {
            Alert::new(format!("Failed to check the heuristic '{fullname}'")).with_details(format!(
                "Unknown response from the Compilation Server. Expected: ANALYZE_OK, got: {response}"
            ))
        };
        return fail(job, alert, true).await;
    }

    job.log("Analysis OK");
    advance_phase(job, TestPhase::Test).await?;
    job.state.step = CheckStep::Test;
    Ok(())
}

async fn test_done(job: &mut Job<CheckState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let response = job.receive().await?;
    let fullname = fullname(job);

    if !response.is("TEST_OK") {
        let kind = match response.name() {
            "TEST_ERROR" => Some(ErrorKind::Other),
            "HEURISTIC_CRASH" => Some(ErrorKind::Crash),
            "HEURISTIC_TIMEOUT" => Some(ErrorKind::Timeout),
            _ => None,
        };

        let mut alert = Alert::new(format!("The test of the heuristic '{fullname}' failed"));
        let report = match kind {
            Some(kind) => {
                let description = if kind == ErrorKind::Other {
                    first_param(&response)
                } else {
                    String::new()
                };
                Some(read_error_report(job, kind, description).await?)
            }
            None => {
                alert = alert.with_details(format!(
                    "Unknown response from the Compilation Server. Expected: TEST_OK, got: {response}"
                ));
                None
            }
        };

        if let Some(report) = report {
            let report = ctx.repositories.heuristics.create_error_report(&report).await?;
            notify_author(job, &report).await;
        }
        return fail(job, alert, true).await;
    }

    job.log("Test OK");
    promote(job).await
}

/// 读取错误的上下文以及（崩溃时的）调用栈
async fn read_error_report(
    job: &mut Job<CheckState>,
    kind: ErrorKind,
    description: String,
) -> SchedulerResult<ErrorReport> {
    let mut report = ErrorReport {
        id: 0,
        heuristic_version_id: job.heuristic_version_id(),
        instrument_id: None,
        experiment_id: None,
        kind,
        description,
        context: None,
        stacktrace: None,
    };

    let response = job.receive().await?;
    if response.is("CONTEXT") {
        report.context = Some(first_param(&response));
    }

    let has_context = report.context.as_deref().is_some_and(|c| !c.is_empty());
    if kind == ErrorKind::Crash && has_context {
        let response = job.receive().await?;
        if response.is("STACKTRACE") {
            report.stacktrace = Some(first_param(&response));
        }
    }

    Ok(report)
}

async fn notify_author(job: &mut Job<CheckState>, report: &ErrorReport) {
    let Some(target) = job.state.target.as_ref() else {
        return;
    };

    let subject = format!("[MASH] The test of your heuristic '{}' failed", target.fullname);
    let mut body = format!("Error: {:?}\n", report.kind);
    if !report.description.is_empty() {
        body.push_str(&format!("Description: {}\n", report.description));
    }
    if let Some(context) = &report.context {
        body.push_str(&format!("\nContext:\n{context}\n"));
    }
    if let Some(stacktrace) = &report.stacktrace {
        body.push_str(&format!("\nStack trace:\n{stacktrace}\n"));
    }

    let author = target.heuristic.author.clone();
    let notifier = job.ctx().notifier.clone();
    match notifier.notify_user(&author, &subject, &body).await {
        Ok(delivery) => job.set_mail_sent(delivery.is_sent()),
        Err(e) => job.log(format!("Failed to notify the author: {e}")),
    }
}

/// 把通过检查的源文件移动到已验证仓库，标记为已检查
async fn promote(job: &mut Job<CheckState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let Some(target) = job.state.target.as_ref() else {
        return job.mark_as_failed(Alert::new("No heuristic bound to the job")).await;
    };

    let result = ctx
        .storage
        .artifacts
        .promote(
            &target.heuristic.author,
            &target.version.filename,
            &target.heuristic.name,
            target.version.version,
        )
        .await;

    let filename = match result {
        Ok(filename) => filename,
        Err(e) => {
            let alert = Alert::new(format!(
                "Error while moving the heuristic version '{}' from the 'upload' repository to the 'heuristics' one",
                target.fullname
            ))
            .with_details(e.to_string());
            return fail(job, alert, false).await;
        }
    };

    let Some(target) = job.state.target.as_mut() else {
        return Ok(());
    };
    // 源文件已经移动，失败时记录的版本也要指向新位置
    target.version.filename = filename;
    let mut version = target.version.clone();
    version.checked = true;
    let fullname = target.fullname.clone();

    let heuristics = &ctx.repositories.heuristics;
    heuristics.update_version(&version).await?;
    heuristics.delete_test_status(version.id).await?;

    job.mark_as_done(ExperimentStatus::Done).await?;
    info!("启发式 {} 检查通过", fullname);

    ctx.emit(Event::HeuristicChecked {
        heuristic_version_id: version.id,
    });
    Ok(())
}

async fn advance_phase(job: &mut Job<CheckState>, phase: TestPhase) -> SchedulerResult<()> {
    let heuristics = job.ctx().repositories.heuristics.clone();
    if let Some(target) = job.state.target.as_mut() {
        target.test_status.phase = phase;
        heuristics.save_test_status(&target.test_status).await?;
    }
    Ok(())
}

/// 记录检查失败：更新测试进度、（可选）禁用版本、收集服务器日志
async fn fail(job: &mut Job<CheckState>, alert: Alert, disable_version: bool) -> SchedulerResult<()> {
    let heuristics = job.ctx().repositories.heuristics.clone();

    if let Some(target) = job.state.target.as_mut() {
        if disable_version {
            target.version.status = VersionStatus::Disabled;
            target.version.status_date = Some(Utc::now());
            heuristics.update_version(&target.version).await?;
        }

        target.test_status.error = true;
        target.test_status.details = match &alert.details {
            Some(details) => format!("{}\n{}", alert.message, details),
            None => alert.message.clone(),
        };
        heuristics.save_test_status(&target.test_status).await?;
    }

    job.capture_server_logs(None).await;
    job.mark_as_failed(alert).await
}

fn fullname(job: &Job<CheckState>) -> String {
    job.state
        .target
        .as_ref()
        .map(|target| target.fullname.clone())
        .unwrap_or_default()
}

fn first_param(message: &Message) -> String {
    message.str_param(0).unwrap_or_default()
}
