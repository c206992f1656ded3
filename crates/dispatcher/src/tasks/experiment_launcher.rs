use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use scheduler_core::{Alert, Message, MessageSignature, SchedulerError, SchedulerResult, Value};
use scheduler_domain::{
    commands, Command, Configuration, ErrorKind, ErrorReport, Event, EvaluationStep, Experiment,
    ExperimentStatus, ExperimentType, Instrument, InstrumentStatus, Server, ServerSubtype, ServerType,
    TaskKind, VersionStatus,
};

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::job_queue::JobQueue;
use crate::selection::{claim_ready_server, find_ready_server, Handshake};
use crate::task::{CommandOutcome, Task};
use crate::tasks::load_version;

const EXPERIMENT_SERVER: &str = "ExperimentServer";
const EXPERIMENT_PROTOCOL: &str = "1.7";

const GLOBAL_SEED: &str = "USE_GLOBAL_SEED";
const PREDICTOR: &str = "USE_PREDICTOR";
const NB_TEST_ROUNDS: &str = "TEST_PREDICTOR/NB_TEST_ROUNDS";
const NB_MAX_ACTIONS: &str = "TEST_PREDICTOR/NB_MAX_ACTIONS";

/// 在实验服务器上运行实验
///
/// 一个实验需要两台服务器：提供数据库（或目标和环境）的应用服务器，只探测不认领；
/// 以及支持该实验任务的实验服务器。实验服务器依次收到实验类型、应用服务器、随机种子、
/// 各个设置段、仪器、预测器和启发式列表，然后训练并测试预测器，最后返回数据报告。
///
/// 评估实验对配置中的每个随机种子运行一轮，轮与轮之间发送 `RESET`。
#[derive(Debug, Default)]
pub struct ExperimentLauncher;

impl ExperimentLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStep {
    #[default]
    Start,
    ExperimentType,
    ApplicationServer,
    /// 等待 `RESET` 的确认，之后重新发送随机种子
    Reset,
    GlobalSeed,
    /// 正在发送一个设置段
    Section,
    ExperimentSetup,
    Instrument,
    InstrumentSetup,
    Predictor,
    PredictorSetup,
    Repository,
    Heuristic,
    Training,
    Testing,
    GoalPlanningTesting,
    DataReport,
}

/// 实验及其配置
#[derive(Debug)]
pub struct Run {
    experiment: Experiment,
    configuration: Configuration,
    kind: TaskKind,
}

/// `BEGIN_<name>` 与 `END_<name>` 之间逐条发送的设置
#[derive(Debug)]
struct Section {
    name: &'static str,
    settings: VecDeque<(String, String)>,
    after: LaunchStep,
}

#[derive(Debug, Default)]
pub struct LaunchState {
    step: LaunchStep,
    run: Option<Run>,
    application: Option<Server>,
    seeds: Vec<i64>,
    /// 已完成的评估轮数，其他实验中为重试的次数
    rounds: usize,
    goalplanning_rounds: usize,
    section: Option<Section>,
    instruments: VecDeque<Instrument>,
    heuristics: VecDeque<String>,
}

impl LaunchState {
    fn run(&self) -> SchedulerResult<&Run> {
        self.run
            .as_ref()
            .ok_or_else(|| SchedulerError::Internal("Job 没有绑定实验".to_string()))
    }

    fn run_mut(&mut self) -> SchedulerResult<&mut Run> {
        self.run
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("Job 没有绑定实验".to_string()))
    }

    fn experiment_type(&self) -> Option<ExperimentType> {
        self.run.as_ref().map(|run| run.configuration.experiment_type)
    }

    fn is_evaluation(&self) -> bool {
        self.experiment_type() == Some(ExperimentType::Evaluation)
    }

    /// 当前这一轮使用的种子
    fn current_seed(&self) -> i64 {
        let index = if self.is_evaluation() { self.rounds } else { 0 };
        self.seeds
            .get(index)
            .or(self.seeds.last())
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Task for ExperimentLauncher {
    type State = LaunchState;

    fn name(&self) -> &'static str {
        "ExperimentLauncher"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::RUN_EXPERIMENT, commands::CANCEL_EXPERIMENT]
    }

    async fn on_startup(&self, ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        Ok(ctx
            .repositories
            .experiments
            .find_experiments_by_status(ExperimentStatus::Scheduled)
            .await?
            .into_iter()
            .map(|experiment| {
                Command::RunExperiment {
                    experiment_id: experiment.id,
                }
                .to_message()
            })
            .collect())
    }

    async fn on_command_received(
        &self,
        command: &Message,
        queue: &JobQueue,
        _ctx: &TaskContext,
    ) -> SchedulerResult<CommandOutcome> {
        let Command::CancelExperiment { experiment_id } = Command::from_message(command)? else {
            return Ok(CommandOutcome::Enqueue);
        };

        let run = Command::RunExperiment { experiment_id }.to_message();
        match queue.get_jobs(&run).await.first() {
            Some(job) => {
                info!("取消实验 {}", experiment_id);
                job.cancel();
            }
            None => error!("队列中没有实验 {} 的 Job", experiment_id),
        }
        Ok(CommandOutcome::Handled(Vec::new()))
    }

    async fn step(&self, job: &mut Job<LaunchState>) -> SchedulerResult<()> {
        match job.state.step {
            LaunchStep::Start => start(job).await,
            LaunchStep::ExperimentType => experiment_type_set(job).await,
            LaunchStep::ApplicationServer => application_server_selected(job).await,
            LaunchStep::Reset => server_reset(job).await,
            LaunchStep::GlobalSeed => global_seed_set(job).await,
            LaunchStep::Section => send_section(job).await,
            LaunchStep::ExperimentSetup => experiment_setup_sent(job).await,
            LaunchStep::Instrument => instrument_selected(job).await,
            LaunchStep::InstrumentSetup => instrument_setup_sent(job).await,
            LaunchStep::Predictor => predictor_selected(job).await,
            LaunchStep::PredictorSetup => predictor_setup_sent(job).await,
            LaunchStep::Repository => repository_selected(job).await,
            LaunchStep::Heuristic => heuristic_selected(job).await,
            LaunchStep::Training => training_result(job).await,
            LaunchStep::Testing => test_result(job).await,
            LaunchStep::GoalPlanningTesting => goalplanning_test_result(job).await,
            LaunchStep::DataReport => data_report(job).await,
        }
    }

    async fn on_cancelled(&self, job: &mut Job<LaunchState>) -> SchedulerResult<()> {
        let experiment_id = job.command().int_param(0)?;
        job.ctx().emit(Event::ExperimentCancelled { experiment_id });
        Ok(())
    }
}

async fn start(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;
    let experiment_id = job.command().int_param(0)?;

    if repos.experiments.find_experiment(experiment_id).await?.is_none() {
        return job
            .mark_as_failed(Alert::new(format!("Unknown experiment ID: {experiment_id}")))
            .await;
    }
    job.mark_as_running(JobBinding::new().with_experiment(experiment_id))
        .await?;

    let Some(experiment) = repos.experiments.find_experiment(experiment_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown experiment ID: {experiment_id}")))
            .await;
    };
    let Some(configuration) = repos
        .experiments
        .find_configuration(experiment.configuration_id)
        .await?
    else {
        return job
            .mark_as_failed(Alert::new(format!(
                "Unknown configuration ID: {}",
                experiment.configuration_id
            )))
            .await;
    };
    let Some(task) = repos.experiments.find_task(configuration.task_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown task ID: {}", configuration.task_id)))
            .await;
    };

    if task.kind == TaskKind::GoalPlanning && configuration.experiment_type == ExperimentType::Evaluation {
        return job
            .mark_as_failed(Alert::new(
                "Evaluation experiments doesn't support goal-planning tasks",
            ))
            .await;
    }

    let Some(application) = find_application_server(job, &configuration, task.kind).await? else {
        return job.retry_later().await;
    };

    job.log("Searching a free Experiment Server suitable for the task");
    let servers = experiment_servers(&ctx, &configuration).await?;
    let handshake = Handshake::StatusAndInfo {
        server_type: EXPERIMENT_SERVER,
        protocol: EXPERIMENT_PROTOCOL,
    };
    let Some((server, channel)) = claim_ready_server(&ctx, &job.key(), servers, handshake).await else {
        job.log("Failed to find a free Experiment Server");
        return job.retry_later().await;
    };
    job.log(format!("Experiment Server found: {}", server.endpoint()));

    job.mark_as_running(JobBinding::new().with_server(server, channel))
        .await?;

    // 重新读取，状态已经更新为 Running
    let mut experiment = repos
        .experiments
        .find_experiment(experiment_id)
        .await?
        .unwrap_or(experiment);
    experiment.start = Some(Utc::now());
    experiment.end = None;
    repos.experiments.update_experiment(&experiment).await?;

    job.state.application = Some(application);
    job.state.run = Some(Run {
        experiment,
        configuration,
        kind: task.kind,
    });

    let kind = match task.kind {
        TaskKind::Classification => "Classification",
        TaskKind::ObjectDetection => "ObjectDetection",
        TaskKind::GoalPlanning => "GoalPlanning",
    };
    job.send(Message::new("SET_EXPERIMENT_TYPE", vec![kind.into()]))
        .await?;
    job.state.step = LaunchStep::ExperimentType;
    Ok(())
}

/// 探测提供实验所需数据的应用服务器
async fn find_application_server(
    job: &mut Job<LaunchState>,
    configuration: &Configuration,
    kind: TaskKind,
) -> SchedulerResult<Option<Server>> {
    let ctx = job.ctx().clone();
    let applications = ctx
        .repositories
        .servers
        .find_by_type(ServerType::Application)
        .await?;

    let candidates: Vec<Server> = match kind {
        TaskKind::GoalPlanning => {
            let goal = configuration.goal_name().unwrap_or_default();
            let environment = configuration.environment_name().unwrap_or_default();
            job.log(format!(
                "Searching a free Interactive Application Server providing the goal '{goal}' and the environment '{environment}'..."
            ));
            applications
                .into_iter()
                .filter(|s| s.subtype == ServerSubtype::Interactive && s.provides_goal(goal, environment))
                .collect()
        }
        TaskKind::Classification | TaskKind::ObjectDetection => {
            let database = configuration.database_name().unwrap_or_default();
            job.log(format!(
                "Searching a free Image Server providing the database '{database}'..."
            ));
            applications
                .into_iter()
                .filter(|s| s.subtype == ServerSubtype::Images && s.provides_database(database))
                .collect()
        }
    };

    let found = find_ready_server(&ctx, candidates).await;
    match &found {
        Some(server) => job.log(format!("Application Server found: {}", server.endpoint())),
        None => job.log("Failed to find a free Application Server"),
    }
    Ok(found)
}

/// 支持该任务的实验服务器，限定了实验类型的服务器优先
async fn experiment_servers(ctx: &TaskContext, configuration: &Configuration) -> SchedulerResult<Vec<Server>> {
    let wanted = match configuration.experiment_type {
        ExperimentType::ContestBase => ExperimentType::ContestEntry,
        ExperimentType::Signature => ExperimentType::Evaluation,
        other => other,
    };

    let (restricted, unrestricted): (Vec<Server>, Vec<Server>) = ctx
        .repositories
        .servers
        .find_by_type(ServerType::Experiments)
        .await?
        .into_iter()
        .filter(|s| s.supports_task(configuration.task_id))
        .partition(|s| s.restrict_experiment.is_some());

    Ok(restricted
        .into_iter()
        .filter(|s| s.restrict_experiment == Some(wanted))
        .chain(unrestricted)
        .collect())
}

/// 期望 `OK`，否则按实验错误处理，返回是否可以继续
async fn expect_ok(job: &mut Job<LaunchState>, failure: &str) -> SchedulerResult<bool> {
    let response = job.receive().await?;
    if response.is("OK") {
        return Ok(true);
    }
    process_error(job, failure.to_string(), Some(&response), true).await?;
    Ok(false)
}

async fn experiment_type_set(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to set the experiment type").await? {
        return Ok(());
    }

    let Some(application) = job.state.application.as_ref() else {
        return job
            .mark_as_failed(Alert::new("No Application Server bound to the job"))
            .await;
    };
    let message = Message::new(
        "USE_APPLICATION_SERVER",
        vec![application.address.as_str().into(), application.port.into()],
    );
    job.send(message).await?;
    job.state.step = LaunchStep::ApplicationServer;
    Ok(())
}

async fn application_server_selected(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to select the Application Server").await? {
        return Ok(());
    }
    send_global_seed(job).await
}

async fn server_reset(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if !response.is("OK") {
        return process_error(job, "Failed to reset the Experiment Server".to_string(), Some(&response), false).await;
    }
    send_global_seed(job).await
}

async fn send_global_seed(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if job.state.seeds.is_empty() {
        let experiments = job.ctx().repositories.experiments.clone();
        let state = &mut job.state;
        let Some(run) = state.run.as_mut() else {
            return job.mark_as_failed(Alert::new("No experiment bound to the job")).await;
        };
        let configuration = &mut run.configuration;

        match parse_seeds(configuration.setting(GLOBAL_SEED)) {
            Some(seeds) => state.seeds = seeds,
            None => {
                // 没有指定种子时使用当前时间，并记录到配置中
                let seed = Utc::now().timestamp();
                configuration.settings.retain(|s| s.name != GLOBAL_SEED);
                configuration.add_setting(GLOBAL_SEED, seed.to_string());
                experiments.update_configuration(configuration).await?;
                state.seeds = vec![seed];
            }
        }
    }

    let seed = job.state.current_seed();
    job.send(Message::new(GLOBAL_SEED, vec![seed.into()])).await?;
    job.state.step = LaunchStep::GlobalSeed;
    Ok(())
}

/// 空格分隔的种子列表
fn parse_seeds(value: Option<&str>) -> Option<Vec<i64>> {
    let seeds = value?
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().ok())
        .collect::<Option<Vec<_>>>()?;
    (!seeds.is_empty()).then_some(seeds)
}

async fn global_seed_set(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to set the global seed").await? {
        return Ok(());
    }

    let settings = job.state.run()?.configuration.section_settings("EXPERIMENT_SETUP");
    begin_section(job, "EXPERIMENT_SETUP", Vec::new(), settings, LaunchStep::ExperimentSetup).await
}

async fn begin_section(
    job: &mut Job<LaunchState>,
    name: &'static str,
    parameters: Vec<Value>,
    settings: Vec<(String, String)>,
    after: LaunchStep,
) -> SchedulerResult<()> {
    job.send(Message::new(format!("BEGIN_{name}"), parameters))
        .await?;
    job.state.section = Some(Section {
        name,
        settings: settings.into(),
        after,
    });
    job.state.step = LaunchStep::Section;
    Ok(())
}

/// 逐条发送当前段的设置，发送完毕后结束该段
async fn send_section(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to send a setting").await? {
        return Ok(());
    }

    let Some(section) = job.state.section.as_mut() else {
        return job.mark_as_failed(Alert::new("No section being sent")).await;
    };

    let Some((name, value)) = section.settings.pop_front() else {
        let end = Message::named(format!("END_{}", section.name));
        job.state.step = section.after;
        job.state.section = None;
        return job.send(end).await;
    };

    let message = if section.name == "EXPERIMENT_SETUP" && name == "LABELS" {
        let labels = select_labels(&value, job.state.is_evaluation(), job.state.rounds);
        Message::new(name, labels.into_iter().map(Value::from).collect())
    } else {
        Message::new(name, vec![value.into()])
    };
    job.send(message).await
}

/// 每行一组标签，评估实验的每一轮使用各自的一行
fn select_labels(value: &str, evaluation: bool, round: usize) -> Vec<String> {
    let lines: Vec<&str> = value
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .collect();

    let line = if evaluation {
        lines.get(round).or(lines.last())
    } else {
        lines.first()
    };

    line.map(|l| l.split(' ').map(str::to_string).collect())
        .unwrap_or_default()
}

async fn experiment_setup_sent(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to send the 'EXPERIMENT_SETUP' section").await? {
        return Ok(());
    }

    let ctx = job.ctx().clone();
    let mut instruments = VecDeque::new();
    for id in job.state.run()?.configuration.instruments.clone() {
        if let Some(instrument) = ctx.repositories.experiments.find_instrument(id).await? {
            if instrument.status == InstrumentStatus::Enabled {
                instruments.push_back(instrument);
            }
        }
    }
    job.state.instruments = instruments;

    if job.state.instruments.is_empty() {
        send_predictor(job).await
    } else {
        send_next_instrument(job).await
    }
}

async fn send_next_instrument(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let Some(instrument) = job.state.instruments.front() else {
        return send_predictor(job).await;
    };
    let fullname = instrument.fullname();

    job.send(Message::new("USE_INSTRUMENT", vec![fullname.as_str().into()]))
        .await?;
    job.state.step = LaunchStep::Instrument;
    Ok(())
}

async fn instrument_selected(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let fullname = job
        .state
        .instruments
        .front()
        .map(Instrument::fullname)
        .unwrap_or_default();
    if !expect_ok(job, &format!("Failed to select the instrument '{fullname}'")).await? {
        return Ok(());
    }

    let settings = job
        .state
        .run()?
        .configuration
        .section_settings(&format!("INSTRUMENT_SETUP/{fullname}"));
    begin_section(
        job,
        "INSTRUMENT_SETUP",
        vec![fullname.into()],
        settings,
        LaunchStep::InstrumentSetup,
    )
    .await
}

async fn instrument_setup_sent(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to send the 'INSTRUMENT_SETUP' section").await? {
        return Ok(());
    }

    job.state.instruments.pop_front();
    send_next_instrument(job).await
}

async fn send_predictor(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let Some(predictor) = job
        .state
        .run()?
        .configuration
        .setting(PREDICTOR)
        .map(str::to_string)
    else {
        return process_error(job, "No predictor specified".to_string(), None, true).await;
    };

    job.send(Message::new(PREDICTOR, vec![predictor.into()]))
        .await?;
    job.state.step = LaunchStep::Predictor;
    Ok(())
}

async fn predictor_selected(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to set the predictor").await? {
        return Ok(());
    }

    let settings = job.state.run()?.configuration.section_settings("PREDICTOR_SETUP");
    begin_section(job, "PREDICTOR_SETUP", Vec::new(), settings, LaunchStep::PredictorSetup).await
}

async fn predictor_setup_sent(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to send the 'PREDICTOR_SETUP' section").await? {
        return Ok(());
    }

    let url = job.ctx().settings.heuristics_url.clone();
    job.send(Message::new("USE_HEURISTICS_REPOSITORY", vec![url.into()]))
        .await?;
    job.state.step = LaunchStep::Repository;
    Ok(())
}

async fn repository_selected(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to send the URL of the repository of heuristics").await? {
        return Ok(());
    }

    let ctx = job.ctx().clone();
    let mut heuristics = VecDeque::new();
    for id in job.state.run()?.configuration.heuristics.clone() {
        if let Some(info) = load_version(&ctx, id).await? {
            if info.version.is_ok() {
                heuristics.push_back(info.fullname());
            }
        }
    }

    if heuristics.is_empty() {
        return process_error(job, "No enabled heuristic version available".to_string(), None, true).await;
    }
    job.state.heuristics = heuristics;
    send_next_heuristic(job).await
}

async fn send_next_heuristic(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let Some(fullname) = job.state.heuristics.pop_front() else {
        return Ok(());
    };
    job.send(Message::new("USE_HEURISTIC", vec![fullname.into()]))
        .await?;
    job.state.step = LaunchStep::Heuristic;
    Ok(())
}

async fn heuristic_selected(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    if !expect_ok(job, "Failed to send the list of heuristics").await? {
        return Ok(());
    }

    if !job.state.heuristics.is_empty() {
        return send_next_heuristic(job).await;
    }

    job.log("Training the predictor...");
    job.send(Message::named("TRAIN_PREDICTOR")).await?;
    job.state.step = LaunchStep::Training;
    Ok(())
}

/// 保存 `NOTIFICATION name value...`
async fn update_notification(job: &mut Job<LaunchState>, response: &Message) -> SchedulerResult<()> {
    let Some(name) = response.param(0).map(ToString::to_string) else {
        return Ok(());
    };
    let value = response.parameters()[1..]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    set_notification(job, name, value).await
}

async fn set_notification(job: &mut Job<LaunchState>, name: String, value: String) -> SchedulerResult<()> {
    let experiments = job.ctx().repositories.experiments.clone();
    let run = job.state.run_mut()?;
    run.experiment.notifications.insert(name, value);
    experiments.update_experiment(&run.experiment).await
}

async fn training_result(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if response.is("NOTIFICATION") {
        return update_notification(job, &response).await;
    }

    let kind = job.state.run()?.kind;
    if kind == TaskKind::GoalPlanning {
        if !response.is("TRAIN_RESULT") {
            return process_error(job, "Failed to train the predictor".to_string(), Some(&response), true).await;
        }
        return start_goalplanning_test(job).await;
    }

    let Some(error) = error_rate(&response, "TRAIN_ERROR") else {
        return process_error(job, "Failed to train the predictor".to_string(), Some(&response), true).await;
    };
    record_error_rate(job, ErrorRate::Train(error)).await?;

    job.log("Testing the predictor...");
    job.send(Message::named("TEST_PREDICTOR")).await?;
    job.state.step = LaunchStep::Testing;
    Ok(())
}

fn error_rate(response: &Message, name: &str) -> Option<f64> {
    if !response.is(name) {
        return None;
    }
    match response.param(0)? {
        Value::Int(value) => Some(*value as f64),
        Value::Float(value) => Some(*value),
        Value::Str(value) => value.parse().ok(),
    }
}

enum ErrorRate {
    Train(f64),
    Test(f64),
}

/// 普通实验保存在实验上，评估实验保存为当前种子的一轮结果
async fn record_error_rate(job: &mut Job<LaunchState>, rate: ErrorRate) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;

    if !job.state.is_evaluation() {
        let run = job.state.run_mut()?;
        match rate {
            ErrorRate::Train(value) => run.experiment.train_error = Some(value),
            ErrorRate::Test(value) => run.experiment.test_error = Some(value),
        }
        return repos.experiments.update_experiment(&run.experiment).await;
    }

    let seed = job.state.current_seed();
    let experiment_id = job.state.run()?.experiment.id;
    let Some(mut results) = repos.evaluations.find_results_by_experiment(experiment_id).await? else {
        return Err(SchedulerError::not_found("评估结果", experiment_id));
    };

    let index = match results.steps.iter().position(|s| s.seed == seed) {
        Some(index) => index,
        None => {
            results.steps.push(EvaluationStep {
                seed,
                train_error: None,
                test_error: None,
            });
            results.steps.len() - 1
        }
    };
    match rate {
        ErrorRate::Train(value) => results.steps[index].train_error = Some(value),
        ErrorRate::Test(value) => results.steps[index].test_error = Some(value),
    }
    repos.evaluations.update_results(&results).await
}

async fn test_result(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if response.is("NOTIFICATION") {
        return update_notification(job, &response).await;
    }

    let Some(error) = error_rate(&response, "TEST_ERROR") else {
        return process_error(job, "Failed to test the predictor".to_string(), Some(&response), true).await;
    };
    record_error_rate(job, ErrorRate::Test(error)).await?;

    // 评估实验只在最后一轮取数据报告
    let last_round = job.state.rounds + 1 >= job.state.seeds.len();
    if !job.state.is_evaluation() || last_round {
        job.send(Message::named("REPORT_DATA")).await?;
        job.state.step = LaunchStep::DataReport;
        return Ok(());
    }
    finalize(job).await
}

async fn start_goalplanning_test(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let configuration = &job.state.run()?.configuration;
    let nb_rounds = int_setting(configuration, NB_TEST_ROUNDS).unwrap_or(1);
    let nb_max_actions = int_setting(configuration, NB_MAX_ACTIONS).unwrap_or(1000);

    job.state.goalplanning_rounds = 0;
    set_notification(job, "CURRENT_ROUND".to_string(), format!("0 {nb_rounds}")).await?;

    job.log("Testing the goal-planner...");
    job.send(Message::new(
        "TEST_PREDICTOR",
        vec![nb_rounds.into(), nb_max_actions.into()],
    ))
    .await?;
    job.state.step = LaunchStep::GoalPlanningTesting;
    Ok(())
}

fn int_setting(configuration: &Configuration, name: &str) -> Option<i64> {
    configuration.setting(name)?.trim().parse().ok()
}

/// 目标规划的测试结果：每一轮一个 `TEST_ROUND` 块，最后是 `TEST_SUMMARY` 块
async fn goalplanning_test_result(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let response = job.receive().await?;

    if response.is("NOTIFICATION") {
        return update_notification(job, &response).await;
    }

    if response.is("TEST_ROUND") {
        let round = response.str_param(0).unwrap_or_default();
        let mut results = Vec::new();
        loop {
            let response = job.receive().await?;
            match response.name() {
                "RESULT" | "SCORE" | "NB_ACTIONS_DONE" | "NB_MIMICKING_ERRORS" | "NB_NOT_RECOMMENDED_ACTIONS" => {
                    results.push(format!("{}={}", response.name(), response.str_param(0).unwrap_or_default()));
                }
                "TEST_ROUND_END" => break,
                _ => {
                    return process_error(job, "Failed to test the predictor".to_string(), Some(&response), true)
                        .await
                }
            }
        }
        job.log(format!("Round {round}: {}", results.join(", ")));

        job.state.goalplanning_rounds += 1;
        let total = int_setting(&job.state.run()?.configuration, NB_TEST_ROUNDS).unwrap_or(1);
        let progress = format!("{} {}", job.state.goalplanning_rounds, total);
        return set_notification(job, "CURRENT_ROUND".to_string(), progress).await;
    }

    if !response.is("TEST_SUMMARY") {
        return process_error(job, "Failed to test the predictor".to_string(), Some(&response), true).await;
    }

    loop {
        let response = job.receive().await?;
        match response.name() {
            "NB_GOALS_REACHED" | "NB_TASKS_FAILED" | "NB_ACTIONS_DONE" | "NB_MIMICKING_ERRORS"
            | "NB_NOT_RECOMMENDED_ACTIONS" => {
                let value = response.int_param(0).unwrap_or_default();
                job.state
                    .run_mut()?
                    .experiment
                    .summary
                    .insert(response.name().to_string(), value);
            }
            "TEST_SUMMARY_END" => break,
            _ => {
                return process_error(job, "Failed to test the predictor".to_string(), Some(&response), true).await
            }
        }
    }

    let experiments = job.ctx().repositories.experiments.clone();
    experiments.update_experiment(&job.state.run()?.experiment).await?;

    job.send(Message::named("REPORT_DATA")).await?;
    job.state.step = LaunchStep::DataReport;
    Ok(())
}

async fn data_report(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let response = job.receive().await?;

    if response.is("ERROR") {
        return process_error(job, "Failed to retrieve the data report".to_string(), Some(&response), true).await;
    }

    let size = match response.int_param(0) {
        Ok(size) if response.is("DATA") && response.parameters().len() == 1 && size >= 0 => size as usize,
        _ => return finalize(job).await,
    };

    let content = match job.receive_data(size).await {
        Ok(content) => content,
        Err(e) => {
            job.log(format!("Failed to retrieve the data report: {e}"));
            return finalize(job).await;
        }
    };

    let filename = ctx.storage.data_reports.save(&content).await?;
    let run = job.state.run_mut()?;
    run.experiment.data_report = Some(filename);
    ctx.repositories
        .experiments
        .update_experiment(&run.experiment)
        .await?;

    finalize(job).await
}

/// 实验成功完成（评估实验还有种子时开始下一轮）
async fn finalize(job: &mut Job<LaunchState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;

    job.capture_server_logs(Some(&["Predictor.log"])).await;

    if job.state.is_evaluation() {
        job.state.rounds += 1;
        if job.state.rounds < job.state.seeds.len() {
            job.log(format!("Starting the evaluation round {}", job.state.rounds + 1));
            job.send(Message::named("RESET")).await?;
            job.state.step = LaunchStep::Reset;
            return Ok(());
        }
    }

    let run = job.state.run_mut()?;
    run.experiment.end = Some(Utc::now());
    repos.experiments.update_experiment(&run.experiment).await?;

    let experiment_id = run.experiment.id;
    let experiment_type = run.configuration.experiment_type;

    let status = if experiment_type != ExperimentType::Evaluation && job.state.rounds > 0 {
        ExperimentStatus::DoneWithErrors
    } else {
        ExperimentStatus::Done
    };
    job.mark_as_done(status).await?;

    match experiment_type {
        ExperimentType::Public => ctx.emit(Event::PublicExperimentDone { experiment_id }),
        ExperimentType::Evaluation => {
            if let Some(results) = repos.evaluations.find_results_by_experiment(experiment_id).await? {
                ctx.emit(Event::HeuristicEvaluated {
                    heuristic_version_id: results.heuristic_version_id,
                });
            }
        }
        ExperimentType::Signature => {
            if let Some(signature) = repos.evaluations.find_signature_by_experiment(experiment_id).await? {
                ctx.emit(Event::HeuristicSignatureRecorded {
                    heuristic_version_id: signature.heuristic_version_id,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// 实验出错：向服务器索取错误报告，禁用出错的插件
///
/// 只有禁用了某个插件且剩下的部分仍可运行时才重试（`RESET` 后从随机种子开始），
/// 否则实验失败。
async fn process_error(
    job: &mut Job<LaunchState>,
    message: String,
    response: Option<&Message>,
    report_errors: bool,
) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let mut alert = Alert::new(message);

    if let Some(response) = response {
        alert = if response.is("ERROR") {
            alert.with_details(format!("Error: {}", response.str_param(0).unwrap_or_default()))
        } else {
            alert.with_details(format!(
                "Unknown response from the Experiment Server. Expected: OK, got: {response}"
            ))
        };
    }

    let mut can_retry = false;
    if report_errors && job.has_channel() {
        match job.request(Message::named("REPORT_ERRORS")).await {
            Ok(report) if report.is("ERROR") => {
                alert.details = Some(report.str_param(0).unwrap_or_default());
            }
            Ok(report) => match collect_error_report(job, &report).await {
                Ok(retry) => can_retry = retry,
                Err(e) => job.log(format!("Failed to process the error report: {e}")),
            },
            Err(e) => job.log(format!("Failed to retrieve the error report: {e}")),
        }
    }

    if can_retry {
        job.log(format!("ERROR - {}", alert.message));
        job.state.rounds += 1;
        job.send(Message::named("RESET")).await?;
        job.state.step = LaunchStep::Reset;
        return Ok(());
    }

    job.capture_server_logs(None).await;

    let mut public_experiment = None;
    if let Some(run) = job.state.run.as_mut() {
        run.experiment.end = Some(Utc::now());
        ctx.repositories
            .experiments
            .update_experiment(&run.experiment)
            .await?;
        if run.configuration.experiment_type == ExperimentType::Public {
            public_experiment = Some(run.experiment.id);
        }
    }

    job.mark_as_failed(alert).await?;

    if let Some(experiment_id) = public_experiment {
        ctx.emit(Event::PublicExperimentFailed { experiment_id });
    }
    Ok(())
}

/// 出错的插件
enum Culprit {
    Heuristic { version_id: i64, author: String },
    Instrument(Instrument),
    Predictor { author: Option<String> },
}

/// 解析 `HEURISTIC_*` / `INSTRUMENT_*` / `PREDICTOR_*` 错误报告，返回是否可以重试
async fn collect_error_report(job: &mut Job<LaunchState>, report: &Message) -> SchedulerResult<bool> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;
    let name = report.name().to_string();
    let (experiment_id, experiment_type, configuration) = {
        let run = job.state.run()?;
        (run.experiment.id, run.configuration.experiment_type, run.configuration.clone())
    };

    let (kind, description, culprit) = if let Some(error) = name.strip_prefix("HEURISTIC_") {
        let target = report.str_param(0)?;
        let Some((version_id, author)) = find_configuration_version(&ctx, &configuration, &target).await? else {
            return Ok(false);
        };
        let description = if error == "ERROR" {
            report.str_param(1).unwrap_or_default()
        } else {
            String::new()
        };
        (error_kind(error), description, Culprit::Heuristic { version_id, author })
    } else if let Some(error) = name.strip_prefix("INSTRUMENT_") {
        let target = report.str_param(0)?;
        let mut found = None;
        for id in &configuration.instruments {
            if let Some(instrument) = repos.experiments.find_instrument(*id).await? {
                if instrument.fullname() == target.to_lowercase() {
                    found = Some(instrument);
                    break;
                }
            }
        }
        let Some(instrument) = found else {
            return Ok(false);
        };
        let description = if error == "ERROR" {
            report.str_param(1).unwrap_or_default()
        } else {
            String::new()
        };
        (error_kind(error), description, Culprit::Instrument(instrument))
    } else if let Some(error) = name.strip_prefix("PREDICTOR_") {
        let description = if error == "ERROR" {
            report.str_param(0).unwrap_or_default()
        } else {
            String::new()
        };
        let author = configuration
            .setting(PREDICTOR)
            .and_then(|p| p.split_once('/'))
            .map(|(author, _)| author.to_string());
        (error_kind(error), description, Culprit::Predictor { author })
    } else {
        return Ok(false);
    };

    let mut error_report = ErrorReport {
        id: 0,
        heuristic_version_id: None,
        instrument_id: None,
        experiment_id: Some(experiment_id),
        kind,
        description,
        context: None,
        stacktrace: None,
    };

    let response = job.receive().await?;
    if response.is("CONTEXT") {
        error_report.context = Some(response.str_param(0).unwrap_or_default());
    }
    if kind == ErrorKind::Crash {
        let response = job.receive().await?;
        if response.is("STACKTRACE") {
            error_report.stacktrace = Some(response.str_param(0).unwrap_or_default());
        }
    }

    let (author, subject, can_retry) = match culprit {
        Culprit::Heuristic { version_id, author } => {
            error_report.heuristic_version_id = Some(version_id);
            if let Some(mut version) = repos.heuristics.find_version(version_id).await? {
                version.status = VersionStatus::Disabled;
                version.status_date = Some(Utc::now());
                repos.heuristics.update_version(&version).await?;
            }

            let mut remaining = 0;
            for id in &configuration.heuristics {
                if repos.heuristics.find_version(*id).await?.is_some_and(|v| v.is_ok()) {
                    remaining += 1;
                }
            }
            let can_retry = remaining > 0
                && experiment_type != ExperimentType::Evaluation
                && experiment_type != ExperimentType::ContestEntry;
            (Some(author), "[MASH] Your heuristic crashed during an experiment", can_retry)
        }
        Culprit::Instrument(mut instrument) => {
            error_report.instrument_id = Some(instrument.id);
            instrument.status = InstrumentStatus::Disabled;
            repos.experiments.update_instrument(&instrument).await?;
            (
                Some(instrument.author.clone()),
                "[MASH] Your instrument crashed during an experiment",
                experiment_type != ExperimentType::Evaluation,
            )
        }
        Culprit::Predictor { author } => (author, "[MASH] Your predictor crashed during an experiment", false),
    };

    let error_report = repos.heuristics.create_error_report(&error_report).await?;
    job.log(format!("Error report #{} created: {}", error_report.id, name));

    if let Some(author) = author {
        let body = error_report_body(&error_report);
        if let Err(e) = ctx.notifier.notify_user(&author, subject, &body).await {
            job.log(format!("Failed to send the error report: {e}"));
        }
    }

    Ok(can_retry)
}

fn error_kind(error: &str) -> ErrorKind {
    match error {
        "CRASH" => ErrorKind::Crash,
        "TIMEOUT" => ErrorKind::Timeout,
        _ => ErrorKind::Other,
    }
}

fn error_report_body(report: &ErrorReport) -> String {
    let mut body = format!("Error: {:?}\n", report.kind);
    if let Some(id) = report.experiment_id {
        body.push_str(&format!("Experiment: {id}\n"));
    }
    if !report.description.is_empty() {
        body.push_str(&format!("Description: {}\n", report.description));
    }
    if let Some(context) = &report.context {
        body.push_str(&format!("\nContext:\n{context}\n"));
    }
    if let Some(stacktrace) = &report.stacktrace {
        body.push_str(&format!("\nStack trace:\n{stacktrace}\n"));
    }
    body
}

/// 按 `author/name[/version]` 在配置的启发式中查找版本
async fn find_configuration_version(
    ctx: &TaskContext,
    configuration: &Configuration,
    target: &str,
) -> SchedulerResult<Option<(i64, String)>> {
    let Some((author, name, version)) = parse_heuristic_name(target) else {
        return Ok(None);
    };

    for id in &configuration.heuristics {
        if let Some(info) = load_version(ctx, *id).await? {
            if info.heuristic.author.to_lowercase() == author.to_lowercase()
                && info.heuristic.name == name
                && info.version.version == version
            {
                return Ok(Some((info.version.id, info.heuristic.author)));
            }
        }
    }
    Ok(None)
}

/// 没有版本号时为第一个版本
fn parse_heuristic_name(target: &str) -> Option<(&str, &str, u32)> {
    let parts: Vec<&str> = target.split('/').collect();
    match parts.as_slice() {
        [author, name] => Some((author, name, 1)),
        [author, name, version] => Some((author, name, version.parse().ok()?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seeds() {
        assert_eq!(parse_seeds(Some("12 34 56")), Some(vec![12, 34, 56]));
        assert_eq!(parse_seeds(Some("7")), Some(vec![7]));
        assert_eq!(parse_seeds(Some("7 x")), None);
        assert_eq!(parse_seeds(Some("")), None);
        assert_eq!(parse_seeds(None), None);
    }

    #[test]
    fn test_labels_per_evaluation_round() {
        let value = "0 1 2\r\n3 4\n\n5\n";

        assert_eq!(select_labels(value, false, 2), vec!["0", "1", "2"]);
        assert_eq!(select_labels(value, true, 1), vec!["3", "4"]);
        // 轮数超过行数时使用最后一行
        assert_eq!(select_labels(value, true, 7), vec!["5"]);
        assert!(select_labels("", true, 0).is_empty());
    }

    #[test]
    fn test_parse_heuristic_name() {
        assert_eq!(parse_heuristic_name("alice/edges"), Some(("alice", "edges", 1)));
        assert_eq!(parse_heuristic_name("alice/edges/3"), Some(("alice", "edges", 3)));
        assert_eq!(parse_heuristic_name("alice/edges/x"), None);
        assert_eq!(parse_heuristic_name("edges"), None);
    }

    #[test]
    fn test_current_seed() {
        let mut state = LaunchState {
            seeds: vec![10, 20],
            ..LaunchState::default()
        };
        assert_eq!(state.current_seed(), 10);

        state.rounds = 1;
        // 没有绑定实验时不是评估实验，始终使用第一个种子
        assert_eq!(state.current_seed(), 10);
    }

    #[test]
    fn test_error_rate() {
        let response = Message::parse("TRAIN_ERROR 0.25").unwrap();
        assert_eq!(error_rate(&response, "TRAIN_ERROR"), Some(0.25));
        assert_eq!(error_rate(&response, "TEST_ERROR"), None);
        assert_eq!(error_rate(&Message::parse("TEST_ERROR 0").unwrap(), "TEST_ERROR"), Some(0.0));
    }
}
