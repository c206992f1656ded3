use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use scheduler_core::{Alert, JobStatus, Message, MessageSignature, SchedulerResult};
use scheduler_domain::{
    commands, events, Command, Configuration, EvaluationResults, Event, Experiment, ExperimentStatus,
    ExperimentType, HeuristicSignature, HeuristicVersion,
};

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::job_queue::JobQueue;
use crate::task::{CommandOutcome, Task};
use crate::tasks::{load_version, VersionInfo};

const ADDITIONAL_HEURISTICS: &str = "PREDICTOR_SETUP/ADDITIONAL_HEURISTICS";

/// 未评估完毕的版本的评估进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvaluationProgress {
    /// 还没有评估实验，或者有实验失败
    Missing,
    /// 还有实验在排队或运行
    InProgress,
    /// 所有实验都已完成
    Finished,
}

async fn evaluation_progress(ctx: &TaskContext, version_id: i64) -> SchedulerResult<EvaluationProgress> {
    let results = ctx.repositories.evaluations.find_results_by_version(version_id).await?;
    if results.is_empty() {
        return Ok(EvaluationProgress::Missing);
    }

    let mut finished = true;
    for result in &results {
        match ctx.repositories.experiments.find_experiment(result.experiment_id).await? {
            Some(e) if e.is_scheduled() || e.is_running() => return Ok(EvaluationProgress::InProgress),
            Some(e) if e.status == ExperimentStatus::Done => {}
            _ => finished = false,
        }
    }

    Ok(if finished {
        EvaluationProgress::Finished
    } else {
        EvaluationProgress::Missing
    })
}

/// 根据模板配置创建实验
///
/// 负责三类实验：包含所有公开启发式的公开实验、每个启发式版本的评估实验，以及签名记录实验。
/// 创建实验后向 ExperimentLauncher 提交 `RUN_EXPERIMENT`。
#[derive(Debug, Default)]
pub struct ExperimentScheduler;

impl ExperimentScheduler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Task for ExperimentScheduler {
    type State = ();

    fn name(&self) -> &'static str {
        "ExperimentScheduler"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[
            commands::SCHEDULE_PUBLIC_EXPERIMENTS,
            commands::SCHEDULE_HEURISTIC_EVALUATION,
            commands::EVALUATE_ALL_HEURISTICS,
            commands::SCHEDULE_HEURISTIC_SIGNATURE_RECORDING,
            commands::RECORD_ALL_HEURISTIC_SIGNATURES,
        ]
    }

    fn supported_events(&self) -> &'static [MessageSignature] {
        &[
            events::HEURISTIC_CHECKED,
            events::PUBLIC_EXPERIMENT_DONE,
            events::PUBLIC_EXPERIMENT_FAILED,
            events::EXPERIMENT_CANCELLED,
        ]
    }

    async fn on_startup(&self, ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        let mut commands = vec![Command::SchedulePublicExperiments.to_message()];

        for version in schedulable_versions(ctx).await? {
            if version.evaluated {
                continue;
            }
            match evaluation_progress(ctx, version.id).await? {
                EvaluationProgress::InProgress => {}
                // 实验都已完成但排名丢失
                EvaluationProgress::Finished => ctx.submit(Command::RankHeuristicVersion {
                    heuristic_version_id: version.id,
                }),
                EvaluationProgress::Missing => commands.push(
                    Command::ScheduleHeuristicEvaluation {
                        heuristic_version_id: version.id,
                    }
                    .to_message(),
                ),
            }
        }

        for version in schedulable_versions(ctx).await? {
            let signature = ctx.repositories.evaluations.find_signature_by_version(version.id).await?;
            if signature.is_none() {
                commands.push(
                    Command::ScheduleHeuristicSignatureRecording {
                        heuristic_version_id: version.id,
                    }
                    .to_message(),
                );
            }
        }

        Ok(commands)
    }

    async fn on_command_received(
        &self,
        command: &Message,
        queue: &JobQueue,
        ctx: &TaskContext,
    ) -> SchedulerResult<CommandOutcome> {
        match Command::from_message(command)? {
            Command::SchedulePublicExperiments => {
                let jobs = queue.get_jobs(command).await;
                let Some(job) = jobs.first() else {
                    return Ok(CommandOutcome::Enqueue);
                };
                // 正在等待重试的 Job 立即重新执行
                if job.status() == JobStatus::Delayed {
                    job.wake();
                }
                Ok(CommandOutcome::Handled(Vec::new()))
            }
            Command::EvaluateAllHeuristics => {
                let commands = schedulable_versions(ctx)
                    .await?
                    .into_iter()
                    .map(|version| {
                        Command::ScheduleHeuristicEvaluation {
                            heuristic_version_id: version.id,
                        }
                        .to_message()
                    })
                    .collect();
                Ok(CommandOutcome::Handled(commands))
            }
            Command::RecordAllHeuristicSignatures => {
                let commands = schedulable_versions(ctx)
                    .await?
                    .into_iter()
                    .map(|version| {
                        Command::ScheduleHeuristicSignatureRecording {
                            heuristic_version_id: version.id,
                        }
                        .to_message()
                    })
                    .collect();
                Ok(CommandOutcome::Handled(commands))
            }
            _ => Ok(CommandOutcome::Enqueue),
        }
    }

    async fn on_event_received(
        &self,
        event: &Message,
        _queue: &JobQueue,
        ctx: &TaskContext,
    ) -> SchedulerResult<Vec<Message>> {
        match Event::from_message(event)? {
            Event::HeuristicChecked { heuristic_version_id } => {
                let Some(info) = load_version(ctx, heuristic_version_id).await? else {
                    warn!("未知的启发式版本: {}", heuristic_version_id);
                    return Ok(Vec::new());
                };
                if info.heuristic.simple {
                    return Ok(Vec::new());
                }
                Ok(vec![
                    Command::ScheduleHeuristicEvaluation { heuristic_version_id }.to_message(),
                    Command::ScheduleHeuristicSignatureRecording { heuristic_version_id }.to_message(),
                ])
            }
            Event::PublicExperimentDone { .. } | Event::PublicExperimentFailed { .. } => {
                Ok(vec![Command::SchedulePublicExperiments.to_message()])
            }
            Event::ExperimentCancelled { experiment_id } => experiment_cancelled(ctx, experiment_id).await,
            _ => Ok(Vec::new()),
        }
    }

    async fn step(&self, job: &mut Job<()>) -> SchedulerResult<()> {
        match Command::from_message(job.command())? {
            Command::SchedulePublicExperiments => schedule_public_experiments(job).await,
            Command::ScheduleHeuristicEvaluation { heuristic_version_id } => {
                schedule_evaluation(job, heuristic_version_id).await
            }
            Command::ScheduleHeuristicSignatureRecording { heuristic_version_id } => {
                schedule_signature_recording(job, heuristic_version_id).await
            }
            other => {
                job.mark_as_failed(Alert::new(format!("Unsupported command: {}", other.to_message())))
                    .await
            }
        }
    }
}

/// 已检查、可用且不是简单启发式的版本
async fn schedulable_versions(ctx: &TaskContext) -> SchedulerResult<Vec<HeuristicVersion>> {
    let heuristics = &ctx.repositories.heuristics;
    let simple: Vec<i64> = heuristics
        .find_all_heuristics()
        .await?
        .into_iter()
        .filter(|h| h.simple)
        .map(|h| h.id)
        .collect();

    Ok(heuristics
        .find_all_versions()
        .await?
        .into_iter()
        .filter(|v| v.checked && v.is_ok() && !simple.contains(&v.heuristic_id))
        .collect())
}

/// 被取消的实验需要重新安排
async fn experiment_cancelled(ctx: &TaskContext, experiment_id: i64) -> SchedulerResult<Vec<Message>> {
    let repos = &ctx.repositories;
    let Some(experiment) = repos.experiments.find_experiment(experiment_id).await? else {
        return Ok(Vec::new());
    };
    let Some(configuration) = repos
        .experiments
        .find_configuration(experiment.configuration_id)
        .await?
    else {
        return Ok(Vec::new());
    };

    let mut commands = Vec::new();
    match configuration.experiment_type {
        ExperimentType::Public => commands.push(Command::SchedulePublicExperiments.to_message()),
        ExperimentType::Evaluation => {
            if let Some(results) = repos.evaluations.find_results_by_experiment(experiment.id).await? {
                let version_id = results.heuristic_version_id;
                repos.evaluations.delete_results(results.id).await?;

                let remaining = repos.evaluations.find_results_by_version(version_id).await?;
                let version = repos.heuristics.find_version(version_id).await?;
                if remaining.is_empty() && version.is_some_and(|v| v.is_ok()) {
                    commands.push(
                        Command::ScheduleHeuristicEvaluation {
                            heuristic_version_id: version_id,
                        }
                        .to_message(),
                    );
                }
            }
        }
        ExperimentType::Signature => {
            if let Some(signature) = repos.evaluations.find_signature_by_experiment(experiment.id).await? {
                let version_id = signature.heuristic_version_id;
                repos.evaluations.delete_signature(signature.id).await?;

                let version = repos.heuristics.find_version(version_id).await?;
                if version.is_some_and(|v| v.is_ok()) {
                    commands.push(
                        Command::ScheduleHeuristicSignatureRecording {
                            heuristic_version_id: version_id,
                        }
                        .to_message(),
                    );
                }
            }
        }
        _ => {}
    }

    repos.experiments.delete_configuration(configuration.id).await?;
    Ok(commands)
}

/// 为每个公开模板创建包含最新公开启发式的实验
async fn schedule_public_experiments(job: &mut Job<()>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;
    job.mark_as_running(JobBinding::new()).await?;

    let configurations = repos.experiments.find_configurations(ExperimentType::Public).await?;
    let current: Vec<i64> = repos
        .heuristics
        .find_all_heuristics()
        .await?
        .into_iter()
        .filter(|h| !h.simple)
        .filter_map(|h| h.latest_public_version)
        .collect();

    for template in configurations.iter().filter(|c| c.is_template()) {
        let base = template.base_name().to_string();

        // 同一模板最近一次的实验
        let mut previous: Option<(&Configuration, Experiment)> = None;
        for configuration in configurations
            .iter()
            .filter(|c| !c.is_template() && c.name.starts_with(&base))
        {
            if let Some(experiment) = repos
                .experiments
                .find_experiment_by_configuration(configuration.id)
                .await?
            {
                let newer = previous
                    .as_ref()
                    .map(|(_, p)| experiment.creation_date > p.creation_date)
                    .unwrap_or(true);
                if newer {
                    previous = Some((configuration, experiment));
                }
            }
        }

        if previous.as_ref().is_some_and(|(_, e)| e.is_running()) {
            job.log(format!("Public experiment '{base}' still running"));
            continue;
        }

        let used: &[i64] = previous.as_ref().map(|(c, _)| c.heuristics.as_slice()).unwrap_or(&[]);
        if current.iter().all(|id| used.contains(id)) {
            continue;
        }

        if let Some((_, experiment)) = previous.as_ref().filter(|(_, e)| e.is_scheduled()) {
            // 取消后由 EXPERIMENT_CANCELLED 事件重新安排
            ctx.submit(Command::CancelExperiment {
                experiment_id: experiment.id,
            });
            continue;
        }

        let name = format!("{}/{}", base, Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let mut configuration = Configuration::from_template(template, name);
        configuration.heuristics = current.clone();
        let experiment = create_experiment(&ctx, configuration).await?;

        job.log(format!("Public experiment '{}' scheduled", experiment.name));
        ctx.submit(Command::RunExperiment {
            experiment_id: experiment.id,
        });
    }

    job.mark_as_done(ExperimentStatus::Done).await
}

async fn schedule_evaluation(job: &mut Job<()>, version_id: i64) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;

    let Some(mut info) = load_version(&ctx, version_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown heuristic version ID: {version_id}")))
            .await;
    };
    job.mark_as_running(JobBinding::new().with_heuristic_version(version_id))
        .await?;

    let results = repos.evaluations.find_results_by_version(version_id).await?;

    if info.version.evaluated {
        // 重新评估：丢弃之前的结果
        for result in &results {
            delete_results(&ctx, result).await?;
        }
        info.version.evaluated = false;
        info.version.rank = None;
        repos.heuristics.update_version(&info.version).await?;
    } else if !results.is_empty() {
        // 评估正在进行：取消运行中的实验，其余的直接删除
        for result in &results {
            let experiment = repos.experiments.find_experiment(result.experiment_id).await?;
            if experiment.is_some_and(|e| e.is_running()) {
                ctx.submit(Command::CancelExperiment {
                    experiment_id: result.experiment_id,
                });
            } else {
                delete_results(&ctx, result).await?;
            }
        }
        return job.mark_as_done(ExperimentStatus::Done).await;
    }

    let templates: Vec<Configuration> = repos
        .experiments
        .find_configurations(ExperimentType::Evaluation)
        .await?
        .into_iter()
        .filter(|c| c.is_template())
        .collect();

    if templates.is_empty() {
        return job
            .mark_as_failed(Alert::new("No evaluation configuration found"))
            .await;
    }

    for template in &templates {
        let configuration = evaluation_configuration(template, &info);
        let experiment = create_experiment(&ctx, configuration).await?;

        repos
            .evaluations
            .create_results(&EvaluationResults {
                id: 0,
                heuristic_version_id: version_id,
                evaluation_config_id: template.id,
                experiment_id: experiment.id,
                rank: None,
                steps: Vec::new(),
            })
            .await?;

        job.log(format!("Evaluation experiment '{}' scheduled", experiment.name));
        ctx.submit(Command::RunExperiment {
            experiment_id: experiment.id,
        });
    }

    job.mark_as_done(ExperimentStatus::Done).await
}

fn evaluation_configuration(template: &Configuration, info: &VersionInfo) -> Configuration {
    let name = template
        .name
        .replacen(Configuration::TEMPLATE_PREFIX, &format!("{}/", info.fullname()), 1);
    let mut configuration = Configuration::from_template(template, name);
    configuration.heuristics = template.heuristics.clone();

    if template.heuristics.contains(&info.version.id) {
        configuration.add_setting(ADDITIONAL_HEURISTICS, info.absolutename());
    } else {
        configuration.heuristics.push(info.version.id);
    }
    configuration
}

async fn schedule_signature_recording(job: &mut Job<()>, version_id: i64) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;

    let Some(info) = load_version(&ctx, version_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown heuristic version ID: {version_id}")))
            .await;
    };
    job.mark_as_running(JobBinding::new().with_heuristic_version(version_id))
        .await?;

    if let Some(signature) = repos.evaluations.find_signature_by_version(version_id).await? {
        let experiment = repos.experiments.find_experiment(signature.experiment_id).await?;
        match experiment {
            Some(experiment) if experiment.is_running() || experiment.is_scheduled() => {
                // 取消后由 EXPERIMENT_CANCELLED 事件重新记录
                ctx.submit(Command::CancelExperiment {
                    experiment_id: experiment.id,
                });
                return job.mark_as_done(ExperimentStatus::Done).await;
            }
            Some(experiment) => {
                repos.evaluations.delete_signature(signature.id).await?;
                repos
                    .experiments
                    .delete_configuration(experiment.configuration_id)
                    .await?;
            }
            None => repos.evaluations.delete_signature(signature.id).await?,
        }
    }

    let template = repos
        .experiments
        .find_configurations(ExperimentType::Signature)
        .await?
        .into_iter()
        .find(|c| c.is_template());

    let Some(template) = template else {
        return job
            .mark_as_failed(Alert::new("No signature recording configuration found"))
            .await;
    };

    let name = template
        .name
        .replacen(Configuration::TEMPLATE_PREFIX, &format!("{}/", info.fullname()), 1);
    let mut configuration = Configuration::from_template(&template, name);
    configuration.heuristics = vec![version_id];
    configuration.instruments.clear();
    let experiment = create_experiment(&ctx, configuration).await?;

    repos
        .evaluations
        .create_signature(&HeuristicSignature {
            id: 0,
            heuristic_version_id: version_id,
            experiment_id: experiment.id,
        })
        .await?;

    info!("启发式 {} 的签名记录实验已创建", info.fullname());
    ctx.submit(Command::RunExperiment {
        experiment_id: experiment.id,
    });
    job.mark_as_done(ExperimentStatus::Done).await
}

async fn create_experiment(ctx: &TaskContext, configuration: Configuration) -> SchedulerResult<Experiment> {
    let experiments = &ctx.repositories.experiments;
    let configuration = experiments.create_configuration(&configuration).await?;
    experiments
        .create_experiment(&Experiment::new(configuration.name.clone(), configuration.id))
        .await
}

/// 删除评估结果及其实验配置
async fn delete_results(ctx: &TaskContext, results: &EvaluationResults) -> SchedulerResult<()> {
    let repos = &ctx.repositories;
    let experiment = repos.experiments.find_experiment(results.experiment_id).await?;
    repos.evaluations.delete_results(results.id).await?;
    if let Some(experiment) = experiment {
        repos
            .experiments
            .delete_configuration(experiment.configuration_id)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::{Heuristic, Setting, VersionStatus};

    fn version_info(version: u32) -> VersionInfo {
        VersionInfo {
            heuristic: Heuristic {
                id: 1,
                author: "Alice".to_string(),
                name: "edges".to_string(),
                simple: false,
                latest_public_version: None,
            },
            version: HeuristicVersion {
                id: 42,
                heuristic_id: 1,
                version,
                filename: "edges.cpp".to_string(),
                upload_date: Utc::now(),
                status: VersionStatus::Ok,
                status_date: None,
                checked: true,
                evaluated: false,
                public: false,
                rank: None,
            },
            versions_count: version as usize,
        }
    }

    fn template(heuristics: Vec<i64>) -> Configuration {
        Configuration {
            id: 7,
            name: "template/mnist".to_string(),
            experiment_type: ExperimentType::Evaluation,
            task_id: 3,
            heuristics,
            instruments: vec![5],
            settings: vec![Setting {
                name: "USE_PREDICTOR".to_string(),
                value: "sandbox/predictors/svm".to_string(),
            }],
        }
    }

    #[test]
    fn test_evaluation_configuration_adds_version() {
        let configuration = evaluation_configuration(&template(vec![10]), &version_info(1));

        assert_eq!(configuration.name, "alice/edges/mnist");
        assert_eq!(configuration.heuristics, vec![10, 42]);
        assert_eq!(configuration.instruments, vec![5]);
        assert_eq!(configuration.setting("USE_PREDICTOR"), Some("sandbox/predictors/svm"));
        assert_eq!(configuration.setting(ADDITIONAL_HEURISTICS), None);
    }

    #[test]
    fn test_evaluation_configuration_with_version_in_template() {
        let configuration = evaluation_configuration(&template(vec![42]), &version_info(2));

        assert_eq!(configuration.name, "alice/edges/2/mnist");
        assert_eq!(configuration.heuristics, vec![42]);
        assert_eq!(configuration.setting(ADDITIONAL_HEURISTICS), Some("alice/edges/2"));
    }
}
