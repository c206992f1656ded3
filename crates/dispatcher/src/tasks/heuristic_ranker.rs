use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, info};

use scheduler_core::{Alert, Message, MessageSignature, SchedulerResult};
use scheduler_domain::{
    commands, events, Command, EvaluationResults, ExperimentStatus, ExperimentType, Heuristic, HeuristicVersion,
};

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::job_queue::JobQueue;
use crate::task::Task;

/// 计算启发式版本的排名
///
/// 每个评估配置内按平均测试误差（相同时按训练误差）排名评估结果；
/// 版本的总排名按各配置标准化误差之和计算。公开版本之间互相排名，
/// 私有版本插入到公开版本的排名中，不影响公开版本的名次。
#[derive(Debug, Default)]
pub struct HeuristicRanker;

impl HeuristicRanker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Task for HeuristicRanker {
    type State = ();

    fn name(&self) -> &'static str {
        "HeuristicRanker"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::RANK_HEURISTIC_VERSION, commands::RANK_EVALUATED_HEURISTICS]
    }

    fn supported_events(&self) -> &'static [MessageSignature] {
        &[events::HEURISTIC_EVALUATED]
    }

    async fn on_event_received(
        &self,
        event: &Message,
        _queue: &JobQueue,
        _ctx: &TaskContext,
    ) -> SchedulerResult<Vec<Message>> {
        let heuristic_version_id = event.int_param(0)?;
        Ok(vec![Command::RankHeuristicVersion { heuristic_version_id }.to_message()])
    }

    async fn step(&self, job: &mut Job<()>) -> SchedulerResult<()> {
        match Command::from_message(job.command())? {
            Command::RankHeuristicVersion { heuristic_version_id } => {
                rank_heuristic_version(job, heuristic_version_id).await
            }
            _ => rank_evaluated_heuristics(job).await,
        }
    }
}

/// 排名所需的全部数据
struct Snapshot {
    heuristics: HashMap<i64, Heuristic>,
    versions: HashMap<i64, HeuristicVersion>,
    results: Vec<EvaluationResults>,
    done_experiments: HashSet<i64>,
    /// 评估模板配置
    templates: Vec<i64>,
}

impl Snapshot {
    async fn load(ctx: &TaskContext) -> SchedulerResult<Self> {
        let repos = &ctx.repositories;

        let heuristics = repos
            .heuristics
            .find_all_heuristics()
            .await?
            .into_iter()
            .map(|h| (h.id, h))
            .collect();
        let versions = repos
            .heuristics
            .find_all_versions()
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();
        let results = repos.evaluations.find_all_results().await?;

        let mut done_experiments = HashSet::new();
        let experiment_ids: BTreeSet<i64> = results.iter().map(|r| r.experiment_id).collect();
        for id in experiment_ids {
            let experiment = repos.experiments.find_experiment(id).await?;
            if experiment.is_some_and(|e| e.status == ExperimentStatus::Done) {
                done_experiments.insert(id);
            }
        }

        let templates = repos
            .experiments
            .find_configurations(ExperimentType::Evaluation)
            .await?
            .into_iter()
            .filter(|c| c.is_template())
            .map(|c| c.id)
            .collect();

        Ok(Self {
            heuristics,
            versions,
            results,
            done_experiments,
            templates,
        })
    }

    fn is_done(&self, results: &EvaluationResults) -> bool {
        self.done_experiments.contains(&results.experiment_id)
    }

    /// 版本是否是所属启发式的最新公开版本
    fn is_latest_public(&self, version: &HeuristicVersion) -> bool {
        version.public
            && self
                .heuristics
                .get(&version.heuristic_id)
                .is_some_and(|h| h.latest_public_version == Some(version.id))
    }

    fn is_latest_public_id(&self, version_id: i64) -> bool {
        self.versions
            .get(&version_id)
            .is_some_and(|v| self.is_latest_public(v))
    }

    fn error_rate(&self, version_id: i64, config_id: i64) -> Option<f64> {
        self.results
            .iter()
            .find(|r| r.heuristic_version_id == version_id && r.evaluation_config_id == config_id)
            .and_then(EvaluationResults::mean_test_error)
    }

    /// 某个配置下已排名的公开评估结果，按名次排列
    fn ranked_public(&self, config_id: i64) -> Vec<Ranked> {
        let mut ranked: Vec<_> = self
            .results
            .iter()
            .filter(|r| {
                r.evaluation_config_id == config_id
                    && r.rank.is_some()
                    && self.is_done(r)
                    && self.is_latest_public_id(r.heuristic_version_id)
            })
            .filter_map(Ranked::new)
            .collect();
        ranked.sort_by_key(|r| r.rank);
        ranked
    }

    fn set_results_rank(&mut self, results_id: i64, rank: Option<i32>) {
        if let Some(results) = self.results.iter_mut().find(|r| r.id == results_id) {
            results.rank = rank;
        }
    }
}

/// 参与名次比较的评估结果
#[derive(Debug, Clone, Copy)]
struct Ranked {
    results_id: i64,
    rank: Option<i32>,
    test_error: f64,
    train_error: f64,
}

impl Ranked {
    /// 没有测试误差的结果不参与排名
    fn new(results: &EvaluationResults) -> Option<Self> {
        Some(Self {
            results_id: results.id,
            rank: results.rank,
            test_error: results.mean_test_error()?,
            train_error: results.mean_train_error().unwrap_or(f64::INFINITY),
        })
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.test_error
            .total_cmp(&other.test_error)
            .then(self.train_error.total_cmp(&other.train_error))
    }
}

/// 把一个结果插入已排名的列表，返回它的名次
fn rank_element(test_error: f64, train_error: f64, ranked: &[Ranked]) -> i32 {
    for current in ranked {
        if test_error < current.test_error || (test_error <= current.test_error && train_error < current.train_error) {
            return current.rank.unwrap_or(1);
        }
    }
    ranked.len() as i32 + 1
}

struct Candidate {
    version_id: i64,
    score: f64,
    modifiable: bool,
}

/// 按各配置的标准化误差计算总排名，返回可修改版本的名次
fn compute_global_ranking(snapshot: &Snapshot, candidates: &mut [Candidate], configs: &[i64]) -> Vec<(i64, i32)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    for &config_id in configs {
        let rates: Option<Vec<f64>> = candidates
            .iter()
            .map(|c| snapshot.error_rate(c.version_id, config_id))
            .collect();
        // 有版本缺少这个配置的结果，或者样本太少无法标准化
        let Some(rates) = rates.filter(|rates| rates.len() > 1) else {
            continue;
        };

        let count = rates.len() as f64;
        let sum: f64 = rates.iter().sum();
        let mean = sum / count;
        let squares: f64 = rates.iter().map(|r| r * r).sum();
        let deviation = ((squares - sum * mean) / (count - 1.0)).sqrt();
        if !deviation.is_finite() || deviation == 0.0 {
            continue;
        }

        for (candidate, rate) in candidates.iter_mut().zip(rates) {
            candidate.score += (mean - rate) / deviation;
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.modifiable)
        .map(|(index, c)| (c.version_id, index as i32 + 1))
        .collect()
}

async fn rank_heuristic_version(job: &mut Job<()>, version_id: i64) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;

    let Some(mut version) = repos.heuristics.find_version(version_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown heuristic version ID: {version_id}")))
            .await;
    };

    let mut snapshot = Snapshot::load(&ctx).await?;
    let own: Vec<EvaluationResults> = snapshot
        .results
        .iter()
        .filter(|r| r.heuristic_version_id == version_id)
        .cloned()
        .collect();

    // 所有评估实验都已完成时版本才算评估完毕
    version.evaluated = !own.is_empty() && own.iter().all(|r| snapshot.is_done(r));
    repos.heuristics.update_version(&version).await?;
    snapshot.versions.insert(version.id, version.clone());

    if version.public {
        return rank_evaluated_heuristics(job).await;
    }

    job.mark_as_running(JobBinding::new().with_heuristic_version(version_id))
        .await?;

    for results in own.iter() {
        if !(results.rank.is_none() && snapshot.is_done(results)) {
            continue;
        }
        let Some(current) = Ranked::new(results) else {
            continue;
        };
        let ranked = snapshot.ranked_public(results.evaluation_config_id);
        let rank = rank_element(current.test_error, current.train_error, &ranked);

        let mut updated = results.clone();
        updated.rank = Some(rank);
        repos.evaluations.update_results(&updated).await?;
        snapshot.set_results_rank(updated.id, updated.rank);
        job.log(format!("Evaluation results #{} ranked #{}", updated.id, rank));
    }

    if version.evaluated {
        let mut candidates: Vec<Candidate> = snapshot
            .versions
            .values()
            .filter(|v| v.rank.is_some() && v.id != version_id && snapshot.is_latest_public(v))
            .map(|v| Candidate {
                version_id: v.id,
                score: 0.0,
                modifiable: false,
            })
            .collect();
        candidates.push(Candidate {
            version_id,
            score: 0.0,
            modifiable: true,
        });

        let configs: Vec<i64> = own.iter().map(|r| r.evaluation_config_id).collect();
        for (id, rank) in compute_global_ranking(&snapshot, &mut candidates, &configs) {
            version.rank = Some(rank);
            repos.heuristics.update_version(&version).await?;
            info!("启发式版本 {} 排名第 {}", id, rank);
        }
    }

    job.mark_as_done(ExperimentStatus::Done).await
}

async fn rank_evaluated_heuristics(job: &mut Job<()>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let repos = &ctx.repositories;

    job.mark_as_running(JobBinding::new()).await?;
    let mut snapshot = Snapshot::load(&ctx).await?;

    // 清空所有名次
    for results in &mut snapshot.results {
        if results.rank.take().is_some() {
            repos.evaluations.update_results(results).await?;
        }
    }
    for version in snapshot.versions.values_mut() {
        if version.rank.take().is_some() {
            repos.heuristics.update_version(version).await?;
        }
    }

    let public: Vec<i64> = {
        let mut ids: Vec<i64> = snapshot
            .versions
            .values()
            .filter(|v| v.evaluated && snapshot.is_latest_public(v))
            .map(|v| v.id)
            .collect();
        ids.sort_unstable();
        ids
    };
    let templates = snapshot.templates.clone();

    // 公开版本在每个配置中的名次
    for &config_id in &templates {
        let mut entries: Vec<Ranked> = snapshot
            .results
            .iter()
            .filter(|r| r.evaluation_config_id == config_id && public.contains(&r.heuristic_version_id))
            .filter_map(Ranked::new)
            .collect();
        entries.sort_by(Ranked::compare);

        for (index, entry) in entries.iter().enumerate() {
            let rank = Some(index as i32 + 1);
            snapshot.set_results_rank(entry.results_id, rank);
            save_results_rank(&ctx, &snapshot, entry.results_id).await?;
        }
    }

    // 公开版本的总排名
    let mut candidates: Vec<Candidate> = public
        .iter()
        .map(|&version_id| Candidate {
            version_id,
            score: 0.0,
            modifiable: true,
        })
        .collect();
    for (id, rank) in compute_global_ranking(&snapshot, &mut candidates, &templates) {
        save_version_rank(&ctx, &mut snapshot, id, rank).await?;
    }

    // 其余已完成的评估结果插入公开结果的排名
    for &config_id in &templates {
        let ranked = snapshot.ranked_public(config_id);
        let pending: Vec<Ranked> = snapshot
            .results
            .iter()
            .filter(|r| r.evaluation_config_id == config_id && r.rank.is_none() && snapshot.is_done(r))
            .filter_map(Ranked::new)
            .collect();

        for entry in pending {
            let rank = rank_element(entry.test_error, entry.train_error, &ranked);
            snapshot.set_results_rank(entry.results_id, Some(rank));
            save_results_rank(&ctx, &snapshot, entry.results_id).await?;
        }
    }

    // 其余评估完毕的版本分别插入公开版本的总排名
    let remaining: Vec<i64> = snapshot
        .versions
        .values()
        .filter(|v| v.evaluated && v.rank.is_none())
        .map(|v| v.id)
        .collect();
    for version_id in remaining {
        let mut candidates: Vec<Candidate> = public
            .iter()
            .map(|&id| Candidate {
                version_id: id,
                score: 0.0,
                modifiable: false,
            })
            .collect();
        candidates.push(Candidate {
            version_id,
            score: 0.0,
            modifiable: true,
        });

        for (id, rank) in compute_global_ranking(&snapshot, &mut candidates, &templates) {
            save_version_rank(&ctx, &mut snapshot, id, rank).await?;
        }
    }

    job.log("Ranking of the evaluated heuristics done");
    job.mark_as_done(ExperimentStatus::Done).await
}

async fn save_results_rank(ctx: &TaskContext, snapshot: &Snapshot, results_id: i64) -> SchedulerResult<()> {
    if let Some(results) = snapshot.results.iter().find(|r| r.id == results_id) {
        ctx.repositories.evaluations.update_results(results).await?;
    }
    Ok(())
}

async fn save_version_rank(ctx: &TaskContext, snapshot: &mut Snapshot, version_id: i64, rank: i32) -> SchedulerResult<()> {
    if let Some(version) = snapshot.versions.get_mut(&version_id) {
        version.rank = Some(rank);
        ctx.repositories.heuristics.update_version(version).await?;
        debug!("启发式版本 {} 排名第 {}", version_id, rank);
    }
    Ok(())
}
