//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则。调度核心只依赖这些接口，
//! 具体存储由 infrastructure 提供。

use async_trait::async_trait;
use scheduler_core::{Alert, JobStatus, SchedulerResult};
use std::sync::Arc;

use crate::entities::*;

/// 服务器仓储抽象
#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Server>>;
    async fn find_all(&self) -> SchedulerResult<Vec<Server>>;
    async fn find_by_type(&self, server_type: ServerType) -> SchedulerResult<Vec<Server>>;
    async fn update(&self, server: &Server) -> SchedulerResult<()>;
}

/// 启发式仓储抽象
#[async_trait]
pub trait HeuristicRepository: Send + Sync {
    async fn find_heuristic(&self, id: i64) -> SchedulerResult<Option<Heuristic>>;
    async fn find_all_heuristics(&self) -> SchedulerResult<Vec<Heuristic>>;
    async fn find_version(&self, id: i64) -> SchedulerResult<Option<HeuristicVersion>>;
    async fn find_all_versions(&self) -> SchedulerResult<Vec<HeuristicVersion>>;
    async fn update_version(&self, version: &HeuristicVersion) -> SchedulerResult<()>;
    /// 未删除的版本数
    async fn versions_count(&self, heuristic_id: i64) -> SchedulerResult<usize>;
    async fn find_test_status(&self, version_id: i64) -> SchedulerResult<Option<HeuristicTestStatus>>;
    async fn save_test_status(&self, status: &HeuristicTestStatus) -> SchedulerResult<()>;
    async fn delete_test_status(&self, version_id: i64) -> SchedulerResult<()>;
    async fn create_error_report(&self, report: &ErrorReport) -> SchedulerResult<ErrorReport>;
}

/// 实验仓储抽象
#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    async fn find_task(&self, id: i64) -> SchedulerResult<Option<ExperimentTask>>;
    async fn find_configuration(&self, id: i64) -> SchedulerResult<Option<Configuration>>;
    async fn find_configurations(&self, experiment_type: ExperimentType) -> SchedulerResult<Vec<Configuration>>;
    async fn create_configuration(&self, configuration: &Configuration) -> SchedulerResult<Configuration>;
    async fn update_configuration(&self, configuration: &Configuration) -> SchedulerResult<()>;
    /// 删除配置，同时删除它的实验以及实验关联的评估结果和签名
    async fn delete_configuration(&self, id: i64) -> SchedulerResult<()>;
    async fn find_experiment(&self, id: i64) -> SchedulerResult<Option<Experiment>>;
    async fn find_experiment_by_configuration(&self, configuration_id: i64) -> SchedulerResult<Option<Experiment>>;
    async fn find_experiments_by_status(&self, status: ExperimentStatus) -> SchedulerResult<Vec<Experiment>>;
    async fn create_experiment(&self, experiment: &Experiment) -> SchedulerResult<Experiment>;
    async fn update_experiment(&self, experiment: &Experiment) -> SchedulerResult<()>;
    async fn find_instrument(&self, id: i64) -> SchedulerResult<Option<Instrument>>;
    async fn update_instrument(&self, instrument: &Instrument) -> SchedulerResult<()>;
}

/// 评估结果与签名仓储抽象
#[async_trait]
pub trait EvaluationRepository: Send + Sync {
    async fn find_all_results(&self) -> SchedulerResult<Vec<EvaluationResults>>;
    async fn find_results_by_version(&self, version_id: i64) -> SchedulerResult<Vec<EvaluationResults>>;
    async fn find_results_by_experiment(&self, experiment_id: i64) -> SchedulerResult<Option<EvaluationResults>>;
    async fn create_results(&self, results: &EvaluationResults) -> SchedulerResult<EvaluationResults>;
    async fn update_results(&self, results: &EvaluationResults) -> SchedulerResult<()>;
    async fn delete_results(&self, id: i64) -> SchedulerResult<()>;
    async fn find_signature_by_version(&self, version_id: i64) -> SchedulerResult<Option<HeuristicSignature>>;
    async fn find_signature_by_experiment(&self, experiment_id: i64) -> SchedulerResult<Option<HeuristicSignature>>;
    async fn find_all_signatures(&self) -> SchedulerResult<Vec<HeuristicSignature>>;
    async fn create_signature(&self, signature: &HeuristicSignature) -> SchedulerResult<HeuristicSignature>;
    /// 删除签名及其在各聚类算法中的处理状态
    async fn delete_signature(&self, id: i64) -> SchedulerResult<()>;
}

/// 聚类仓储抽象
#[async_trait]
pub trait ClusteringRepository: Send + Sync {
    async fn algorithms(&self) -> SchedulerResult<Vec<String>>;
    async fn find_statuses(&self, algorithm: &str) -> SchedulerResult<Vec<SignatureStatus>>;
    async fn create_status(&self, status: &SignatureStatus) -> SchedulerResult<SignatureStatus>;
    async fn update_status(&self, status: &SignatureStatus) -> SchedulerResult<()>;
}

/// 调试条目仓储抽象
#[async_trait]
pub trait DebuggingRepository: Send + Sync {
    async fn find_entry(&self, id: i64) -> SchedulerResult<Option<DebuggingEntry>>;
    async fn find_entries_by_status(&self, status: DebuggingStatus) -> SchedulerResult<Vec<DebuggingEntry>>;
    async fn update_entry(&self, entry: &DebuggingEntry) -> SchedulerResult<()>;
}

/// Job仓储抽象
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, command: &str) -> SchedulerResult<JobRecord>;
    async fn update(&self, job: &JobRecord) -> SchedulerResult<()>;
    async fn delete(&self, id: i64) -> SchedulerResult<()>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobRecord>>;
    async fn find_by_statuses(&self, statuses: &[JobStatus]) -> SchedulerResult<Vec<JobRecord>>;
    async fn save_alert(&self, job_id: i64, alert: &Alert) -> SchedulerResult<AlertRecord>;
    async fn find_alerts(&self, job_id: i64) -> SchedulerResult<Vec<AlertRecord>>;
}

/// 调度核心使用的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub servers: Arc<dyn ServerRepository>,
    pub heuristics: Arc<dyn HeuristicRepository>,
    pub experiments: Arc<dyn ExperimentRepository>,
    pub evaluations: Arc<dyn EvaluationRepository>,
    pub clustering: Arc<dyn ClusteringRepository>,
    pub debugging: Arc<dyn DebuggingRepository>,
    pub jobs: Arc<dyn JobRepository>,
}
