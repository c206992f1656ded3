//! 领域实体
//!
//! 这些实体由外部的关系型存储持有，调度核心读取服务器的能力和状态，
//! 并回写启发式、实验和调试条目的状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 远程服务器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    Compilation,
    Experiments,
    Clustering,
    Debugging,
    Application,
    Unidentified,
    Unknown,
}

/// 应用服务器子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerSubtype {
    None,
    Images,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Unknown,
    Online,
    Offline,
}

/// 应用服务器提供的目标及其环境
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedGoal {
    pub goal: String,
    pub environments: Vec<String>,
}

/// 远程服务器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub server_type: ServerType,
    pub subtype: ServerSubtype,
    /// 只接受这种类型的实验（None表示不限）
    pub restrict_experiment: Option<ExperimentType>,
    /// 支持的实验任务ID
    pub supported_tasks: Vec<i64>,
    pub provided_databases: Vec<String>,
    pub provided_goals: Vec<ProvidedGoal>,
    pub clustering_algorithm: Option<String>,
    pub status: ServerStatus,
}

impl Server {
    pub fn provides_database(&self, name: &str) -> bool {
        self.provided_databases.iter().any(|db| db == name)
    }

    pub fn provides_goal(&self, goal: &str, environment: &str) -> bool {
        self.provided_goals
            .iter()
            .any(|g| g.goal == goal && g.environments.iter().any(|e| e == environment))
    }

    pub fn supports_task(&self, task_id: i64) -> bool {
        self.supported_tasks.contains(&task_id)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// 启发式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heuristic {
    pub id: i64,
    /// 作者用户名
    pub author: String,
    pub name: String,
    pub simple: bool,
    pub latest_public_version: Option<i64>,
}

impl Heuristic {
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.author.to_lowercase(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    Ok,
    Disabled,
    Deleted,
}

/// 启发式的一个版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicVersion {
    pub id: i64,
    pub heuristic_id: i64,
    pub version: u32,
    /// 源文件名（上传区或已验证区中的文件）
    pub filename: String,
    pub upload_date: DateTime<Utc>,
    pub status: VersionStatus,
    pub status_date: Option<DateTime<Utc>>,
    pub checked: bool,
    pub evaluated: bool,
    pub public: bool,
    pub rank: Option<i32>,
}

impl HeuristicVersion {
    pub fn absolutename(&self, heuristic: &Heuristic) -> String {
        format!("{}/{}", heuristic.fullname(), self.version)
    }

    /// 只有一个版本时省略版本号
    pub fn fullname(&self, heuristic: &Heuristic, versions_count: usize) -> String {
        if self.version > 1 || versions_count > 1 {
            self.absolutename(heuristic)
        } else {
            heuristic.fullname()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == VersionStatus::Ok
    }
}

/// 启发式检查的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestPhase {
    Status,
    Compilation,
    Analyze,
    Test,
}

/// 启发式检查进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicTestStatus {
    pub heuristic_version_id: i64,
    pub phase: TestPhase,
    pub error: bool,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Crash,
    Timeout,
    Other,
}

/// 远程服务器报告的错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: i64,
    pub heuristic_version_id: Option<i64>,
    pub instrument_id: Option<i64>,
    pub experiment_id: Option<i64>,
    pub kind: ErrorKind,
    pub description: String,
    pub context: Option<String>,
    pub stacktrace: Option<String>,
}

/// 实验类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentType {
    Public,
    Private,
    Consortium,
    Evaluation,
    ContestBase,
    ContestEntry,
    Signature,
}

/// 实验任务的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Classification,
    ObjectDetection,
    GoalPlanning,
}

/// 实验针对的任务（数据库或目标）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTask {
    pub id: i64,
    pub name: String,
    pub kind: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

/// 实验配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: i64,
    pub name: String,
    pub experiment_type: ExperimentType,
    pub task_id: i64,
    /// 参与实验的启发式版本
    pub heuristics: Vec<i64>,
    pub instruments: Vec<i64>,
    pub settings: Vec<Setting>,
}

impl Configuration {
    pub const TEMPLATE_PREFIX: &'static str = "template/";

    pub fn is_template(&self) -> bool {
        self.name.starts_with(Self::TEMPLATE_PREFIX)
    }

    /// 模板名去掉 `template/` 前缀
    pub fn base_name(&self) -> &str {
        self.name
            .strip_prefix(Self::TEMPLATE_PREFIX)
            .unwrap_or(&self.name)
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.value.as_str())
    }

    pub fn add_setting(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.settings.push(Setting {
            name: name.into(),
            value: value.into(),
        });
    }

    /// 以 `prefix/` 开头的设置，返回去掉前缀后的名称
    pub fn section_settings(&self, prefix: &str) -> Vec<(String, String)> {
        let prefix = format!("{prefix}/");
        self.settings
            .iter()
            .filter_map(|s| {
                s.name
                    .strip_prefix(&prefix)
                    .map(|name| (name.to_string(), s.value.clone()))
            })
            .collect()
    }

    pub fn database_name(&self) -> Option<&str> {
        self.setting("EXPERIMENT_SETUP/DATABASE_NAME")
    }

    pub fn goal_name(&self) -> Option<&str> {
        self.setting("EXPERIMENT_SETUP/GOAL_NAME")
    }

    pub fn environment_name(&self) -> Option<&str> {
        self.setting("EXPERIMENT_SETUP/ENVIRONMENT_NAME")
    }

    /// 从模板复制设置、仪器和实验类型，生成新的配置
    pub fn from_template(template: &Configuration, name: String) -> Configuration {
        Configuration {
            id: 0,
            name,
            experiment_type: template.experiment_type,
            task_id: template.task_id,
            heuristics: Vec::new(),
            instruments: template.instruments.clone(),
            settings: template.settings.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    Scheduled,
    Running,
    Done,
    DoneWithErrors,
    Failed,
    Deleted,
}

/// 实验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub configuration_id: i64,
    pub status: ExperimentStatus,
    pub creation_date: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// 运行过程中服务器上报的通知
    pub notifications: BTreeMap<String, String>,
    pub train_error: Option<f64>,
    pub test_error: Option<f64>,
    /// 目标规划实验的汇总结果
    pub summary: BTreeMap<String, i64>,
    /// 数据报告文件名（位于数据报告目录下）
    pub data_report: Option<String>,
}

impl Experiment {
    pub fn new(name: String, configuration_id: i64) -> Self {
        Self {
            id: 0,
            name,
            configuration_id,
            status: ExperimentStatus::Scheduled,
            creation_date: Utc::now(),
            start: None,
            end: None,
            notifications: BTreeMap::new(),
            train_error: None,
            test_error: None,
            summary: BTreeMap::new(),
            data_report: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == ExperimentStatus::Scheduled
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            ExperimentStatus::Done | ExperimentStatus::DoneWithErrors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentStatus {
    Enabled,
    Disabled,
    Builtin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: i64,
    pub author: String,
    pub name: String,
    pub status: InstrumentStatus,
}

impl Instrument {
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.author.to_lowercase(), self.name)
    }
}

/// 评估实验中一轮（一个随机种子）的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStep {
    pub seed: i64,
    pub train_error: Option<f64>,
    pub test_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub id: i64,
    pub heuristic_version_id: i64,
    /// 评估所用的模板配置
    pub evaluation_config_id: i64,
    pub experiment_id: i64,
    pub rank: Option<i32>,
    pub steps: Vec<EvaluationStep>,
}

impl EvaluationResults {
    /// 各轮测试误差的平均值，没有任何一轮给出测试误差时为 `None`
    pub fn mean_test_error(&self) -> Option<f64> {
        mean(self.steps.iter().filter_map(|step| step.test_error))
    }

    pub fn mean_train_error(&self) -> Option<f64> {
        mean(self.steps.iter().filter_map(|step| step.train_error))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// 启发式签名记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicSignature {
    pub id: i64,
    pub heuristic_version_id: i64,
    pub experiment_id: i64,
}

/// 某个签名在某个聚类算法中的处理状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureStatus {
    pub id: i64,
    pub signature_id: i64,
    pub algorithm: String,
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebuggingStatus {
    Scheduled,
    Running,
    Done,
    Failed,
}

/// 调试条目：在交互式应用服务器上记录启发式的调试帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebuggingEntry {
    pub id: i64,
    pub heuristic_version_id: i64,
    pub goal: String,
    pub environment: String,
    pub task_number: i64,
    pub sequence: i64,
    pub start_frame: i64,
    pub end_frame: i64,
    pub status: DebuggingStatus,
    pub error_details: String,
    pub obsolete: bool,
}

impl DebuggingEntry {
    /// 调试数据相对调试目录的文件名
    pub fn filename(&self) -> String {
        format!("{}/{}.data", self.heuristic_version_id, self.task_number)
    }
}

/// 持久化的Job记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    /// 线路格式的原始命令
    pub command: String,
    pub status: scheduler_core::JobStatus,
    pub server_id: Option<i64>,
    pub heuristic_version_id: Option<i64>,
    pub experiment_id: Option<i64>,
    /// 服务器日志所在目录（相对日志根目录）
    pub logs_folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 持久化的告警
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub job_id: i64,
    pub message: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}
