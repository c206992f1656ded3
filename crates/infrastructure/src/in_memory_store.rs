//! 内存中的领域存储
//!
//! 实现全部领域仓储接口。配置了快照路径时，每次修改后把全部数据以JSON写回磁盘
//! （先写临时文件再改名），启动时从快照恢复。

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{Alert, JobStatus, SchedulerError, SchedulerResult};
use scheduler_domain::entities::*;
use scheduler_domain::repositories::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 存储的全部数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreData {
    next_id: i64,
    servers: BTreeMap<i64, Server>,
    heuristics: BTreeMap<i64, Heuristic>,
    versions: BTreeMap<i64, HeuristicVersion>,
    test_statuses: BTreeMap<i64, HeuristicTestStatus>,
    error_reports: BTreeMap<i64, ErrorReport>,
    tasks: BTreeMap<i64, ExperimentTask>,
    configurations: BTreeMap<i64, Configuration>,
    experiments: BTreeMap<i64, Experiment>,
    instruments: BTreeMap<i64, Instrument>,
    evaluation_results: BTreeMap<i64, EvaluationResults>,
    signatures: BTreeMap<i64, HeuristicSignature>,
    signature_statuses: BTreeMap<i64, SignatureStatus>,
    clustering_algorithms: Vec<String>,
    debugging_entries: BTreeMap<i64, DebuggingEntry>,
    jobs: BTreeMap<i64, JobRecord>,
    alerts: BTreeMap<i64, AlertRecord>,
}

impl StoreData {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// 记录已有的ID，避免之后分配到重复的值
    fn reserve_id(&mut self, id: i64) -> i64 {
        if id <= 0 {
            return self.allocate_id();
        }
        self.next_id = self.next_id.max(id);
        id
    }

    fn delete_signature_cascade(&mut self, signature_id: i64) {
        self.signatures.remove(&signature_id);
        self.signature_statuses
            .retain(|_, status| status.signature_id != signature_id);
    }
}

/// 内存存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<StoreData>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从快照加载，文件不存在时从空存储开始
    pub async fn open(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let data: StoreData = serde_json::from_slice(&bytes)?;
                info!("已从 {} 加载存储快照", path.display());
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("存储快照 {} 不存在，使用空存储", path.display());
                StoreData::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            data: RwLock::new(data),
            snapshot_path: Some(path),
        })
    }

    /// 把同一个存储作为全部仓储使用
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            servers: self.clone(),
            heuristics: self.clone(),
            experiments: self.clone(),
            evaluations: self.clone(),
            clustering: self.clone(),
            debugging: self.clone(),
            jobs: self.clone(),
        }
    }

    async fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        let data = self.data.read().await;
        f(&data)
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut StoreData) -> SchedulerResult<R>) -> SchedulerResult<R> {
        let mut data = self.data.write().await;
        // 修改副本，快照写入成功后才替换
        let mut updated = data.clone();
        let result = f(&mut updated)?;
        if let Some(path) = &self.snapshot_path {
            Self::write_snapshot(path, &updated).await?;
        }
        *data = updated;
        Ok(result)
    }

    async fn write_snapshot(path: &Path, data: &StoreData) -> SchedulerResult<()> {
        let bytes = serde_json::to_vec_pretty(data)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temporary = path.with_extension("json.tmp");
        tokio::fs::write(&temporary, bytes).await?;
        tokio::fs::rename(&temporary, path).await?;
        debug!("存储快照已写入 {}", path.display());
        Ok(())
    }

    // 以下方法用于导入外部数据和测试准备数据，ID为0时自动分配

    pub async fn insert_server(&self, mut server: Server) -> SchedulerResult<Server> {
        self.mutate(|data| {
            server.id = data.reserve_id(server.id);
            data.servers.insert(server.id, server.clone());
            Ok(server)
        })
        .await
    }

    pub async fn insert_heuristic(&self, mut heuristic: Heuristic) -> SchedulerResult<Heuristic> {
        self.mutate(|data| {
            heuristic.id = data.reserve_id(heuristic.id);
            data.heuristics.insert(heuristic.id, heuristic.clone());
            Ok(heuristic)
        })
        .await
    }

    pub async fn insert_version(&self, mut version: HeuristicVersion) -> SchedulerResult<HeuristicVersion> {
        self.mutate(|data| {
            version.id = data.reserve_id(version.id);
            data.versions.insert(version.id, version.clone());
            Ok(version)
        })
        .await
    }

    pub async fn insert_task(&self, mut task: ExperimentTask) -> SchedulerResult<ExperimentTask> {
        self.mutate(|data| {
            task.id = data.reserve_id(task.id);
            data.tasks.insert(task.id, task.clone());
            Ok(task)
        })
        .await
    }

    pub async fn insert_instrument(&self, mut instrument: Instrument) -> SchedulerResult<Instrument> {
        self.mutate(|data| {
            instrument.id = data.reserve_id(instrument.id);
            data.instruments.insert(instrument.id, instrument.clone());
            Ok(instrument)
        })
        .await
    }

    pub async fn insert_debugging_entry(&self, mut entry: DebuggingEntry) -> SchedulerResult<DebuggingEntry> {
        self.mutate(|data| {
            entry.id = data.reserve_id(entry.id);
            data.debugging_entries.insert(entry.id, entry.clone());
            Ok(entry)
        })
        .await
    }

    pub async fn add_clustering_algorithm(&self, algorithm: &str) -> SchedulerResult<()> {
        self.mutate(|data| {
            if !data.clustering_algorithms.iter().any(|a| a == algorithm) {
                data.clustering_algorithms.push(algorithm.to_string());
            }
            Ok(())
        })
        .await
    }

    pub async fn error_reports(&self) -> Vec<ErrorReport> {
        self.read(|data| data.error_reports.values().cloned().collect()).await
    }

    pub async fn configurations(&self) -> Vec<Configuration> {
        self.read(|data| data.configurations.values().cloned().collect()).await
    }

    pub async fn experiments(&self) -> Vec<Experiment> {
        self.read(|data| data.experiments.values().cloned().collect()).await
    }
}

fn missing(kind: &'static str, id: i64) -> SchedulerError {
    SchedulerError::not_found(kind, id)
}

#[async_trait]
impl ServerRepository for InMemoryStore {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Server>> {
        Ok(self.read(|data| data.servers.get(&id).cloned()).await)
    }

    async fn find_all(&self) -> SchedulerResult<Vec<Server>> {
        Ok(self.read(|data| data.servers.values().cloned().collect()).await)
    }

    async fn find_by_type(&self, server_type: ServerType) -> SchedulerResult<Vec<Server>> {
        Ok(self
            .read(|data| {
                data.servers
                    .values()
                    .filter(|s| s.server_type == server_type)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn update(&self, server: &Server) -> SchedulerResult<()> {
        self.mutate(|data| match data.servers.get_mut(&server.id) {
            Some(existing) => {
                *existing = server.clone();
                Ok(())
            }
            None => Err(missing("服务器", server.id)),
        })
        .await
    }
}

#[async_trait]
impl HeuristicRepository for InMemoryStore {
    async fn find_heuristic(&self, id: i64) -> SchedulerResult<Option<Heuristic>> {
        Ok(self.read(|data| data.heuristics.get(&id).cloned()).await)
    }

    async fn find_all_heuristics(&self) -> SchedulerResult<Vec<Heuristic>> {
        Ok(self.read(|data| data.heuristics.values().cloned().collect()).await)
    }

    async fn find_version(&self, id: i64) -> SchedulerResult<Option<HeuristicVersion>> {
        Ok(self.read(|data| data.versions.get(&id).cloned()).await)
    }

    async fn find_all_versions(&self) -> SchedulerResult<Vec<HeuristicVersion>> {
        Ok(self.read(|data| data.versions.values().cloned().collect()).await)
    }

    async fn update_version(&self, version: &HeuristicVersion) -> SchedulerResult<()> {
        self.mutate(|data| match data.versions.get_mut(&version.id) {
            Some(existing) => {
                *existing = version.clone();
                Ok(())
            }
            None => Err(missing("启发式版本", version.id)),
        })
        .await
    }

    async fn versions_count(&self, heuristic_id: i64) -> SchedulerResult<usize> {
        Ok(self
            .read(|data| {
                data.versions
                    .values()
                    .filter(|v| v.heuristic_id == heuristic_id && v.status != VersionStatus::Deleted)
                    .count()
            })
            .await)
    }

    async fn find_test_status(&self, version_id: i64) -> SchedulerResult<Option<HeuristicTestStatus>> {
        Ok(self.read(|data| data.test_statuses.get(&version_id).cloned()).await)
    }

    async fn save_test_status(&self, status: &HeuristicTestStatus) -> SchedulerResult<()> {
        self.mutate(|data| {
            data.test_statuses
                .insert(status.heuristic_version_id, status.clone());
            Ok(())
        })
        .await
    }

    async fn delete_test_status(&self, version_id: i64) -> SchedulerResult<()> {
        self.mutate(|data| {
            data.test_statuses.remove(&version_id);
            Ok(())
        })
        .await
    }

    async fn create_error_report(&self, report: &ErrorReport) -> SchedulerResult<ErrorReport> {
        self.mutate(|data| {
            let mut report = report.clone();
            report.id = data.allocate_id();
            data.error_reports.insert(report.id, report.clone());
            Ok(report)
        })
        .await
    }
}

#[async_trait]
impl ExperimentRepository for InMemoryStore {
    async fn find_task(&self, id: i64) -> SchedulerResult<Option<ExperimentTask>> {
        Ok(self.read(|data| data.tasks.get(&id).cloned()).await)
    }

    async fn find_configuration(&self, id: i64) -> SchedulerResult<Option<Configuration>> {
        Ok(self.read(|data| data.configurations.get(&id).cloned()).await)
    }

    async fn find_configurations(&self, experiment_type: ExperimentType) -> SchedulerResult<Vec<Configuration>> {
        Ok(self
            .read(|data| {
                data.configurations
                    .values()
                    .filter(|c| c.experiment_type == experiment_type)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn create_configuration(&self, configuration: &Configuration) -> SchedulerResult<Configuration> {
        self.mutate(|data| {
            let mut configuration = configuration.clone();
            configuration.id = data.reserve_id(configuration.id);
            data.configurations
                .insert(configuration.id, configuration.clone());
            Ok(configuration)
        })
        .await
    }

    async fn update_configuration(&self, configuration: &Configuration) -> SchedulerResult<()> {
        self.mutate(|data| match data.configurations.get_mut(&configuration.id) {
            Some(existing) => {
                *existing = configuration.clone();
                Ok(())
            }
            None => Err(missing("实验配置", configuration.id)),
        })
        .await
    }

    async fn delete_configuration(&self, id: i64) -> SchedulerResult<()> {
        self.mutate(|data| {
            data.configurations.remove(&id);

            let experiments: Vec<i64> = data
                .experiments
                .values()
                .filter(|e| e.configuration_id == id)
                .map(|e| e.id)
                .collect();

            for experiment_id in experiments {
                data.experiments.remove(&experiment_id);
                data.evaluation_results
                    .retain(|_, r| r.experiment_id != experiment_id);

                let signatures: Vec<i64> = data
                    .signatures
                    .values()
                    .filter(|s| s.experiment_id == experiment_id)
                    .map(|s| s.id)
                    .collect();
                for signature_id in signatures {
                    data.delete_signature_cascade(signature_id);
                }
            }
            Ok(())
        })
        .await
    }

    async fn find_experiment(&self, id: i64) -> SchedulerResult<Option<Experiment>> {
        Ok(self.read(|data| data.experiments.get(&id).cloned()).await)
    }

    async fn find_experiment_by_configuration(&self, configuration_id: i64) -> SchedulerResult<Option<Experiment>> {
        Ok(self
            .read(|data| {
                data.experiments
                    .values()
                    .find(|e| e.configuration_id == configuration_id)
                    .cloned()
            })
            .await)
    }

    async fn find_experiments_by_status(&self, status: ExperimentStatus) -> SchedulerResult<Vec<Experiment>> {
        Ok(self
            .read(|data| {
                data.experiments
                    .values()
                    .filter(|e| e.status == status)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn create_experiment(&self, experiment: &Experiment) -> SchedulerResult<Experiment> {
        self.mutate(|data| {
            let mut experiment = experiment.clone();
            experiment.id = data.reserve_id(experiment.id);
            data.experiments.insert(experiment.id, experiment.clone());
            Ok(experiment)
        })
        .await
    }

    async fn update_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        self.mutate(|data| match data.experiments.get_mut(&experiment.id) {
            Some(existing) => {
                *existing = experiment.clone();
                Ok(())
            }
            None => Err(missing("实验", experiment.id)),
        })
        .await
    }

    async fn find_instrument(&self, id: i64) -> SchedulerResult<Option<Instrument>> {
        Ok(self.read(|data| data.instruments.get(&id).cloned()).await)
    }

    async fn update_instrument(&self, instrument: &Instrument) -> SchedulerResult<()> {
        self.mutate(|data| match data.instruments.get_mut(&instrument.id) {
            Some(existing) => {
                *existing = instrument.clone();
                Ok(())
            }
            None => Err(missing("仪器", instrument.id)),
        })
        .await
    }
}

#[async_trait]
impl EvaluationRepository for InMemoryStore {
    async fn find_all_results(&self) -> SchedulerResult<Vec<EvaluationResults>> {
        Ok(self.read(|data| data.evaluation_results.values().cloned().collect()).await)
    }

    async fn find_results_by_version(&self, version_id: i64) -> SchedulerResult<Vec<EvaluationResults>> {
        Ok(self
            .read(|data| {
                data.evaluation_results
                    .values()
                    .filter(|r| r.heuristic_version_id == version_id)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn find_results_by_experiment(&self, experiment_id: i64) -> SchedulerResult<Option<EvaluationResults>> {
        Ok(self
            .read(|data| {
                data.evaluation_results
                    .values()
                    .find(|r| r.experiment_id == experiment_id)
                    .cloned()
            })
            .await)
    }

    async fn create_results(&self, results: &EvaluationResults) -> SchedulerResult<EvaluationResults> {
        self.mutate(|data| {
            let mut results = results.clone();
            results.id = data.allocate_id();
            data.evaluation_results.insert(results.id, results.clone());
            Ok(results)
        })
        .await
    }

    async fn update_results(&self, results: &EvaluationResults) -> SchedulerResult<()> {
        self.mutate(|data| match data.evaluation_results.get_mut(&results.id) {
            Some(existing) => {
                *existing = results.clone();
                Ok(())
            }
            None => Err(missing("评估结果", results.id)),
        })
        .await
    }

    async fn delete_results(&self, id: i64) -> SchedulerResult<()> {
        self.mutate(|data| {
            data.evaluation_results.remove(&id);
            Ok(())
        })
        .await
    }

    async fn find_signature_by_version(&self, version_id: i64) -> SchedulerResult<Option<HeuristicSignature>> {
        Ok(self
            .read(|data| {
                data.signatures
                    .values()
                    .find(|s| s.heuristic_version_id == version_id)
                    .cloned()
            })
            .await)
    }

    async fn find_signature_by_experiment(&self, experiment_id: i64) -> SchedulerResult<Option<HeuristicSignature>> {
        Ok(self
            .read(|data| {
                data.signatures
                    .values()
                    .find(|s| s.experiment_id == experiment_id)
                    .cloned()
            })
            .await)
    }

    async fn find_all_signatures(&self) -> SchedulerResult<Vec<HeuristicSignature>> {
        Ok(self.read(|data| data.signatures.values().cloned().collect()).await)
    }

    async fn create_signature(&self, signature: &HeuristicSignature) -> SchedulerResult<HeuristicSignature> {
        self.mutate(|data| {
            let mut signature = signature.clone();
            signature.id = data.reserve_id(signature.id);
            data.signatures.insert(signature.id, signature.clone());
            Ok(signature)
        })
        .await
    }

    async fn delete_signature(&self, id: i64) -> SchedulerResult<()> {
        self.mutate(|data| {
            data.delete_signature_cascade(id);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ClusteringRepository for InMemoryStore {
    async fn algorithms(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.read(|data| data.clustering_algorithms.clone()).await)
    }

    async fn find_statuses(&self, algorithm: &str) -> SchedulerResult<Vec<SignatureStatus>> {
        Ok(self
            .read(|data| {
                data.signature_statuses
                    .values()
                    .filter(|s| s.algorithm == algorithm)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn create_status(&self, status: &SignatureStatus) -> SchedulerResult<SignatureStatus> {
        self.mutate(|data| {
            let mut status = status.clone();
            status.id = data.allocate_id();
            data.signature_statuses.insert(status.id, status.clone());
            Ok(status)
        })
        .await
    }

    async fn update_status(&self, status: &SignatureStatus) -> SchedulerResult<()> {
        self.mutate(|data| match data.signature_statuses.get_mut(&status.id) {
            Some(existing) => {
                *existing = status.clone();
                Ok(())
            }
            None => Err(missing("签名状态", status.id)),
        })
        .await
    }
}

#[async_trait]
impl DebuggingRepository for InMemoryStore {
    async fn find_entry(&self, id: i64) -> SchedulerResult<Option<DebuggingEntry>> {
        Ok(self.read(|data| data.debugging_entries.get(&id).cloned()).await)
    }

    async fn find_entries_by_status(&self, status: DebuggingStatus) -> SchedulerResult<Vec<DebuggingEntry>> {
        Ok(self
            .read(|data| {
                data.debugging_entries
                    .values()
                    .filter(|e| e.status == status && !e.obsolete)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn update_entry(&self, entry: &DebuggingEntry) -> SchedulerResult<()> {
        self.mutate(|data| match data.debugging_entries.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(missing("调试条目", entry.id)),
        })
        .await
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn create(&self, command: &str) -> SchedulerResult<JobRecord> {
        self.mutate(|data| {
            let now = Utc::now();
            let record = JobRecord {
                id: data.allocate_id(),
                command: command.to_string(),
                status: JobStatus::Scheduled,
                server_id: None,
                heuristic_version_id: None,
                experiment_id: None,
                logs_folder: None,
                created_at: now,
                updated_at: now,
            };
            data.jobs.insert(record.id, record.clone());
            Ok(record)
        })
        .await
    }

    async fn update(&self, job: &JobRecord) -> SchedulerResult<()> {
        self.mutate(|data| match data.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(missing("Job", job.id)),
        })
        .await
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.mutate(|data| {
            data.jobs.remove(&id);
            data.alerts.retain(|_, a| a.job_id != id);
            Ok(())
        })
        .await
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobRecord>> {
        Ok(self.read(|data| data.jobs.get(&id).cloned()).await)
    }

    async fn find_by_statuses(&self, statuses: &[JobStatus]) -> SchedulerResult<Vec<JobRecord>> {
        Ok(self
            .read(|data| {
                data.jobs
                    .values()
                    .filter(|j| statuses.contains(&j.status))
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn save_alert(&self, job_id: i64, alert: &Alert) -> SchedulerResult<AlertRecord> {
        self.mutate(|data| {
            let record = AlertRecord {
                id: data.allocate_id(),
                job_id,
                message: alert.message.clone(),
                details: alert.details.clone().unwrap_or_default(),
                created_at: Utc::now(),
            };
            data.alerts.insert(record.id, record.clone());
            Ok(record)
        })
        .await
    }

    async fn find_alerts(&self, job_id: i64) -> SchedulerResult<Vec<AlertRecord>> {
        Ok(self
            .read(|data| {
                data.alerts
                    .values()
                    .filter(|a| a.job_id == job_id)
                    .cloned()
                    .collect()
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(name: &str) -> Configuration {
        Configuration {
            id: 0,
            name: name.to_string(),
            experiment_type: ExperimentType::Public,
            task_id: 1,
            heuristics: vec![],
            instruments: vec![],
            settings: vec![],
        }
    }

    #[tokio::test]
    async fn test_delete_configuration_cascades() {
        let store = InMemoryStore::new();
        let config = store.create_configuration(&configuration("public/a")).await.unwrap();
        let experiment = store
            .create_experiment(&Experiment::new("a".to_string(), config.id))
            .await
            .unwrap();
        let signature = store
            .create_signature(&HeuristicSignature {
                id: 0,
                heuristic_version_id: 7,
                experiment_id: experiment.id,
            })
            .await
            .unwrap();
        store
            .create_status(&SignatureStatus {
                id: 0,
                signature_id: signature.id,
                algorithm: "rvcluster".to_string(),
                processed: false,
            })
            .await
            .unwrap();

        store.delete_configuration(config.id).await.unwrap();

        assert!(store.find_experiment(experiment.id).await.unwrap().is_none());
        assert!(store.find_signature_by_version(7).await.unwrap().is_none());
        assert!(store.find_statuses("rvcluster").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = InMemoryStore::open(&path).await.unwrap();
            store.add_clustering_algorithm("rvcluster").await.unwrap();
            let job = JobRepository::create(&store, "CHECK_HEURISTIC 3").await.unwrap();
            store
                .save_alert(job.id, &Alert::new("Unknown response"))
                .await
                .unwrap();
        }

        let store = InMemoryStore::open(&path).await.unwrap();
        assert_eq!(store.algorithms().await.unwrap(), vec!["rvcluster".to_string()]);

        let jobs = store.find_by_statuses(&[JobStatus::Scheduled]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].command, "CHECK_HEURISTIC 3");
        assert_eq!(store.find_alerts(jobs[0].id).await.unwrap().len(), 1);

        // 新分配的ID不会与恢复的数据冲突
        let next = JobRepository::create(&store, "IDENTIFY_SERVER 1").await.unwrap();
        assert!(next.id > jobs[0].id);
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = InMemoryStore::open(&path).await.unwrap();
        store.add_clustering_algorithm("rvcluster").await.unwrap();

        // 临时文件的位置被目录占用，快照无法写入
        tokio::fs::create_dir(path.with_extension("json.tmp")).await.unwrap();

        assert!(store.add_clustering_algorithm("kmeans").await.is_err());
        assert!(JobRepository::create(&store, "IDENTIFY_SERVER 1").await.is_err());

        assert_eq!(store.algorithms().await.unwrap(), vec!["rvcluster".to_string()]);
        assert!(store.find_by_statuses(&[JobStatus::Scheduled]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_entity_fails() {
        let store = InMemoryStore::new();
        let err = store
            .update_experiment(&Experiment::new("x".to_string(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
    }
}
