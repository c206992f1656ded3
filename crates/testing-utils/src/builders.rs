//! 测试实体构建器
//!
//! 默认值尽量贴近实际数据，ID为0时由存储分配。

use chrono::Utc;
use scheduler_domain::entities::*;

/// 服务器构建器
pub struct ServerBuilder {
    server: Server,
}

impl ServerBuilder {
    pub fn new(server_type: ServerType, port: u16) -> Self {
        Self {
            server: Server {
                id: 0,
                name: format!("{server_type:?}-{port}"),
                address: "127.0.0.1".to_string(),
                port,
                server_type,
                subtype: ServerSubtype::None,
                restrict_experiment: None,
                supported_tasks: Vec::new(),
                provided_databases: Vec::new(),
                provided_goals: Vec::new(),
                clustering_algorithm: None,
                status: ServerStatus::Unknown,
            },
        }
    }

    pub fn compilation(port: u16) -> Self {
        Self::new(ServerType::Compilation, port)
    }

    pub fn experiments(port: u16) -> Self {
        Self::new(ServerType::Experiments, port)
    }

    pub fn clustering(port: u16, algorithm: &str) -> Self {
        Self::new(ServerType::Clustering, port).with_algorithm(algorithm)
    }

    pub fn debugging(port: u16) -> Self {
        Self::new(ServerType::Debugging, port)
    }

    pub fn images(port: u16, database: &str) -> Self {
        Self::new(ServerType::Application, port)
            .with_subtype(ServerSubtype::Images)
            .with_database(database)
    }

    pub fn interactive(port: u16, goal: &str, environment: &str) -> Self {
        Self::new(ServerType::Application, port)
            .with_subtype(ServerSubtype::Interactive)
            .with_goal(goal, environment)
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.server.id = id;
        self
    }

    pub fn with_subtype(mut self, subtype: ServerSubtype) -> Self {
        self.server.subtype = subtype;
        self
    }

    pub fn with_database(mut self, database: &str) -> Self {
        self.server.provided_databases.push(database.to_string());
        self
    }

    pub fn with_goal(mut self, goal: &str, environment: &str) -> Self {
        self.server.provided_goals.push(ProvidedGoal {
            goal: goal.to_string(),
            environments: vec![environment.to_string()],
        });
        self
    }

    pub fn with_algorithm(mut self, algorithm: &str) -> Self {
        self.server.clustering_algorithm = Some(algorithm.to_string());
        self
    }

    pub fn supporting_task(mut self, task_id: i64) -> Self {
        self.server.supported_tasks.push(task_id);
        self
    }

    pub fn restricted_to(mut self, experiment_type: ExperimentType) -> Self {
        self.server.restrict_experiment = Some(experiment_type);
        self
    }

    pub fn build(self) -> Server {
        self.server
    }
}

pub fn heuristic(author: &str, name: &str) -> Heuristic {
    Heuristic {
        id: 0,
        author: author.to_string(),
        name: name.to_string(),
        simple: false,
        latest_public_version: None,
    }
}

/// 启发式版本构建器
pub struct VersionBuilder {
    version: HeuristicVersion,
}

impl VersionBuilder {
    pub fn new(heuristic_id: i64) -> Self {
        Self {
            version: HeuristicVersion {
                id: 0,
                heuristic_id,
                version: 1,
                filename: "heuristic.cpp".to_string(),
                upload_date: Utc::now(),
                status: VersionStatus::Ok,
                status_date: None,
                checked: false,
                evaluated: false,
                public: false,
                rank: None,
            },
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version.version = version;
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.version.filename = filename.to_string();
        self
    }

    pub fn checked(mut self) -> Self {
        self.version.checked = true;
        self
    }

    pub fn evaluated(mut self) -> Self {
        self.version.evaluated = true;
        self
    }

    pub fn public(mut self) -> Self {
        self.version.public = true;
        self
    }

    pub fn with_status(mut self, status: VersionStatus) -> Self {
        self.version.status = status;
        self
    }

    pub fn build(self) -> HeuristicVersion {
        self.version
    }
}

pub fn experiment_task(name: &str, kind: TaskKind) -> ExperimentTask {
    ExperimentTask {
        id: 0,
        name: name.to_string(),
        kind,
    }
}

/// 实验配置构建器
pub struct ConfigurationBuilder {
    configuration: Configuration,
}

impl ConfigurationBuilder {
    pub fn new(name: &str, experiment_type: ExperimentType, task_id: i64) -> Self {
        Self {
            configuration: Configuration {
                id: 0,
                name: name.to_string(),
                experiment_type,
                task_id,
                heuristics: Vec::new(),
                instruments: Vec::new(),
                settings: Vec::new(),
            },
        }
    }

    pub fn with_heuristics(mut self, heuristics: Vec<i64>) -> Self {
        self.configuration.heuristics = heuristics;
        self
    }

    pub fn with_instruments(mut self, instruments: Vec<i64>) -> Self {
        self.configuration.instruments = instruments;
        self
    }

    pub fn with_setting(mut self, name: &str, value: &str) -> Self {
        self.configuration.add_setting(name, value);
        self
    }

    pub fn build(self) -> Configuration {
        self.configuration
    }
}

pub fn instrument(author: &str, name: &str) -> Instrument {
    Instrument {
        id: 0,
        author: author.to_string(),
        name: name.to_string(),
        status: InstrumentStatus::Enabled,
    }
}

pub fn debugging_entry(heuristic_version_id: i64, goal: &str, environment: &str) -> DebuggingEntry {
    DebuggingEntry {
        id: 0,
        heuristic_version_id,
        goal: goal.to_string(),
        environment: environment.to_string(),
        task_number: 1,
        sequence: 0,
        start_frame: -1,
        end_frame: -1,
        status: DebuggingStatus::Scheduled,
        error_details: String::new(),
        obsolete: false,
    }
}

/// 构建 `.tar.gz` 格式的数据报告
pub fn data_report(members: &[(&str, &[u8])]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
