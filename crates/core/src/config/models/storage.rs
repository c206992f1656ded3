use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 保存Job和告警的SQLite数据库
    pub url: String,
    pub max_connections: u32,
    /// 领域数据（服务器、启发式、实验……）的快照文件
    pub snapshot_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://mash-scheduler.db?mode=rwc".to_string(),
            max_connections: 5,
            snapshot_path: "data/mash-store.json".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是sqlite格式: {}", self.url));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        Ok(())
    }
}

/// 文件存储路径
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// 用户上传的启发式
    pub upload_root: PathBuf,
    /// 检查通过的启发式
    pub heuristics_root: PathBuf,
    pub data_reports_root: PathBuf,
    pub snippets_root: PathBuf,
    pub debugging_root: PathBuf,
    /// 从远程服务器收集的日志
    pub log_files_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("repositories/upload"),
            heuristics_root: PathBuf::from("repositories/heuristics"),
            data_reports_root: PathBuf::from("data_reports"),
            snippets_root: PathBuf::from("snippets"),
            debugging_root: PathBuf::from("debugging"),
            log_files_root: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let paths = [
            ("upload_root", &self.upload_root),
            ("heuristics_root", &self.heuristics_root),
            ("data_reports_root", &self.data_reports_root),
            ("snippets_root", &self.snippets_root),
            ("debugging_root", &self.debugging_root),
            ("log_files_root", &self.log_files_root),
        ];

        for (name, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(anyhow::anyhow!("路径 {name} 不能为空"));
            }
        }

        if self.upload_root == self.heuristics_root {
            return Err(anyhow::anyhow!("上传目录和启发式目录不能相同"));
        }

        Ok(())
    }
}

/// 远程服务器下载启发式时使用的仓库地址
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoriesConfig {
    pub upload_url: String,
    pub heuristics_url: String,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            upload_url: "http://localhost/repositories/upload".to_string(),
            heuristics_url: "http://localhost/repositories/heuristics".to_string(),
        }
    }
}

impl RepositoriesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upload_url.is_empty() || self.heuristics_url.is_empty() {
            return Err(anyhow::anyhow!("仓库地址不能为空"));
        }
        Ok(())
    }
}
