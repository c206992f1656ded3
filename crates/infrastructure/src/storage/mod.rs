//! 调度器在磁盘上维护的文件
//!
//! 启发式源文件仓库、数据报告、聚类结果片段、调试数据和服务器日志。
//! 与网站进程共享的目录都通过锁文件互斥访问。

pub mod artifacts;
pub mod data_reports;
pub mod debugging;
pub mod server_logs;
pub mod snippets;

pub use artifacts::{slugify, ArtifactStore};
pub use data_reports::DataReportStore;
pub use debugging::DebuggingStore;
pub use server_logs::ServerLogStore;
pub use snippets::SnippetStore;

use chrono::Utc;
use scheduler_core::config::models::PathsConfig;

/// 所有文件存储
#[derive(Debug, Clone)]
pub struct FileStorage {
    pub artifacts: ArtifactStore,
    pub data_reports: DataReportStore,
    pub snippets: SnippetStore,
    pub debugging: DebuggingStore,
    pub server_logs: ServerLogStore,
}

impl FileStorage {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            artifacts: ArtifactStore::new(&paths.upload_root, &paths.heuristics_root),
            data_reports: DataReportStore::new(&paths.data_reports_root),
            snippets: SnippetStore::new(&paths.snippets_root),
            debugging: DebuggingStore::new(&paths.debugging_root),
            server_logs: ServerLogStore::new(&paths.log_files_root),
        }
    }
}

/// 生成一个按时间分层的唯一相对目录名，例如 `2026/10/18/14/03/22/<uuid>`
pub fn unique_folder_name() -> String {
    let now = Utc::now();
    format!(
        "{}/{}",
        now.format("%Y/%m/%d/%H/%M/%S"),
        uuid::Uuid::new_v4().simple()
    )
}
