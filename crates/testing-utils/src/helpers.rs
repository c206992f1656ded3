//! 测试环境

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::config::models::PathsConfig;
use scheduler_domain::Repositories;
use scheduler_infrastructure::{FileStorage, InMemoryStore};
use tempfile::TempDir;
use tokio::time::sleep;

use crate::mocks::{RecordingNotifier, ScriptedConnector};

pub struct TestEnv;

impl TestEnv {
    /// 等待条件成立，超时返回 `false`
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }

        condition().await
    }

    /// 测试日志，每个测试二进制调用一次即可
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

/// 临时目录中的文件存储、内存领域存储、脚本化服务器和记录通知的通知器
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub connector: Arc<ScriptedConnector>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<FileStorage>,
    pub paths: PathsConfig,
    _dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());

        Self {
            store: Arc::new(InMemoryStore::new()),
            connector: Arc::new(ScriptedConnector::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            storage: Arc::new(FileStorage::new(&paths)),
            paths,
            _dir: dir,
        }
    }

    pub fn repositories(&self) -> Repositories {
        self.store.repositories()
    }

    pub fn root(&self) -> &Path {
        self._dir.path()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn paths_in(root: &Path) -> PathsConfig {
    PathsConfig {
        upload_root: root.join("repositories/upload"),
        heuristics_root: root.join("repositories/heuristics"),
        data_reports_root: root.join("data_reports"),
        snippets_root: root.join("snippets"),
        debugging_root: root.join("debugging"),
        log_files_root: root.join("logs"),
    }
}
