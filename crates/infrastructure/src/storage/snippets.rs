use scheduler_core::SchedulerResult;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::file_lock::FileLock;

const LOCK_FILE: &str = "snippets.lock";

/// 网站展示用的结果片段
#[derive(Debug, Clone)]
pub struct SnippetStore {
    root: PathBuf,
}

impl SnippetStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn clustering_path(&self, algorithm: &str) -> PathBuf {
        self.root.join("clustering").join(format!("{algorithm}.dat"))
    }

    /// 发布聚类结果
    ///
    /// 先写入 `<alg>.dat.tmp`，再在锁内改名，读者永远看不到写了一半的文件。
    pub async fn publish_clustering(&self, algorithm: &str, content: &[u8]) -> SchedulerResult<PathBuf> {
        let destination = self.clustering_path(algorithm);
        let temporary = destination.with_extension("dat.tmp");

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&temporary, content).await?;

        let _lock = FileLock::acquire(self.root.join(LOCK_FILE)).await?;
        tokio::fs::rename(&temporary, &destination).await?;

        info!("聚类结果已发布到 {}", destination.display());
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_replaces_previous_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnippetStore::new(dir.path());

        store.publish_clustering("rvcluster", b"first").await.unwrap();
        let path = store.publish_clustering("rvcluster", b"second").await.unwrap();

        assert_eq!(path, dir.path().join("clustering").join("rvcluster.dat"));
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("clustering").join("rvcluster.dat.tmp").exists());
    }
}
