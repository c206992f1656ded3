use scheduler_core::SchedulerResult;
use std::path::{Path, PathBuf};

use crate::file_lock::FileLock;

const LOCK_FILE: &str = "debugging.lock";

/// 启发式调试数据
#[derive(Debug, Clone)]
pub struct DebuggingStore {
    root: PathBuf,
}

impl DebuggingStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// 在锁内写入调试数据，`filename` 相对调试目录
    pub async fn write(&self, filename: &str, content: &[u8]) -> SchedulerResult<PathBuf> {
        let path = self.path(filename);

        let _lock = FileLock::acquire(self.root.join(LOCK_FILE)).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_version_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = DebuggingStore::new(dir.path());

        let path = store.write("12/3.data", b"frames").await.unwrap();
        assert_eq!(path, dir.path().join("12").join("3.data"));
        assert_eq!(std::fs::read(path).unwrap(), b"frames");
    }
}
