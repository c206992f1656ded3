use fs2::FileExt;
use scheduler_core::SchedulerResult;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 基于文件的排他锁
///
/// 网站进程和调度器共享同一个锁文件；守卫在释放时解锁，任何返回路径都不会遗留锁。
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// 获取锁，必要时创建锁文件所在目录（阻塞操作放到阻塞线程池中执行）
    pub async fn acquire(path: impl AsRef<Path>) -> SchedulerResult<FileLock> {
        let path = path.as_ref().to_path_buf();
        let lock = tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| scheduler_core::SchedulerError::Internal(format!("获取文件锁的任务失败: {e}")))??;
        Ok(lock)
    }

    fn acquire_blocking(path: PathBuf) -> SchedulerResult<FileLock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        debug!("已获取文件锁 {}", path.display());

        Ok(FileLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("释放文件锁 {} 失败: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.lock");

        let guard = FileLock::acquire(&path).await.unwrap();
        assert!(path.exists());

        let contender = {
            let path = path.clone();
            tokio::spawn(async move { FileLock::acquire(path).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
