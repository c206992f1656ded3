use scheduler_core::{SchedulerError, SchedulerResult};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::file_lock::FileLock;

const LOCK_FILE: &str = "repository.lock";

/// 启发式源文件仓库
///
/// 上传区保存用户刚上传、尚未检查的文件；检查通过后文件被移动到已验证区。
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_root: PathBuf,
    heuristics_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(upload_root: impl AsRef<Path>, heuristics_root: impl AsRef<Path>) -> Self {
        Self {
            upload_root: upload_root.as_ref().to_path_buf(),
            heuristics_root: heuristics_root.as_ref().to_path_buf(),
        }
    }

    pub fn upload_path(&self, author: &str, filename: &str) -> PathBuf {
        self.upload_root.join(author.to_lowercase()).join(filename)
    }

    pub fn heuristic_path(&self, author: &str, filename: &str) -> PathBuf {
        self.heuristics_root.join(author.to_lowercase()).join(filename)
    }

    /// 检查通过后的文件名：`<slug>.cpp`，第二个及以后的版本为 `<slug>_v<N>.cpp`
    pub fn verified_filename(heuristic_name: &str, version: u32) -> String {
        if version > 1 {
            format!("{}_v{}.cpp", slugify(heuristic_name), version)
        } else {
            format!("{}.cpp", slugify(heuristic_name))
        }
    }

    /// 把上传的文件移动到已验证区，返回新的文件名
    ///
    /// 两个仓库都在锁内修改，锁顺序固定为先已验证区后上传区。
    pub async fn promote(
        &self,
        author: &str,
        upload_filename: &str,
        heuristic_name: &str,
        version: u32,
    ) -> SchedulerResult<String> {
        let filename = Self::verified_filename(heuristic_name, version);
        let source = self.upload_path(author, upload_filename);
        let destination = self.heuristic_path(author, &filename);

        let _heuristics_lock = FileLock::acquire(self.heuristics_root.join(LOCK_FILE)).await?;
        let _upload_lock = FileLock::acquire(self.upload_root.join(LOCK_FILE)).await?;

        if !tokio::fs::try_exists(&source).await? {
            return Err(SchedulerError::not_found("上传文件", source.display()));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 跨文件系统时 rename 会失败，退化为复制后删除
        if tokio::fs::rename(&source, &destination).await.is_err() {
            tokio::fs::copy(&source, &destination).await?;
            tokio::fs::remove_file(&source).await?;
        }

        info!(
            "启发式文件 {} 已移动到 {}",
            source.display(),
            destination.display()
        );
        Ok(filename)
    }
}

/// 转换为只含小写字母、数字、下划线和连字符的名称，空白变成连字符
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;

    for c in value.trim().chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
    }

    slug
}
