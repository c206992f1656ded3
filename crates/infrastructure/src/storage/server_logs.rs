use scheduler_core::SchedulerResult;
use std::path::{Path, PathBuf};

use super::unique_folder_name;

/// 从服务器取回的日志文件
///
/// 每个Job的日志放在日志根目录下一个独立的子目录中，同名文件依次编号。
#[derive(Debug, Clone)]
pub struct ServerLogStore {
    root: PathBuf,
}

impl ServerLogStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn new_folder(&self) -> String {
        unique_folder_name()
    }

    pub fn folder_path(&self, folder: &str) -> PathBuf {
        self.root.join(folder)
    }

    /// 保存一个日志文件，返回实际使用的文件名
    ///
    /// `Predictor.log` 已存在时依次保存为 `Predictor2.log`、`Predictor3.log`……
    pub async fn save(&self, folder: &str, filename: &str, content: &[u8]) -> SchedulerResult<String> {
        let directory = self.folder_path(folder);
        tokio::fs::create_dir_all(&directory).await?;

        let prefix = filename.strip_suffix(".log").unwrap_or(filename);
        let existing = self.count_with_prefix(&directory, prefix).await?;
        let filename = if existing > 0 {
            format!("{}{}.log", prefix, existing + 1)
        } else {
            filename.to_string()
        };

        tokio::fs::write(directory.join(&filename), content).await?;
        Ok(filename)
    }

    /// 按名称列出目录中的日志文件及其内容
    pub async fn read_all(&self, folder: &str) -> SchedulerResult<Vec<(String, Vec<u8>)>> {
        let directory = self.folder_path(folder);
        let mut files = Vec::new();

        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let content = tokio::fs::read(entry.path()).await?;
                files.push((name, content));
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    async fn count_with_prefix(&self, directory: &Path, prefix: &str) -> SchedulerResult<usize> {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_names_are_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerLogStore::new(dir.path());
        let folder = store.new_folder();

        assert_eq!(store.save(&folder, "Predictor.log", b"a").await.unwrap(), "Predictor.log");
        assert_eq!(store.save(&folder, "Predictor.log", b"b").await.unwrap(), "Predictor2.log");
        assert_eq!(store.save(&folder, "Server.log", b"c").await.unwrap(), "Server.log");

        let files = store.read_all(&folder).await.unwrap();
        let names: Vec<_> = files.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Predictor.log", "Predictor2.log", "Server.log"]);
    }

    #[tokio::test]
    async fn test_read_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerLogStore::new(dir.path());
        assert!(store.read_all("nowhere").await.unwrap().is_empty());
    }
}
