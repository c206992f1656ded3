use flate2::read::GzDecoder;
use scheduler_core::{SchedulerError, SchedulerResult};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::unique_folder_name;
use crate::file_lock::FileLock;

const LOCK_FILE: &str = "dataReports.lock";
const PREDICTOR_DATA: &str = "predictor.data";

/// 实验服务器生成的数据报告（`.tar.gz` 归档）
#[derive(Debug, Clone)]
pub struct DataReportStore {
    root: PathBuf,
}

impl DataReportStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// 保存一份数据报告，返回相对数据报告目录的文件名
    pub async fn save(&self, content: &[u8]) -> SchedulerResult<String> {
        let filename = {
            // 只在生成文件名和创建目录时持有锁
            let _lock = FileLock::acquire(self.root.join(LOCK_FILE)).await?;
            let filename = format!("{}.tar.gz", unique_folder_name());
            if let Some(parent) = self.path(&filename).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            filename
        };

        tokio::fs::write(self.path(&filename), content).await?;
        debug!("数据报告已保存为 {} ({} 字节)", filename, content.len());
        Ok(filename)
    }

    /// 读取报告中预测器的数据（即启发式签名）
    pub async fn predictor_data(&self, filename: &str) -> SchedulerResult<Vec<u8>> {
        let path = self.path(filename);
        tokio::task::spawn_blocking(move || extract_member(&path, PREDICTOR_DATA))
            .await
            .map_err(|e| SchedulerError::Internal(format!("读取数据报告的任务失败: {e}")))?
    }
}

fn extract_member(path: &Path, member: &str) -> SchedulerResult<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let name = entry_path.to_string_lossy();
        if name == member || name.trim_start_matches("./") == member {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    Err(SchedulerError::not_found("数据报告成员", format!("{}:{member}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn build_report(members: &[(&str, &[u8])]) -> Vec<u8> {
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

    #[tokio::test]
    async fn test_save_and_extract_predictor_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataReportStore::new(dir.path());

        let report = build_report(&[
            ("configuration.xml", b"<experiment/>"),
            ("predictor.data", b"signature bytes"),
        ]);
        let filename = store.save(&report).await.unwrap();
        assert!(filename.ends_with(".tar.gz"));
        assert!(store.path(&filename).exists());

        let data = store.predictor_data(&filename).await.unwrap();
        assert_eq!(data, b"signature bytes");
    }

    #[tokio::test]
    async fn test_missing_predictor_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataReportStore::new(dir.path());

        let filename = store.save(&build_report(&[("labels.xml", b"")])).await.unwrap();
        assert!(store.predictor_data(&filename).await.is_err());
        assert!(store.predictor_data("missing.tar.gz").await.is_err());
    }
}
