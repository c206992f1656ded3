use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::config::models::DatabaseConfig;
use scheduler_core::{Alert, JobStatus, SchedulerError, SchedulerResult};
use scheduler_domain::entities::{AlertRecord, JobRecord};
use scheduler_domain::repositories::JobRepository;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command TEXT NOT NULL,
        status TEXT NOT NULL,
        server_id INTEGER,
        heuristic_version_id INTEGER,
        experiment_id INTEGER,
        logs_folder TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        message TEXT NOT NULL,
        details TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
];

/// SQLite连接池
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        info!("已连接数据库 {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建表结构（幂等）
    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 基于SQLite的Job仓储
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobRecord> {
        let status: String = row.try_get("status")?;
        Ok(JobRecord {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            status: JobStatus::from_str(&status)?,
            server_id: row.try_get("server_id")?,
            heuristic_version_id: row.try_get("heuristic_version_id")?,
            experiment_id: row.try_get("experiment_id")?,
            logs_folder: row.try_get("logs_folder")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<AlertRecord> {
        Ok(AlertRecord {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            message: row.try_get("message")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const JOB_COLUMNS: &str =
    "id, command, status, server_id, heuristic_version_id, experiment_id, logs_folder, created_at, updated_at";

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self))]
    async fn create(&self, command: &str) -> SchedulerResult<JobRecord> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO jobs (command, status, created_at, updated_at) VALUES ($1, $2, $3, $4) RETURNING {JOB_COLUMNS}"
        ))
        .bind(command)
        .bind(JobStatus::Scheduled.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let job = Self::row_to_job(&row)?;
        debug!("已创建Job记录 {}", job.id);
        Ok(job)
    }

    async fn update(&self, job: &JobRecord) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, server_id = $3, heuristic_version_id = $4, experiment_id = $5,
                logs_folder = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.server_id)
        .bind(job.heuristic_version_id)
        .bind(job.experiment_id)
        .bind(&job.logs_folder)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::not_found("Job", job.id));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM alerts WHERE job_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::row_to_job(&row)).transpose()
    }

    async fn find_by_statuses(&self, statuses: &[JobStatus]) -> SchedulerResult<Vec<JobRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=statuses.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({placeholders}) ORDER BY id");

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn save_alert(&self, job_id: i64, alert: &Alert) -> SchedulerResult<AlertRecord> {
        let row = sqlx::query(
            "INSERT INTO alerts (job_id, message, details, created_at) VALUES ($1, $2, $3, $4)
             RETURNING id, job_id, message, details, created_at",
        )
        .bind(job_id)
        .bind(&alert.message)
        .bind(alert.details.clone().unwrap_or_default())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_alert(&row)
    }

    async fn find_alerts(&self, job_id: i64) -> SchedulerResult<Vec<AlertRecord>> {
        let rows = sqlx::query(
            "SELECT id, job_id, message, details, created_at FROM alerts WHERE job_id = $1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_alert).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repository() -> SqliteJobRepository {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..DatabaseConfig::default()
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        manager.migrate().await.unwrap();
        SqliteJobRepository::new(manager.pool().clone())
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let repo = repository().await;

        let mut job = repo.create("RUN_EXPERIMENT 12").await.unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);

        job.status = JobStatus::Running;
        job.server_id = Some(4);
        job.experiment_id = Some(12);
        repo.update(&job).await.unwrap();

        let found = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Running);
        assert_eq!(found.server_id, Some(4));

        let pending = repo
            .find_by_statuses(&[JobStatus::Delayed, JobStatus::Running])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(repo.find_by_statuses(&[]).await.unwrap().is_empty());

        repo.delete(job.id).await.unwrap();
        assert!(repo.find_by_id(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alerts_are_linked_to_job() {
        let repo = repository().await;
        let job = repo.create("CHECK_HEURISTIC 1").await.unwrap();

        let alert = Alert::new("Unknown response").with_details("Expected: OK, got: NOPE");
        let saved = repo.save_alert(job.id, &alert).await.unwrap();
        assert_eq!(saved.job_id, job.id);

        let alerts = repo.find_alerts(job.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].details, "Expected: OK, got: NOPE");
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let repo = repository().await;
        let job = repo.create("IDENTIFY_SERVER 1").await.unwrap();
        let mut other = job.clone();
        other.id += 100;
        assert!(repo.update(&other).await.is_err());
    }
}
