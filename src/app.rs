use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info};

use scheduler_api::CommandListener;
use scheduler_core::AppConfig;
use scheduler_dispatcher::{Dispatcher, TaskContext, TaskSettings};
use scheduler_infrastructure::{
    build_notifier, metrics, DatabaseManager, FileStorage, InMemoryStore, SqliteJobRepository, TcpConnector,
};

/// 主应用程序：组装存储、调度器和命令监听器
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化调度器");

        if config.observability.metrics_enabled {
            metrics::init_metrics(&config.observability.metrics_bind_address)?;
        }

        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        database.migrate().await.context("创建数据库表结构失败")?;

        let store = Arc::new(
            InMemoryStore::open(&config.database.snapshot_path)
                .await
                .with_context(|| format!("加载存储快照失败: {}", config.database.snapshot_path))?,
        );
        let mut repositories = store.repositories();
        repositories.jobs = Arc::new(SqliteJobRepository::new(database.pool().clone()));

        let notifier = build_notifier(&config.notifications).context("创建通知器失败")?;

        let (sender, inbox) = mpsc::unbounded_channel();
        let ctx = TaskContext::new(
            repositories,
            Arc::new(
                TcpConnector::new(config.transport.connect_timeout())
                    .with_max_data_size(config.transport.max_data_size()),
            ),
            notifier,
            Arc::new(FileStorage::new(&config.paths)),
            TaskSettings::from_config(&config),
            sender,
        );

        let mut dispatcher = Dispatcher::new(ctx, inbox);
        dispatcher.register_default_tasks().context("注册任务失败")?;

        Ok(Self {
            config,
            database,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// 运行调度器和命令监听器，直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let Some(mut dispatcher) = self.dispatcher.lock().await.take() else {
            return Err(anyhow::anyhow!("调度器已经在运行"));
        };

        let listener_handle = if self.config.listener.enabled {
            let listener = CommandListener::bind(
                &self.config.listener.bind_address,
                dispatcher.command_signatures(),
                dispatcher.sender(),
            )
            .await
            .context("启动命令监听器失败")?;

            let shutdown_rx = shutdown_rx.resubscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = listener.run(shutdown_rx).await {
                    error!("命令监听器异常退出: {e}");
                }
            }))
        } else {
            info!("命令监听器已禁用");
            None
        };

        let result = dispatcher.run(shutdown_rx).await;

        // 调度器出错退出时监听器收不到关闭信号
        if let Some(handle) = listener_handle {
            handle.abort();
            let _ = handle.await;
        }
        result.context("调度器运行失败")
    }

    pub async fn close(&self) {
        self.database.close().await;
        info!("数据库连接已关闭");
    }
}
