use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use scheduler_core::AppConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::Application;
use shutdown::{Shutdown, ShutdownReason};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mash-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MASH 实验服务器集群调度器")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，不指定时查找 config/mash-scheduler.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("no-listener")
                .long("no-listener")
                .help("不启动命令监听器")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if matches.get_flag("no-listener") {
        config.listener.enabled = false;
    }

    init_logging(&config.observability.log_level, &config.observability.log_format)?;
    info!("启动 MASH 调度器 {}", env!("CARGO_PKG_VERSION"));

    let app = Arc::new(Application::new(config).await?);
    let shutdown = Shutdown::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("调度器运行失败: {e:#}");
            }
            // 调度器自行退出时也结束等待信号的主任务
            shutdown.trigger(ShutdownReason::SchedulerExited);
        })
    };

    let reason = tokio::select! {
        reason = shutdown::os_signal() => reason,
        reason = shutdown.triggered() => reason,
    };
    if reason != ShutdownReason::SchedulerExited {
        info!("收到关闭信号 {:?}，开始优雅关闭...", reason);
        shutdown.trigger(reason);
    }

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("调度器已优雅关闭"),
        Ok(Err(e)) => error!("调度器关闭时发生错误: {e}"),
        Err(_) => warn!("调度器关闭超时，强制退出"),
    }

    app.close().await;
    info!("MASH 调度器已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}
