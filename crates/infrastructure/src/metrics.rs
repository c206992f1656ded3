//! 调度器指标
//!
//! 指标通过 `metrics` 宏记录；启用时安装Prometheus导出器。

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub const JOBS_TOTAL: &str = "mash_jobs_total";
pub const MESSAGES_ROUTED_TOTAL: &str = "mash_messages_routed_total";
pub const JOB_DURATION_SECONDS: &str = "mash_job_duration_seconds";

/// 安装Prometheus导出器（需要在tokio运行时中调用）
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let address: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus指标导出器已在 {} 上启动", address);
    Ok(())
}

/// 记录一个Job的结束状态
pub fn record_job_finished(task: &'static str, status: &'static str, elapsed: Duration) {
    counter!(JOBS_TOTAL, "task" => task, "status" => status).increment(1);
    histogram!(JOB_DURATION_SECONDS, "task" => task).record(elapsed.as_secs_f64());
}

/// 记录一条被路由的消息
pub fn record_message_routed(kind: &'static str) {
    counter!(MESSAGES_ROUTED_TOTAL, "kind" => kind).increment(1);
}
