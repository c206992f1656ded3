use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::info;

use scheduler_core::{Alert, Message, MessageSignature, SchedulerResult};
use scheduler_domain::{
    commands, events, Command, Event, ExperimentStatus, HeuristicSignature, ServerType, SignatureStatus,
};
use scheduler_infrastructure::storage::slugify;

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::job_queue::JobQueue;
use crate::selection::{claim_ready_server, Handshake};
use crate::task::{CommandOutcome, Task};

/// 把启发式签名逐个发送到聚类服务器，取回并发布聚类结果
#[derive(Debug, Default)]
pub struct HeuristicsClusterer;

impl HeuristicsClusterer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
pub struct PendingSignature {
    status: SignatureStatus,
    absolutename: String,
    data_report: Option<String>,
}

#[derive(Debug, Default)]
pub enum ClusteringStep {
    #[default]
    Start,
    /// 等待上一个签名的 `OK`
    SignatureAck,
    Results,
}

#[derive(Debug, Default)]
pub struct ClusteringState {
    step: ClusteringStep,
    pending: VecDeque<PendingSignature>,
    sent: Vec<PendingSignature>,
}

#[async_trait]
impl Task for HeuristicsClusterer {
    type State = ClusteringState;

    fn name(&self) -> &'static str {
        "HeuristicsClusterer"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::CLUSTER_HEURISTICS]
    }

    fn supported_events(&self) -> &'static [MessageSignature] {
        &[events::HEURISTIC_SIGNATURE_RECORDED]
    }

    /// 签名数多于已处理的数量时重新聚类
    async fn on_startup(&self, ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        let done = done_signatures(ctx).await?;
        let mut commands = Vec::new();

        for algorithm in ctx.repositories.clustering.algorithms().await? {
            let processed = ctx
                .repositories
                .clustering
                .find_statuses(&algorithm)
                .await?
                .into_iter()
                .filter(|status| status.processed && done.iter().any(|s| s.id == status.signature_id))
                .count();

            if done.len() > processed {
                commands.push(Command::ClusterHeuristics { algorithm }.to_message());
            }
        }

        Ok(commands)
    }

    async fn on_command_received(
        &self,
        command: &Message,
        queue: &JobQueue,
        _ctx: &TaskContext,
    ) -> SchedulerResult<CommandOutcome> {
        if queue.has_job(command).await {
            Ok(CommandOutcome::Handled(Vec::new()))
        } else {
            Ok(CommandOutcome::Enqueue)
        }
    }

    /// 有新的签名时为每个算法安排一次聚类（已有聚类在进行时忽略）
    async fn on_event_received(
        &self,
        _event: &Message,
        queue: &JobQueue,
        ctx: &TaskContext,
    ) -> SchedulerResult<Vec<Message>> {
        if !queue.is_empty().await {
            return Ok(Vec::new());
        }

        Ok(ctx
            .repositories
            .clustering
            .algorithms()
            .await?
            .into_iter()
            .map(|algorithm| Command::ClusterHeuristics { algorithm }.to_message())
            .collect())
    }

    async fn step(&self, job: &mut Job<ClusteringState>) -> SchedulerResult<()> {
        match job.state.step {
            ClusteringStep::Start => start(job).await,
            ClusteringStep::SignatureAck => signature_acknowledged(job).await,
            ClusteringStep::Results => results_received(job).await,
        }
    }
}

/// 实验已完成的签名
async fn done_signatures(ctx: &TaskContext) -> SchedulerResult<Vec<HeuristicSignature>> {
    let mut done = Vec::new();
    for signature in ctx.repositories.evaluations.find_all_signatures().await? {
        let experiment = ctx
            .repositories
            .experiments
            .find_experiment(signature.experiment_id)
            .await?;
        if experiment.is_some_and(|e| e.status == ExperimentStatus::Done) {
            done.push(signature);
        }
    }
    Ok(done)
}

/// 尚未被该算法处理的签名，缺少的处理状态会被创建
async fn unprocessed_signatures(ctx: &TaskContext, algorithm: &str) -> SchedulerResult<Vec<PendingSignature>> {
    let repos = &ctx.repositories;
    let done = done_signatures(ctx).await?;
    let mut statuses = repos.clustering.find_statuses(algorithm).await?;

    for signature in &done {
        if !statuses.iter().any(|s| s.signature_id == signature.id) {
            let status = repos
                .clustering
                .create_status(&SignatureStatus {
                    id: 0,
                    signature_id: signature.id,
                    algorithm: algorithm.to_string(),
                    processed: false,
                })
                .await?;
            statuses.push(status);
        }
    }

    let mut pending = Vec::new();
    for status in statuses.into_iter().filter(|s| !s.processed) {
        let Some(signature) = done.iter().find(|s| s.id == status.signature_id) else {
            continue;
        };

        let absolutename = match repos.heuristics.find_version(signature.heuristic_version_id).await? {
            Some(version) => match repos.heuristics.find_heuristic(version.heuristic_id).await? {
                Some(heuristic) => version.absolutename(&heuristic),
                None => format!("heuristic-version-{}", version.id),
            },
            None => format!("heuristic-version-{}", signature.heuristic_version_id),
        };
        let data_report = repos
            .experiments
            .find_experiment(signature.experiment_id)
            .await?
            .and_then(|e| e.data_report);

        pending.push(PendingSignature {
            status,
            absolutename,
            data_report,
        });
    }

    Ok(pending)
}

async fn start(job: &mut Job<ClusteringState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let algorithm = job.command().str_param(0)?;

    job.mark_as_running(JobBinding::new()).await?;

    let pending = unprocessed_signatures(&ctx, &algorithm).await?;
    if pending.is_empty() {
        job.log("No signature to process");
        return job.mark_as_done(ExperimentStatus::Done).await;
    }

    job.log(format!(
        "Searching a free Clustering Server with the algorithm '{algorithm}'..."
    ));
    let servers: Vec<_> = ctx
        .repositories
        .servers
        .find_by_type(ServerType::Clustering)
        .await?
        .into_iter()
        .filter(|server| server.clustering_algorithm.as_deref() == Some(algorithm.as_str()))
        .collect();

    let Some((server, channel)) = claim_ready_server(&ctx, &job.key(), servers, Handshake::Status).await else {
        job.log("Failed to find a free Clustering Server");
        return job.retry_later().await;
    };

    job.mark_as_running(JobBinding::new().with_server(server, channel))
        .await?;

    job.state.pending = pending.into();
    job.state.sent.clear();
    send_next_signature(job).await
}

async fn send_next_signature(job: &mut Job<ClusteringState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let Some(signature) = job.state.pending.pop_front() else {
        return Ok(());
    };
    job.log(format!("Send the signature of heuristic '{}'...", signature.absolutename));

    let content = match &signature.data_report {
        Some(filename) => ctx.storage.data_reports.predictor_data(filename).await.ok(),
        None => None,
    };
    let Some(content) = content else {
        let alert = Alert::new(format!(
            "Failed to extract the signature of '{}'",
            signature.absolutename
        ));
        return job.mark_as_failed(alert).await;
    };

    let header = Message::new(
        "ADD_SIGNATURE",
        vec![slugify(&signature.absolutename).into(), content.len().into()],
    );
    job.state.sent.push(signature);
    job.send(header).await?;
    job.send_data(&content).await?;
    job.state.step = ClusteringStep::SignatureAck;
    Ok(())
}

async fn signature_acknowledged(job: &mut Job<ClusteringState>) -> SchedulerResult<()> {
    let response = job.receive().await?;
    if !response.is("OK") {
        let name = job
            .state
            .sent
            .last()
            .map(|s| s.absolutename.clone())
            .unwrap_or_default();
        let alert = Alert::new("Failed to send a signature")
            .with_details(format!("Signature: {name}\nResponse: {response}"));
        job.capture_server_logs(None).await;
        return job.mark_as_failed(alert).await;
    }

    if !job.state.pending.is_empty() {
        return send_next_signature(job).await;
    }

    job.log("All signatures correctly sent");
    job.send(Message::named("CLUSTER")).await?;
    job.state.step = ClusteringStep::Results;
    Ok(())
}

async fn results_received(job: &mut Job<ClusteringState>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let algorithm = job.command().str_param(0)?;

    let response = job.receive().await?;
    let size = match response.int_param(0) {
        Ok(size) if response.is("RESULTS") && size >= 0 => size as usize,
        _ => {
            let alert = Alert::new("Failed to perform the clustering").with_details(format!("Response: {response}"));
            job.capture_server_logs(None).await;
            return job.mark_as_failed(alert).await;
        }
    };

    job.log("Clustering done, retrieving the results...");
    let content = match job.receive_data(size).await {
        Ok(content) => content,
        Err(e) => {
            let alert = Alert::new("Failed to retrieve the results of the clustering")
                .with_details(format!("Response: {response}\nError: {e}"));
            return job.mark_as_failed(alert).await;
        }
    };

    for sent in &mut job.state.sent {
        sent.status.processed = true;
        ctx.repositories.clustering.update_status(&sent.status).await?;
    }

    ctx.storage
        .snippets
        .publish_clustering(&algorithm, &content)
        .await?;
    job.mark_as_done(ExperimentStatus::Done).await?;
    info!("算法 {} 的聚类结果已发布", algorithm);

    // 发送期间又记录了新的签名
    let remaining = unprocessed_signatures(&ctx, &algorithm).await?;
    if !remaining.is_empty() {
        ctx.submit(Command::ClusterHeuristics {
            algorithm: algorithm.clone(),
        });
    }
    ctx.emit(Event::HeuristicsClusteringDone { algorithm });
    Ok(())
}
