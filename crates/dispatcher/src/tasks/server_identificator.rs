use async_trait::async_trait;

use scheduler_core::{Alert, Message, MessageSignature, SchedulerResult};
use scheduler_domain::{commands, Command, ExperimentStatus, ServerSubtype, ServerType};

use crate::context::TaskContext;
use crate::job::{Job, JobBinding};
use crate::selection::{claim_ready_server, Handshake};
use crate::task::Task;

/// 识别服务器的类型
#[derive(Debug, Default)]
pub struct ServerIdentificator;

impl ServerIdentificator {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Default)]
pub enum IdentificationStep {
    #[default]
    Connect,
    ReadType,
}

#[async_trait]
impl Task for ServerIdentificator {
    type State = IdentificationStep;

    fn name(&self) -> &'static str {
        "ServerIdentificator"
    }

    fn supported_commands(&self) -> &'static [MessageSignature] {
        &[commands::IDENTIFY_SERVER]
    }

    async fn on_startup(&self, ctx: &TaskContext) -> SchedulerResult<Vec<Message>> {
        let servers = ctx.repositories.servers.find_by_type(ServerType::Unidentified).await?;
        Ok(servers
            .into_iter()
            .map(|server| Command::IdentifyServer { server_id: server.id }.to_message())
            .collect())
    }

    async fn step(&self, job: &mut Job<IdentificationStep>) -> SchedulerResult<()> {
        match job.state {
            IdentificationStep::Connect => connect(job).await,
            IdentificationStep::ReadType => read_type(job).await,
        }
    }
}

async fn connect(job: &mut Job<IdentificationStep>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let server_id = job.command().int_param(0)?;

    let Some(server) = ctx.repositories.servers.find_by_id(server_id).await? else {
        return job
            .mark_as_failed(Alert::new(format!("Unknown server ID: {server_id}")))
            .await;
    };

    job.log(format!(
        "Identification of the server '{}' at '{}'...",
        server.name,
        server.endpoint()
    ));

    let Some((server, channel)) = claim_ready_server(&ctx, &job.key(), vec![server], Handshake::None).await else {
        job.log("ERROR - Failed to establish a connection with the server");
        return job.retry_later().await;
    };

    job.mark_as_running(JobBinding::new().with_server(server, channel))
        .await?;
    job.send(Message::named("INFO")).await?;
    job.state = IdentificationStep::ReadType;
    Ok(())
}

async fn read_type(job: &mut Job<IdentificationStep>) -> SchedulerResult<()> {
    let ctx = job.ctx().clone();
    let Some(mut server) = job.server().cloned() else {
        return job.mark_as_failed(Alert::new("No server bound to the job")).await;
    };

    let response = job.receive().await?;
    if !response.is("TYPE") || response.parameters().len() != 1 {
        return job
            .mark_as_failed(Alert::new(format!("Unexpected response from the server: {response}")))
            .await;
    }

    let kind = response.str_param(0)?;
    let (server_type, subtype) = match kind.as_str() {
        "ExperimentServer" => (ServerType::Experiments, server.subtype),
        "CompilationServer" => (ServerType::Compilation, server.subtype),
        "ClusteringServer" => (ServerType::Clustering, server.subtype),
        "DebuggingServer" => (ServerType::Debugging, server.subtype),
        "ApplicationServer" => {
            let response = job.receive().await?;
            if !response.is("SUBTYPE") || response.parameters().len() != 1 {
                return job
                    .mark_as_failed(Alert::new(format!(
                        "Unexpected response from the application server: {response}"
                    )))
                    .await;
            }
            let subtype = match response.str_param(0)?.as_str() {
                "Images" => ServerSubtype::Images,
                "Interactive" => ServerSubtype::Interactive,
                _ => ServerSubtype::None,
            };
            (ServerType::Application, subtype)
        }
        _ => (ServerType::Unknown, server.subtype),
    };

    job.log(format!("--> {server_type:?} ({subtype:?})"));
    server.server_type = server_type;
    server.subtype = subtype;
    ctx.repositories.servers.update(&server).await?;

    job.mark_as_done(ExperimentStatus::Done).await
}
