use std::net::SocketAddr;
use std::sync::Arc;

use metrics::counter;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use scheduler_core::{Channel, Message, MessageSignature, SchedulerError, SchedulerResult, Value};
use scheduler_infrastructure::transport::TcpChannel;

/// 监听器实现的协议版本
pub const PROTOCOL: &str = "1.2";

const CONNECTIONS_TOTAL: &str = "mash_listener_connections_total";

/// 对一条请求的处理结果
#[derive(Debug, PartialEq)]
enum Action {
    Reply(Vec<Message>),
    ReplyAndClose(Message),
}

/// 命令监听器
///
/// 每个客户端连接由独立的 tokio 任务处理；已注册的命令写入调度器的收件箱，
/// 监听器本身不等待命令的执行结果。
pub struct CommandListener {
    listener: TcpListener,
    commands: Arc<Vec<MessageSignature>>,
    sender: mpsc::UnboundedSender<Message>,
}

impl CommandListener {
    pub async fn bind(
        address: &str,
        commands: Vec<MessageSignature>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> SchedulerResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| SchedulerError::Network(format!("无法监听 {address}: {e}")))?;

        Ok(Self {
            listener,
            commands: Arc::new(commands),
            sender,
        })
    }

    pub fn local_addr(&self) -> SchedulerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到关闭信号；关闭时同时断开所有客户端
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!("命令监听器已在 {} 上启动", self.local_addr()?);
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("命令监听器收到关闭信号");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("新的客户端连接: {}", peer);
                        counter!(CONNECTIONS_TOTAL).increment(1);
                        let channel = TcpChannel::new(stream, peer.to_string());
                        clients.spawn(serve(channel, self.commands.clone(), self.sender.clone()));
                    }
                    Err(e) => warn!("接受连接失败: {}", e),
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        clients.shutdown().await;
        Ok(())
    }
}

async fn serve(mut channel: TcpChannel, commands: Arc<Vec<MessageSignature>>, sender: mpsc::UnboundedSender<Message>) {
    let peer = channel.peer();

    loop {
        let request = match channel.wait_response().await {
            Ok(request) => request,
            Err(SchedulerError::InvalidMessage(e)) => {
                debug!(peer = %peer, "无法解析的请求: {}", e);
                continue;
            }
            Err(e) => {
                debug!(peer = %peer, "客户端断开: {}", e);
                break;
            }
        };

        match respond(&request, &commands, &sender) {
            Action::Reply(responses) => {
                if let Err(e) = send_all(&mut channel, &responses).await {
                    debug!(peer = %peer, "发送回复失败: {}", e);
                    break;
                }
            }
            Action::ReplyAndClose(response) => {
                let _ = channel.send_message(&response).await;
                break;
            }
        }
    }

    channel.close().await;
}

async fn send_all(channel: &mut TcpChannel, responses: &[Message]) -> SchedulerResult<()> {
    for response in responses {
        channel.send_message(response).await?;
    }
    Ok(())
}

fn respond(request: &Message, commands: &[MessageSignature], sender: &mpsc::UnboundedSender<Message>) -> Action {
    match request.name() {
        "STATUS" => Action::Reply(vec![Message::named("READY")]),
        "INFO" => Action::Reply(vec![
            Message::new("TYPE", vec![Value::Str("Scheduler".to_string())]),
            Message::new("PROTOCOL", vec![Value::Str(PROTOCOL.to_string())]),
        ]),
        "DONE" => Action::ReplyAndClose(Message::named("GOODBYE")),
        name => {
            let Some(signature) = commands.iter().find(|s| s.name == name) else {
                return Action::Reply(vec![Message::new(
                    "UNKNOWN_COMMAND",
                    vec![Value::Str(name.to_string())],
                )]);
            };

            let command = match request.conform(signature.params) {
                Ok(command) => command,
                Err(e) => {
                    debug!("拒绝命令: {}", e);
                    return Action::Reply(vec![Message::named("INVALID_ARGUMENT")]);
                }
            };

            info!("收到命令: {}", command);
            if sender.send(command).is_err() {
                warn!("调度器已停止，丢弃命令: {}", request);
            }
            Action::Reply(vec![Message::named("OK")])
        }
    }
}
