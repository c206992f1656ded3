//! 服务器选择
//!
//! 依次尝试候选服务器：认领、连接、握手，第一台通过的服务器绑定到 Job。

use tracing::{debug, warn};

use scheduler_core::{Channel, Message};
use scheduler_domain::Server;

use crate::context::TaskContext;

/// 连接后的握手方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// 只建立连接
    None,
    /// `STATUS` 必须回答 `READY`
    Status,
    /// `STATUS` 回答 `READY`，`INFO` 回答 `TYPE server_type` 和 `PROTOCOL protocol`
    StatusAndInfo {
        server_type: &'static str,
        protocol: &'static str,
    },
}

/// 认领第一台空闲且通过握手的服务器
///
/// 握手失败的服务器会被释放，其连接会被关闭。全部失败时返回 `None`。
pub async fn claim_ready_server(
    ctx: &TaskContext,
    owner: &str,
    candidates: Vec<Server>,
    handshake: Handshake,
) -> Option<(Server, Box<dyn Channel>)> {
    for server in candidates {
        if !ctx.claims.try_claim(server.id, owner).await {
            continue;
        }

        let Some(mut channel) = ctx.connector.connect(&server.address, server.port).await else {
            debug!("无法连接服务器 {} ({})", server.name, server.endpoint());
            ctx.claims.release(server.id, owner).await;
            continue;
        };

        if perform_handshake(channel.as_mut(), handshake).await {
            return Some((server, channel));
        }

        debug!("服务器 {} 握手失败", server.name);
        channel.close().await;
        ctx.claims.release(server.id, owner).await;
    }

    None
}

/// 找到第一台在线的服务器（不认领）
///
/// 应用服务器可以同时服务多个实验，只需确认它可以连接并且空闲。
pub async fn find_ready_server(ctx: &TaskContext, candidates: Vec<Server>) -> Option<Server> {
    let connector = &ctx.connector;

    for server in candidates {
        let Some(mut channel) = connector.connect(&server.address, server.port).await else {
            continue;
        };
        let ready = perform_handshake(channel.as_mut(), Handshake::Status).await;
        if let Err(e) = channel.send_message(&Message::named("DONE")).await {
            warn!("无法结束与服务器 {}:{} 的会话: {}", server.address, server.port, e);
        }
        channel.close().await;

        if ready {
            return Some(server);
        }
    }

    None
}

async fn perform_handshake(channel: &mut dyn Channel, handshake: Handshake) -> bool {
    match handshake {
        Handshake::None => true,
        Handshake::Status => expect(channel, Message::named("STATUS"), "READY", None).await,
        Handshake::StatusAndInfo { server_type, protocol } => {
            expect(channel, Message::named("STATUS"), "READY", None).await
                && expect(channel, Message::named("INFO"), "TYPE", Some(server_type)).await
                && receive_expected(channel, "PROTOCOL", Some(protocol)).await
        }
    }
}

async fn expect(channel: &mut dyn Channel, request: Message, name: &str, value: Option<&str>) -> bool {
    if channel.send_message(&request).await.is_err() {
        return false;
    }
    receive_expected(channel, name, value).await
}

async fn receive_expected(channel: &mut dyn Channel, name: &str, value: Option<&str>) -> bool {
    let Ok(response) = channel.wait_response().await else {
        return false;
    };
    if !response.is(name) {
        debug!("握手失败, 期望 {}, 收到 {}", name, response);
        return false;
    }
    match value {
        Some(value) => response.param(0).map(|p| p.to_string()) == Some(value.to_string()),
        None => true,
    }
}
