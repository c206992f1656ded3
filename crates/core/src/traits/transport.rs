use async_trait::async_trait;

use crate::models::Message;
use crate::SchedulerResult;

/// 与远程服务器之间的一条连接
///
/// 按行发送和接收 [`Message`]，并且可以在消息之后收发长度已知的二进制数据。
/// 连接本身不做任何重试，重试策略由任务决定。
#[async_trait]
pub trait Channel: Send {
    /// 发送一条消息
    async fn send_message(&mut self, message: &Message) -> SchedulerResult<()>;

    /// 发送一段原始数据
    async fn send_data(&mut self, data: &[u8]) -> SchedulerResult<()>;

    /// 等待下一条消息（忽略空行），连接关闭时返回网络错误
    async fn wait_response(&mut self) -> SchedulerResult<Message>;

    /// 精确读取 `size` 字节
    async fn wait_data(&mut self, size: usize) -> SchedulerResult<Vec<u8>>;

    /// 缓冲区中是否已经有一条完整的消息
    fn has_response(&self) -> bool;

    /// 关闭连接，重复关闭不做任何事
    async fn close(&mut self);

    /// 对端地址，用于日志
    fn peer(&self) -> String;
}

/// 连接工厂
#[async_trait]
pub trait Connector: Send + Sync {
    /// 连接到 `address:port`，连接失败时返回 `None`（服务器不可用不是错误）
    async fn connect(&self, address: &str, port: u16) -> Option<Box<dyn Channel>>;
}
