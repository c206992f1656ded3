//! 与计算农场服务器之间的传输层
//!
//! 基于行的文本协议：每条消息一行，以 `\n` 结束；二进制数据紧跟在声明其长度的消息之后。

pub mod server_logs;
pub mod tcp;

pub use server_logs::fetch_server_logs;
pub use tcp::{TcpChannel, TcpConnector};
