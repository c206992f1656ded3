use async_trait::async_trait;
use scheduler_core::{Channel, Connector, Message, SchedulerError, SchedulerResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// 单次数据读取的默认上限
pub const DEFAULT_MAX_DATA_SIZE: usize = 256 * 1024 * 1024;

/// 按块读取数据时每块的大小
const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// 基于TCP的连接器
///
/// 连接超时只约束建立连接的过程，之后的读取不设超时。
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    max_data_size: usize,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            max_data_size: DEFAULT_MAX_DATA_SIZE,
        }
    }

    /// 拒绝服务器声明的超过 `max_data_size` 字节的数据
    pub fn with_max_data_size(mut self, max_data_size: usize) -> Self {
        self.max_data_size = max_data_size;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str, port: u16) -> Option<Box<dyn Channel>> {
        match timeout(self.connect_timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(stream)) => {
                debug!("已连接到服务器 {}:{}", address, port);
                let channel = TcpChannel::new(stream, format!("{address}:{port}"))
                    .with_max_data_size(self.max_data_size);
                Some(Box::new(channel))
            }
            Ok(Err(e)) => {
                warn!("无法连接到服务器 {}:{}: {}", address, port, e);
                None
            }
            Err(_) => {
                warn!("连接服务器 {}:{} 超时", address, port);
                None
            }
        }
    }
}

/// 一条已建立的TCP连接
///
/// 行读取和定长数据读取共用同一个缓冲区，所以紧跟在消息之后的数据不会丢失。
pub struct TcpChannel {
    stream: Option<BufReader<TcpStream>>,
    peer: String,
    max_data_size: usize,
}

impl TcpChannel {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            peer,
            max_data_size: DEFAULT_MAX_DATA_SIZE,
        }
    }

    pub fn with_max_data_size(mut self, max_data_size: usize) -> Self {
        self.max_data_size = max_data_size;
        self
    }

    fn stream(&mut self) -> SchedulerResult<&mut BufReader<TcpStream>> {
        let peer = &self.peer;
        self.stream
            .as_mut()
            .ok_or_else(|| SchedulerError::Network(format!("与 {peer} 的连接已关闭")))
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send_message(&mut self, message: &Message) -> SchedulerResult<()> {
        let line = format!("{message}\n");
        debug!(peer = %self.peer, "> {}", message);
        let stream = self.stream()?;
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().flush().await?;
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> SchedulerResult<()> {
        debug!(peer = %self.peer, "> <{} bytes of data>", data.len());
        let stream = self.stream()?;
        stream.get_mut().write_all(data).await?;
        stream.get_mut().flush().await?;
        Ok(())
    }

    async fn wait_response(&mut self) -> SchedulerResult<Message> {
        let peer = self.peer.clone();
        let stream = self.stream()?;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = stream.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(SchedulerError::Network(format!("服务器 {peer} 关闭了连接")));
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                continue;
            }

            let message = Message::parse(text)?;
            debug!(peer = %peer, "< {}", message);
            return Ok(message);
        }
    }

    async fn wait_data(&mut self, size: usize) -> SchedulerResult<Vec<u8>> {
        if size > self.max_data_size {
            return Err(SchedulerError::Protocol {
                expected: format!("最多 {} 字节的数据", self.max_data_size),
                got: format!("{size} 字节"),
            });
        }

        let peer = self.peer.clone();
        let stream = self.stream()?;

        // 缓冲区随实际收到的数据增长，不按声明的长度预先分配
        let mut data = Vec::with_capacity(size.min(DATA_CHUNK_SIZE));
        let read = stream
            .take(size as u64)
            .read_to_end(&mut data)
            .await
            .map_err(|e| SchedulerError::Network(format!("从 {peer} 读取 {size} 字节数据失败: {e}")))?;
        if read < size {
            return Err(SchedulerError::Network(format!(
                "从 {peer} 读取数据时连接关闭: 期望 {size} 字节, 只收到 {read} 字节"
            )));
        }

        debug!(peer = %peer, "< <{} bytes of data>", size);
        Ok(data)
    }

    fn has_response(&self) -> bool {
        self.stream
            .as_ref()
            .map(|s| s.buffer().contains(&b'\n'))
            .unwrap_or(false)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.get_mut().shutdown().await {
                debug!(peer = %self.peer, "关闭连接时出错: {}", e);
            }
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
