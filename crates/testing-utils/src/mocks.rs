//! 测试替身
//!
//! [`ScriptedConnector`] 按地址提供脚本化的远程服务器，每个服务器的收发记录在
//! [`ChannelRecorder`] 中；[`RecordingNotifier`] 记录所有通知。

use async_trait::async_trait;
use scheduler_core::{Channel, Connector, Delivery, Message, Notifier, SchedulerError, SchedulerResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// 服务器对一条消息的应答
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Message(Message),
    Data(Vec<u8>),
}

impl Reply {
    /// 解析一行文本形式的消息
    pub fn msg(line: &str) -> Self {
        Reply::Message(Message::parse(line).unwrap())
    }

    pub fn data(content: impl Into<Vec<u8>>) -> Self {
        Reply::Data(content.into())
    }
}

/// 一组应答文本的简写
pub fn replies(lines: &[&str]) -> Vec<Reply> {
    lines.iter().map(|line| Reply::msg(line)).collect()
}

/// 远程服务器的应答脚本
///
/// 按消息名匹配规则。同一个名字的多组应答依次使用，最后一组之后一直重复使用。
/// 默认 `STATUS` 应答 `READY`，`LOGS` 应答 `END_LOGS`，`DONE` 不应答，其余消息应答 `OK`。
#[derive(Debug)]
pub struct ServerScript {
    rules: Mutex<HashMap<String, VecDeque<Vec<Reply>>>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
    drops: Mutex<HashSet<String>>,
    fallback: Vec<Reply>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerScript {
    pub fn new() -> Self {
        let script = Self {
            rules: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            drops: Mutex::new(HashSet::new()),
            fallback: replies(&["OK"]),
        };
        script
            .on("STATUS", replies(&["READY"]))
            .on("LOGS", replies(&["END_LOGS"]))
            .on("DONE", Vec::new())
    }

    /// 服务器忙
    pub fn busy() -> Self {
        Self::new().on("STATUS", replies(&["BUSY"]))
    }

    /// 追加一组应答（第一次调用时替换默认应答）
    pub fn on(self, name: &str, replies: Vec<Reply>) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            let queue = rules.entry(name.to_string()).or_default();
            if queue.len() == 1 && is_default(name) {
                queue.clear();
            }
            queue.push_back(replies);
        }
        self
    }

    /// 发送名为 `name` 的消息时阻塞，直到 `gate` 被通知一次
    ///
    /// 消息在阻塞之前已经记录，测试可以先等待它出现再操作Job。
    pub fn hold(self, name: &str, gate: Arc<Notify>) -> Self {
        self.holds.lock().unwrap().insert(name.to_string(), gate);
        self
    }

    /// 发送名为 `name` 的消息时连接断开
    pub fn drop_on(self, name: &str) -> Self {
        self.drops.lock().unwrap().insert(name.to_string());
        self
    }

    fn drops(&self, name: &str) -> bool {
        self.drops.lock().unwrap().contains(name)
    }

    fn gate(&self, name: &str) -> Option<Arc<Notify>> {
        self.holds.lock().unwrap().get(name).cloned()
    }

    /// 未匹配到规则时的应答
    pub fn otherwise(mut self, replies: Vec<Reply>) -> Self {
        self.fallback = replies;
        self
    }

    fn respond(&self, message: &Message) -> Vec<Reply> {
        let mut rules = self.rules.lock().unwrap();
        match rules.get_mut(message.name()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => self.fallback.clone(),
        }
    }
}

fn is_default(name: &str) -> bool {
    matches!(name, "STATUS" | "LOGS" | "DONE")
}

#[derive(Debug, Default)]
struct ChannelLog {
    sent: Vec<Message>,
    data: Vec<Vec<u8>>,
    connections: usize,
    closes: usize,
}

/// 一个脚本化服务器上所有连接的记录
#[derive(Debug, Clone, Default)]
pub struct ChannelRecorder {
    log: Arc<Mutex<ChannelLog>>,
}

impl ChannelRecorder {
    pub fn sent(&self) -> Vec<Message> {
        self.log.lock().unwrap().sent.clone()
    }

    /// 发送的消息，按文本形式
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent().iter().map(ToString::to_string).collect()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.sent().iter().map(|m| m.name().to_string()).collect()
    }

    pub fn count_sent(&self, name: &str) -> usize {
        self.sent().iter().filter(|m| m.is(name)).count()
    }

    pub fn data_sent(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().data.clone()
    }

    pub fn connections(&self) -> usize {
        self.log.lock().unwrap().connections
    }

    pub fn closes(&self) -> usize {
        self.log.lock().unwrap().closes
    }
}

/// 由脚本应答的连接
pub struct ScriptedChannel {
    script: Arc<ServerScript>,
    pending: VecDeque<Reply>,
    recorder: ChannelRecorder,
    peer: String,
    closed: bool,
}

impl ScriptedChannel {
    pub fn new(script: Arc<ServerScript>, recorder: ChannelRecorder, peer: impl Into<String>) -> Self {
        Self {
            script,
            pending: VecDeque::new(),
            recorder,
            peer: peer.into(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> SchedulerResult<()> {
        if self.closed {
            return Err(SchedulerError::Network(format!("连接 {} 已关闭", self.peer)));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send_message(&mut self, message: &Message) -> SchedulerResult<()> {
        self.ensure_open()?;
        if self.script.drops(message.name()) {
            return Err(SchedulerError::Network(format!("{} 在 {} 时断开", self.peer, message.name())));
        }
        self.recorder.log.lock().unwrap().sent.push(message.clone());
        let replies = self.script.respond(message);
        self.pending.extend(replies);
        if let Some(gate) = self.script.gate(message.name()) {
            gate.notified().await;
        }
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> SchedulerResult<()> {
        self.ensure_open()?;
        self.recorder.log.lock().unwrap().data.push(data.to_vec());
        Ok(())
    }

    async fn wait_response(&mut self) -> SchedulerResult<Message> {
        self.ensure_open()?;
        match self.pending.pop_front() {
            Some(Reply::Message(message)) => Ok(message),
            Some(Reply::Data(data)) => Err(SchedulerError::Protocol {
                expected: "消息".to_string(),
                got: format!("{} 字节的数据", data.len()),
            }),
            None => Err(SchedulerError::Network(format!("{} 关闭了连接", self.peer))),
        }
    }

    async fn wait_data(&mut self, size: usize) -> SchedulerResult<Vec<u8>> {
        self.ensure_open()?;
        match self.pending.pop_front() {
            Some(Reply::Data(data)) if data.len() == size => Ok(data),
            Some(Reply::Data(data)) => Err(SchedulerError::Network(format!(
                "期望 {size} 字节, 只收到 {} 字节",
                data.len()
            ))),
            Some(Reply::Message(message)) => Err(SchedulerError::Protocol {
                expected: "数据".to_string(),
                got: message.to_string(),
            }),
            None => Err(SchedulerError::Network(format!("{} 关闭了连接", self.peer))),
        }
    }

    fn has_response(&self) -> bool {
        matches!(self.pending.front(), Some(Reply::Message(_)))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.recorder.log.lock().unwrap().closes += 1;
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// 按 `address:port` 提供脚本化服务器的连接工厂，未登记的地址无法连接
#[derive(Default)]
pub struct ScriptedConnector {
    servers: Mutex<HashMap<String, (Arc<ServerScript>, ChannelRecorder)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个服务器，返回它的收发记录
    pub fn add_server(&self, address: &str, port: u16, script: ServerScript) -> ChannelRecorder {
        let recorder = ChannelRecorder::default();
        self.servers
            .lock()
            .unwrap()
            .insert(format!("{address}:{port}"), (Arc::new(script), recorder.clone()));
        recorder
    }

    pub fn remove_server(&self, address: &str, port: u16) {
        self.servers.lock().unwrap().remove(&format!("{address}:{port}"));
    }

    /// 所有连接中尚未关闭的数量
    pub fn open_connections(&self) -> usize {
        self.servers
            .lock()
            .unwrap()
            .values()
            .map(|(_, recorder)| recorder.connections() - recorder.closes())
            .sum()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, address: &str, port: u16) -> Option<Box<dyn Channel>> {
        let endpoint = format!("{address}:{port}");
        let (script, recorder) = self.servers.lock().unwrap().get(&endpoint).cloned()?;
        recorder.log.lock().unwrap().connections += 1;
        Some(Box::new(ScriptedChannel::new(script, recorder, endpoint)))
    }
}

/// 一条通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    /// `None` 表示发给管理员
    pub user: Option<String>,
    pub subject: String,
    pub body: String,
}

/// 记录所有通知的通知器
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn admin_notifications(&self) -> Vec<SentNotification> {
        self.all().into_iter().filter(|n| n.user.is_none()).collect()
    }

    pub fn user_notifications(&self, user: &str) -> Vec<SentNotification> {
        self.all()
            .into_iter()
            .filter(|n| n.user.as_deref() == Some(user))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_admins(&self, subject: &str, body: &str) -> SchedulerResult<Delivery> {
        self.sent.lock().unwrap().push(SentNotification {
            user: None,
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(Delivery::Sent)
    }

    async fn notify_user(&self, user: &str, subject: &str, body: &str) -> SchedulerResult<Delivery> {
        self.sent.lock().unwrap().push(SentNotification {
            user: Some(user.to_string()),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(Delivery::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_server() {
        let connector = ScriptedConnector::new();
        let recorder = connector.add_server(
            "127.0.0.1",
            11000,
            ServerScript::new()
                .on("INFO", replies(&["TYPE CompilationServer", "PROTOCOL 1.2"]))
                .on("CHECK_HEURISTIC", replies(&["COMPILATION_ERROR 'line 3'"]))
                .on("CHECK_HEURISTIC", replies(&["COMPILATION_OK"])),
        );

        assert!(connector.connect("127.0.0.1", 11001).await.is_none());

        let mut channel = connector.connect("127.0.0.1", 11000).await.unwrap();
        channel.send_message(&Message::named("STATUS")).await.unwrap();
        assert!(channel.wait_response().await.unwrap().is("READY"));

        channel.send_message(&Message::named("INFO")).await.unwrap();
        assert!(channel.has_response());
        assert!(channel.wait_response().await.unwrap().is("TYPE"));
        assert!(channel.wait_response().await.unwrap().is("PROTOCOL"));

        channel.send_message(&Message::named("CHECK_HEURISTIC")).await.unwrap();
        assert!(channel.wait_response().await.unwrap().is("COMPILATION_ERROR"));
        channel.send_message(&Message::named("CHECK_HEURISTIC")).await.unwrap();
        assert!(channel.wait_response().await.unwrap().is("COMPILATION_OK"));
        channel.send_message(&Message::named("CHECK_HEURISTIC")).await.unwrap();
        assert!(channel.wait_response().await.unwrap().is("COMPILATION_OK"));

        // 没有应答时连接被视为已断开
        assert!(channel.wait_response().await.is_err());

        channel.close().await;
        channel.close().await;
        assert_eq!(recorder.connections(), 1);
        assert_eq!(recorder.closes(), 1);
        assert_eq!(recorder.count_sent("CHECK_HEURISTIC"), 3);
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropped_message_is_not_recorded() {
        let connector = ScriptedConnector::new();
        let recorder = connector.add_server("127.0.0.1", 11002, ServerScript::new().drop_on("DONE"));

        let mut channel = connector.connect("127.0.0.1", 11002).await.unwrap();
        channel.send_message(&Message::named("STATUS")).await.unwrap();
        assert!(matches!(
            channel.send_message(&Message::named("DONE")).await,
            Err(SchedulerError::Network(_))
        ));
        assert_eq!(recorder.sent_names(), vec!["STATUS"]);
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify_admins("[MASH ALERT] x", "body").await.unwrap();
        notifier.notify_user("alice", "[MASH] y", "body").await.unwrap();

        assert_eq!(notifier.admin_notifications().len(), 1);
        assert_eq!(notifier.user_notifications("alice")[0].subject, "[MASH] y");
        assert!(notifier.user_notifications("bob").is_empty());
    }
}
