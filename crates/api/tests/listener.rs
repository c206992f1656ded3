use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use scheduler_api::CommandListener;
use scheduler_core::Message;
use scheduler_domain::{commands, Command};
use scheduler_testing_utils::TestEnv;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    async fn connect(address: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(address).await.unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.reader.get_mut().write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }

    /// 读取一行回复，连接关闭时返回 None
    async fn read(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(TIMEOUT, self.reader.read_line(&mut line)).await.unwrap().unwrap();
        (read > 0).then(|| line.trim_end().to_string())
    }
}

async fn start() -> (std::net::SocketAddr, mpsc::UnboundedReceiver<Message>, broadcast::Sender<()>) {
    TestEnv::init_logging();

    let (sender, inbox) = mpsc::unbounded_channel();
    let listener = CommandListener::bind("127.0.0.1:0", commands::ALL.to_vec(), sender)
        .await
        .unwrap();
    let address = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(listener.run(shutdown_rx));
    (address, inbox, shutdown_tx)
}

#[tokio::test]
async fn test_session_over_tcp() {
    let (address, mut inbox, _shutdown) = start().await;
    let mut client = Client::connect(address).await;

    client.send("STATUS").await;
    assert_eq!(client.read().await.as_deref(), Some("READY"));

    client.send("INFO").await;
    assert_eq!(client.read().await.as_deref(), Some("TYPE Scheduler"));
    assert_eq!(client.read().await.as_deref(), Some("PROTOCOL 1.2"));

    client.send("CHECK_HEURISTIC 7").await;
    assert_eq!(client.read().await.as_deref(), Some("OK"));
    let forwarded = timeout(TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(
        Command::from_message(&forwarded).unwrap(),
        Command::CheckHeuristic {
            heuristic_version_id: 7
        }
    );

    client.send("CHECK_HEURISTIC").await;
    assert_eq!(client.read().await.as_deref(), Some("INVALID_ARGUMENT"));

    client.send("REBOOT_EVERYTHING now").await;
    assert_eq!(client.read().await.as_deref(), Some("UNKNOWN_COMMAND REBOOT_EVERYTHING"));

    client.send("DONE").await;
    assert_eq!(client.read().await.as_deref(), Some("GOODBYE"));
    assert_eq!(client.read().await, None);

    // 只有合法的命令被转发
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_clients_are_served_concurrently() {
    let (address, mut inbox, _shutdown) = start().await;
    let mut idle = Client::connect(address).await;
    let mut active = Client::connect(address).await;

    active.send("CLUSTER_HEURISTICS kmeans").await;
    assert_eq!(active.read().await.as_deref(), Some("OK"));
    let forwarded = timeout(TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(forwarded.str_param(0).unwrap(), "kmeans");

    idle.send("STATUS").await;
    assert_eq!(idle.read().await.as_deref(), Some("READY"));
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (address, _inbox, shutdown) = start().await;
    let mut client = Client::connect(address).await;
    client.send("STATUS").await;
    assert_eq!(client.read().await.as_deref(), Some("READY"));

    shutdown.send(()).unwrap();
    assert_eq!(client.read().await, None);
}
