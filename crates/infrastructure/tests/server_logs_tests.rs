use scheduler_core::{Connector, SchedulerError};
use scheduler_infrastructure::storage::ServerLogStore;
use scheduler_infrastructure::{fetch_server_logs, TcpConnector};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// 模拟一个按 `LOGS` 请求返回两个日志文件的服务器
async fn spawn_log_server() -> u16 {
    spawn_server_replying(b"LOG_FILE Predictor.log 5\nhelloLOG_FILE Server.log 3\nabcEND_LOGS\n").await
}

/// 收到 `LOGS` 之后原样写回 `reply`
async fn spawn_server_replying(reply: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(socket);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "LOGS\n");

        let socket = reader.get_mut();
        socket.write_all(reply).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    });

    port
}

#[tokio::test]
async fn test_fetch_all_logs() {
    let port = spawn_log_server().await;
    let mut channel = TcpConnector::default().connect("127.0.0.1", port).await.unwrap();

    let files = fetch_server_logs(channel.as_mut(), None).await.unwrap();
    assert_eq!(
        files,
        vec![
            ("Predictor.log".to_string(), b"hello".to_vec()),
            ("Server.log".to_string(), b"abc".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_fetch_filtered_logs_and_store_them() {
    let port = spawn_log_server().await;
    let mut channel = TcpConnector::default().connect("127.0.0.1", port).await.unwrap();

    let files = fetch_server_logs(channel.as_mut(), Some(&["Predictor.log"]))
        .await
        .unwrap();
    assert_eq!(files.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let store = ServerLogStore::new(dir.path());
    let folder = store.new_folder();
    for (name, content) in &files {
        store.save(&folder, name, content).await.unwrap();
    }

    let saved = store.read_all(&folder).await.unwrap();
    assert_eq!(saved, vec![("Predictor.log".to_string(), b"hello".to_vec())]);
}

#[tokio::test]
async fn test_oversized_log_file_is_rejected() {
    let port = spawn_server_replying(b"LOG_FILE Predictor.log 9223372036854775807\nhello").await;
    let connector = TcpConnector::default().with_max_data_size(1024);
    let mut channel = connector.connect("127.0.0.1", port).await.unwrap();

    let err = fetch_server_logs(channel.as_mut(), None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Protocol { .. }));
}

#[tokio::test]
async fn test_negative_log_file_size_is_rejected() {
    let port = spawn_server_replying(b"LOG_FILE Predictor.log -5\nEND_LOGS\n").await;
    let mut channel = TcpConnector::default().connect("127.0.0.1", port).await.unwrap();

    let err = fetch_server_logs(channel.as_mut(), None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Protocol { .. }));
}
