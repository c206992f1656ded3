mod common;

use std::time::Duration;

use common::{Setup, TIMEOUT};
use scheduler_dispatcher::tasks::ServersChecker;
use scheduler_dispatcher::{TaskHandle, TaskRunner, TaskSettings};
use scheduler_domain::{Command, Server, ServerStatus};
use scheduler_testing_utils::{ServerBuilder, ServerScript, TestEnv};

async fn wait_statuses(setup: &Setup, expected: &[(i64, ServerStatus)]) -> bool {
    let servers = setup.ctx.repositories.servers.clone();
    TestEnv::wait_for(
        || {
            let servers = servers.clone();
            async move {
                let mut all = true;
                for (id, status) in expected {
                    let server: Option<Server> = servers.find_by_id(*id).await.unwrap();
                    all &= server.is_some_and(|s| s.status == *status);
                }
                all
            }
        },
        TIMEOUT,
    )
    .await
}

#[tokio::test]
async fn test_servers_marked_online_and_offline() {
    let setup = Setup::new();
    let online = setup.harness.store.insert_server(ServerBuilder::compilation(6100).build()).await.unwrap();
    let offline = setup.harness.store.insert_server(ServerBuilder::experiments(6101).build()).await.unwrap();
    let recorder = setup.harness.connector.add_server("127.0.0.1", 6100, ServerScript::new());

    let runner = TaskRunner::new(ServersChecker::new(), setup.ctx.clone());
    runner.handle_command(Command::CheckServersStatus.to_message()).await;

    assert!(wait_statuses(&setup, &[(online.id, ServerStatus::Online), (offline.id, ServerStatus::Offline)]).await);
    assert!(TestEnv::wait_for(|| async { recorder.closes() == 1 }, TIMEOUT).await);

    // 检查只建立连接，不发送任何消息
    assert!(recorder.sent_names().is_empty());
}

#[tokio::test]
async fn test_recent_check_skips_request() {
    let setup = Setup::new();
    setup.harness.store.insert_server(ServerBuilder::compilation(6110).build()).await.unwrap();
    let recorder = setup.harness.connector.add_server("127.0.0.1", 6110, ServerScript::new());

    let runner = TaskRunner::new(ServersChecker::new(), setup.ctx.clone());
    runner.handle_command(Command::CheckServersStatus.to_message()).await;
    assert!(TestEnv::wait_for(|| async { recorder.closes() == 1 }, TIMEOUT).await);
    assert!(TestEnv::wait_for(|| async { runner.jobs().await.is_empty() }, TIMEOUT).await);

    runner.handle_command(Command::CheckServersStatus.to_message()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.connections(), 1);
}

#[tokio::test]
async fn test_check_repeats_after_interval() {
    let setup = Setup::with_settings(TaskSettings {
        servers_check_min_interval: Duration::ZERO,
        ..TaskSettings::default()
    });
    setup.harness.store.insert_server(ServerBuilder::compilation(6120).build()).await.unwrap();
    let recorder = setup.harness.connector.add_server("127.0.0.1", 6120, ServerScript::new());

    let runner = TaskRunner::new(ServersChecker::new(), setup.ctx.clone());
    runner.handle_command(Command::CheckServersStatus.to_message()).await;
    assert!(TestEnv::wait_for(|| async { recorder.closes() == 1 }, TIMEOUT).await);
    assert!(TestEnv::wait_for(|| async { runner.jobs().await.is_empty() }, TIMEOUT).await);

    runner.handle_command(Command::CheckServersStatus.to_message()).await;
    assert!(TestEnv::wait_for(|| async { recorder.closes() == 2 }, TIMEOUT).await);
}
