mod common;

use tokio::sync::broadcast;

use common::{Setup, TIMEOUT};
use scheduler_core::JobStatus;
use scheduler_dispatcher::tasks::ServerIdentificator;
use scheduler_dispatcher::{Dispatcher, TaskContext};
use scheduler_domain::{commands, Command, Event, Server, ServerType};
use scheduler_testing_utils::{replies, ChannelRecorder, ServerBuilder, ServerScript, TestEnv};

/// 一台已识别为实验服务器、重新识别时报告为编译服务器的服务器
async fn compilation_server(setup: &Setup, port: u16) -> (Server, ChannelRecorder) {
    let server = setup
        .harness
        .store
        .insert_server(ServerBuilder::experiments(port).build())
        .await
        .unwrap();
    let recorder = setup.harness.connector.add_server(
        "127.0.0.1",
        port,
        ServerScript::new().on("INFO", replies(&["TYPE CompilationServer"])),
    );
    (server, recorder)
}

async fn wait_server_type(ctx: &TaskContext, server_id: i64, expected: ServerType) -> bool {
    let servers = ctx.repositories.servers.clone();
    TestEnv::wait_for(
        || {
            let servers = servers.clone();
            async move {
                servers
                    .find_by_id(server_id)
                    .await
                    .unwrap()
                    .is_some_and(|s| s.server_type == expected)
            }
        },
        TIMEOUT,
    )
    .await
}

#[tokio::test]
async fn test_command_registered_twice_is_rejected() {
    let Setup { ctx, inbox, .. } = Setup::new();
    let mut dispatcher = Dispatcher::new(ctx, inbox);

    dispatcher.register(ServerIdentificator::new()).unwrap();
    assert!(dispatcher.register(ServerIdentificator::new()).is_err());
    assert_eq!(dispatcher.runners().len(), 1);
}

#[tokio::test]
async fn test_default_tasks_cover_all_commands() {
    let Setup { ctx, inbox, .. } = Setup::new();
    let mut dispatcher = Dispatcher::new(ctx, inbox);
    dispatcher.register_default_tasks().unwrap();

    let registered: Vec<&str> = dispatcher.command_signatures().iter().map(|s| s.name).collect();
    for signature in commands::ALL {
        assert!(registered.contains(&signature.name), "{} 没有任务处理", signature.name);
    }
}

#[tokio::test]
async fn test_start_resumes_unfinished_jobs() {
    let setup = Setup::new();
    let (server, recorder) = compilation_server(&setup, 16000).await;

    // 上次运行中断时还在执行的Job
    let jobs = setup.ctx.repositories.jobs.clone();
    let command = Command::IdentifyServer { server_id: server.id }.to_message();
    let mut record = jobs.create(&command.to_string()).await.unwrap();
    record.status = JobStatus::Running;
    jobs.update(&record).await.unwrap();

    let Setup { harness: _harness, ctx, inbox } = setup;
    let mut dispatcher = Dispatcher::new(ctx.clone(), inbox);
    dispatcher.register(ServerIdentificator::new()).unwrap();
    dispatcher.start().await.unwrap();

    assert!(wait_server_type(&ctx, server.id, ServerType::Compilation).await);
    assert!(jobs.find_by_id(record.id).await.unwrap().is_none());
    assert_eq!(recorder.connections(), 1);
    dispatcher.stop().await;
}

#[tokio::test]
async fn test_run_routes_commands_until_shutdown() {
    let setup = Setup::new();
    let (server, recorder) = compilation_server(&setup, 16001).await;

    let Setup { harness: _harness, ctx, inbox } = setup;
    let mut dispatcher = Dispatcher::new(ctx.clone(), inbox);
    dispatcher.register(ServerIdentificator::new()).unwrap();
    let sender = dispatcher.sender();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    // 没有任务订阅的事件被忽略
    sender
        .send(Event::HeuristicChecked { heuristic_version_id: 1 }.to_message())
        .unwrap();
    sender
        .send(Command::IdentifyServer { server_id: server.id }.to_message())
        .unwrap();

    assert!(wait_server_type(&ctx, server.id, ServerType::Compilation).await);
    let closed = &recorder;
    assert!(TestEnv::wait_for(|| async move { closed.closes() == 1 }, TIMEOUT).await);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(TIMEOUT, running)
        .await
        .expect("调度器没有退出")
        .unwrap()
        .unwrap();
    assert_eq!(recorder.sent_names(), vec!["INFO", "DONE"]);
}
