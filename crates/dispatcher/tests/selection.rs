mod common;

use common::Setup;
use scheduler_dispatcher::selection::{claim_ready_server, find_ready_server, Handshake};
use scheduler_testing_utils::{ServerBuilder, ServerScript};

#[tokio::test]
async fn test_find_ready_server_skips_busy_servers() {
    let setup = Setup::new();
    let busy = ServerBuilder::experiments(6200).with_id(1).build();
    let ready = ServerBuilder::experiments(6201).with_id(2).build();
    let busy_recorder = setup.harness.connector.add_server("127.0.0.1", 6200, ServerScript::busy());
    let ready_recorder = setup.harness.connector.add_server("127.0.0.1", 6201, ServerScript::new());

    let found = find_ready_server(&setup.ctx, vec![busy, ready]).await;

    assert_eq!(found.map(|s| s.id), Some(2));
    assert_eq!(busy_recorder.sent_names(), vec!["STATUS", "DONE"]);
    assert_eq!(ready_recorder.sent_names(), vec!["STATUS", "DONE"]);
    assert_eq!(setup.harness.connector.open_connections(), 0);
}

#[tokio::test]
async fn test_find_ready_server_survives_failed_done() {
    let setup = Setup::new();
    let server = ServerBuilder::experiments(6210).with_id(1).build();
    let recorder = setup
        .harness
        .connector
        .add_server("127.0.0.1", 6210, ServerScript::new().drop_on("DONE"));

    let found = find_ready_server(&setup.ctx, vec![server]).await;

    // 会话无法正常结束时服务器依然可用，连接照样关闭
    assert_eq!(found.map(|s| s.id), Some(1));
    assert_eq!(recorder.sent_names(), vec!["STATUS"]);
    assert_eq!(recorder.closes(), 1);
}

#[tokio::test]
async fn test_claim_releases_server_after_failed_handshake() {
    let setup = Setup::new();
    let server = ServerBuilder::compilation(6220).with_id(1).build();
    let recorder = setup.harness.connector.add_server("127.0.0.1", 6220, ServerScript::busy());

    let claimed = claim_ready_server(&setup.ctx, "checker", vec![server.clone()], Handshake::Status).await;
    assert!(claimed.is_none());
    assert_eq!(recorder.closes(), 1);

    // 认领已释放，其他任务可以认领
    assert!(setup.ctx.claims.try_claim(server.id, "other").await);
}
