mod common;

use common::Setup;
use scheduler_core::{JobStatus, Message};
use scheduler_dispatcher::tasks::HeuristicChecker;
use scheduler_dispatcher::{Task, TaskRunner};
use scheduler_domain::{events, Command, ErrorKind, HeuristicVersion, TestPhase, VersionStatus};
use scheduler_testing_utils::{heuristic, replies, ServerBuilder, ServerScript, VersionBuilder};

const SOURCE: &[u8] = b"class EdgeDetector {};";

/// 上传了一个版本的启发式 `Alice/Edge Detector`
async fn uploaded_version(setup: &Setup) -> HeuristicVersion {
    let store = &setup.harness.store;
    let heuristic = store.insert_heuristic(heuristic("Alice", "Edge Detector")).await.unwrap();
    let version = store
        .insert_version(VersionBuilder::new(heuristic.id).with_filename("upload_1.cpp").build())
        .await
        .unwrap();

    let path = setup.harness.storage.artifacts.upload_path("Alice", "upload_1.cpp");
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, SOURCE).await.unwrap();
    version
}

fn check(version: &HeuristicVersion) -> Message {
    Command::CheckHeuristic {
        heuristic_version_id: version.id,
    }
    .to_message()
}

async fn run_check(setup: &Setup, version: &HeuristicVersion, status: JobStatus) {
    let runner = TaskRunner::new(HeuristicChecker::new(), setup.ctx.clone());
    let job_id = runner.enqueue(check(version)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, status).await);
}

#[tokio::test]
async fn test_check_passes_and_promotes_source() {
    let mut setup = Setup::new();
    let version = uploaded_version(&setup).await;
    setup
        .harness
        .store
        .insert_server(ServerBuilder::compilation(12000).build())
        .await
        .unwrap();
    let recorder = setup.harness.connector.add_server(
        "127.0.0.1",
        12000,
        ServerScript::new().on("CHECK_HEURISTIC", replies(&["COMPILATION_OK", "ANALYZE_OK", "TEST_OK"])),
    );

    run_check(&setup, &version, JobStatus::Done).await;

    assert_eq!(
        recorder.sent_names(),
        vec!["STATUS", "USE_HEURISTICS_REPOSITORY", "CHECK_HEURISTIC", "DONE"]
    );
    assert_eq!(recorder.sent()[2].str_param(0).unwrap(), "alice/Edge Detector");

    let heuristics = &setup.ctx.repositories.heuristics;
    let checked = heuristics.find_version(version.id).await.unwrap().unwrap();
    assert!(checked.checked);
    assert_eq!(checked.filename, "edge-detector.cpp");
    assert!(heuristics.find_test_status(version.id).await.unwrap().is_none());

    let artifacts = &setup.harness.storage.artifacts;
    assert!(!artifacts.upload_path("Alice", "upload_1.cpp").exists());
    let promoted = tokio::fs::read(artifacts.heuristic_path("Alice", "edge-detector.cpp"))
        .await
        .unwrap();
    assert_eq!(promoted, SOURCE);

    let event = setup.next_message(events::HEURISTIC_CHECKED.name).await.unwrap();
    assert_eq!(event.int_param(0).unwrap(), version.id);
    assert!(setup.harness.notifier.all().is_empty());
}

#[tokio::test]
async fn test_compilation_error_disables_version() {
    let setup = Setup::new();
    let version = uploaded_version(&setup).await;
    setup
        .harness
        .store
        .insert_server(ServerBuilder::compilation(12001).build())
        .await
        .unwrap();
    let recorder = setup.harness.connector.add_server(
        "127.0.0.1",
        12001,
        ServerScript::new().on("CHECK_HEURISTIC", replies(&["COMPILATION_ERROR 'missing semicolon'"])),
    );

    run_check(&setup, &version, JobStatus::Failed).await;

    let heuristics = &setup.ctx.repositories.heuristics;
    let failed = heuristics.find_version(version.id).await.unwrap().unwrap();
    assert_eq!(failed.status, VersionStatus::Disabled);
    assert!(!failed.checked);

    let status = heuristics.find_test_status(version.id).await.unwrap().unwrap();
    assert_eq!(status.phase, TestPhase::Compilation);
    assert!(status.error);
    assert!(status.details.contains("Failed to compile the heuristic 'alice/Edge Detector'"));
    assert!(status.details.contains("missing semicolon"));

    // 失败时取回服务器日志，源文件留在上传区
    assert_eq!(recorder.count_sent("LOGS"), 1);
    assert!(setup.harness.storage.artifacts.upload_path("Alice", "upload_1.cpp").exists());
}

#[tokio::test]
async fn test_crash_creates_error_report_for_author() {
    let setup = Setup::new();
    let version = uploaded_version(&setup).await;
    setup
        .harness
        .store
        .insert_server(ServerBuilder::compilation(12002).build())
        .await
        .unwrap();
    setup.harness.connector.add_server(
        "127.0.0.1",
        12002,
        ServerScript::new().on(
            "CHECK_HEURISTIC",
            replies(&[
                "COMPILATION_OK",
                "ANALYZE_OK",
                "HEURISTIC_CRASH",
                "CONTEXT 'image 12'",
                "STACKTRACE 'EdgeDetector::process()'",
            ]),
        ),
    );

    run_check(&setup, &version, JobStatus::Failed).await;

    let reports = setup.harness.store.error_reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ErrorKind::Crash);
    assert_eq!(reports[0].heuristic_version_id, Some(version.id));
    assert_eq!(reports[0].context.as_deref(), Some("image 12"));
    assert_eq!(reports[0].stacktrace.as_deref(), Some("EdgeDetector::process()"));

    let status = setup
        .ctx
        .repositories
        .heuristics
        .find_test_status(version.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.phase, TestPhase::Test);

    // 作者收到报告，管理员不再收到告警
    let mails = setup.harness.notifier.user_notifications("Alice");
    assert_eq!(mails.len(), 1);
    assert!(mails[0].body.contains("EdgeDetector::process()"));
    assert!(setup.harness.notifier.admin_notifications().is_empty());
}

#[tokio::test]
async fn test_no_free_compilation_server_delays_check() {
    let setup = Setup::new();
    let version = uploaded_version(&setup).await;
    setup
        .harness
        .store
        .insert_server(ServerBuilder::compilation(12003).build())
        .await
        .unwrap();
    setup
        .harness
        .connector
        .add_server("127.0.0.1", 12003, ServerScript::busy());

    run_check(&setup, &version, JobStatus::Delayed).await;

    let heuristics = &setup.ctx.repositories.heuristics;
    assert!(heuristics.find_test_status(version.id).await.unwrap().is_none());
    assert!(setup.harness.notifier.all().is_empty());
}

#[tokio::test]
async fn test_startup_restarts_unchecked_versions() {
    let setup = Setup::new();
    let store = &setup.harness.store;
    let heuristic = store.insert_heuristic(heuristic("Bob", "Corners")).await.unwrap();
    let pending = store.insert_version(VersionBuilder::new(heuristic.id).build()).await.unwrap();
    store
        .insert_version(VersionBuilder::new(heuristic.id).with_version(2).checked().build())
        .await
        .unwrap();
    store
        .insert_version(
            VersionBuilder::new(heuristic.id)
                .with_version(3)
                .with_status(VersionStatus::Disabled)
                .build(),
        )
        .await
        .unwrap();

    let commands = HeuristicChecker::new().on_startup(&setup.ctx).await.unwrap();
    assert_eq!(commands, vec![check(&pending)]);
}

#[tokio::test]
async fn test_connection_lost_during_test_disables_version() {
    let setup = Setup::new();
    let version = uploaded_version(&setup).await;
    setup
        .harness
        .store
        .insert_server(ServerBuilder::compilation(12004).build())
        .await
        .unwrap();
    // 错误报告的上下文还没有发出，连接就断了
    let recorder = setup.harness.connector.add_server(
        "127.0.0.1",
        12004,
        ServerScript::new().on("CHECK_HEURISTIC", replies(&["COMPILATION_OK", "ANALYZE_OK", "TEST_ERROR 'bad pixel'"])),
    );

    run_check(&setup, &version, JobStatus::Failed).await;

    let heuristics = &setup.ctx.repositories.heuristics;
    let failed = heuristics.find_version(version.id).await.unwrap().unwrap();
    assert_eq!(failed.status, VersionStatus::Disabled);
    assert!(!failed.checked);

    let status = heuristics.find_test_status(version.id).await.unwrap().unwrap();
    assert_eq!(status.phase, TestPhase::Test);
    assert!(status.error);
    assert!(status.details.starts_with("Failed to check the heuristic 'alice/Edge Detector'"));
    assert!(status.details.contains("Error:"));

    assert!(setup.harness.store.error_reports().await.is_empty());
    assert_eq!(recorder.count_sent("LOGS"), 1);
    assert!(setup.harness.storage.artifacts.upload_path("Alice", "upload_1.cpp").exists());
}
