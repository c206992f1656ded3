mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use tokio::sync::Notify;

use common::{Setup, TIMEOUT};
use scheduler_core::{Alert, Delivery, JobStatus, Message, Notifier, SchedulerError, SchedulerResult};
use scheduler_dispatcher::tasks::ServerIdentificator;
use scheduler_dispatcher::{TaskHandle, TaskRunner, TaskSettings};
use scheduler_domain::{AlertRecord, Command, JobRecord, JobRepository, Server, ServerSubtype, ServerType};
use scheduler_testing_utils::{replies, ChannelRecorder, ServerBuilder, ServerScript, TestEnv};

mock! {
    pub Notifier {}

    #[async_trait]
    impl Notifier for Notifier {
        async fn notify_admins(&self, subject: &str, body: &str) -> SchedulerResult<Delivery>;
        async fn notify_user(&self, user: &str, subject: &str, body: &str) -> SchedulerResult<Delivery>;
    }
}

mock! {
    pub Jobs {}

    #[async_trait]
    impl JobRepository for Jobs {
        async fn create(&self, command: &str) -> SchedulerResult<JobRecord>;
        async fn update(&self, job: &JobRecord) -> SchedulerResult<()>;
        async fn delete(&self, id: i64) -> SchedulerResult<()>;
        async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobRecord>>;
        async fn find_by_statuses(&self, statuses: &[JobStatus]) -> SchedulerResult<Vec<JobRecord>>;
        async fn save_alert(&self, job_id: i64, alert: &Alert) -> SchedulerResult<AlertRecord>;
        async fn find_alerts(&self, job_id: i64) -> SchedulerResult<Vec<AlertRecord>>;
    }
}

fn identify(server_id: i64) -> Message {
    Command::IdentifyServer { server_id }.to_message()
}

async fn unidentified(setup: &Setup, port: u16) -> Server {
    setup
        .harness
        .store
        .insert_server(ServerBuilder::new(ServerType::Unidentified, port).build())
        .await
        .unwrap()
}

fn identificator(setup: &Setup) -> TaskRunner<ServerIdentificator> {
    TaskRunner::new(ServerIdentificator::new(), setup.ctx.clone())
}

#[tokio::test]
async fn test_identify_experiment_server() {
    let setup = Setup::new();
    let server = unidentified(&setup, 11000).await;
    let recorder = setup.harness.connector.add_server(
        "127.0.0.1",
        11000,
        ServerScript::new().on("INFO", replies(&["TYPE ExperimentServer"])),
    );

    let runner = identificator(&setup);
    let job_id = runner.enqueue(identify(server.id)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Done).await);

    let server = setup.ctx.repositories.servers.find_by_id(server.id).await.unwrap().unwrap();
    assert_eq!(server.server_type, ServerType::Experiments);

    // 一个Job只打开一次连接，结束时发送 DONE 并关闭
    assert_eq!(recorder.connections(), 1);
    assert_eq!(recorder.closes(), 1);
    assert_eq!(recorder.sent_names(), vec!["INFO", "DONE"]);
    assert!(!setup.ctx.claims.is_claimed(server.id).await);
    assert!(setup.harness.notifier.all().is_empty());
}

#[tokio::test]
async fn test_identify_application_server_subtype() {
    let setup = Setup::new();
    let server = unidentified(&setup, 11001).await;
    setup.harness.connector.add_server(
        "127.0.0.1",
        11001,
        ServerScript::new().on("INFO", replies(&["TYPE ApplicationServer", "SUBTYPE Interactive"])),
    );

    let runner = identificator(&setup);
    let job_id = runner.enqueue(identify(server.id)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Done).await);

    let server = setup.ctx.repositories.servers.find_by_id(server.id).await.unwrap().unwrap();
    assert_eq!(server.server_type, ServerType::Application);
    assert_eq!(server.subtype, ServerSubtype::Interactive);
}

#[tokio::test]
async fn test_duplicate_command_while_delayed() {
    let setup = Setup::new();
    let server = unidentified(&setup, 11002).await;
    let runner = identificator(&setup);

    // 服务器不在线：Job 延后，不通知管理员
    let job_id = runner.enqueue(identify(server.id)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Delayed).await);
    assert!(setup.harness.notifier.all().is_empty());

    assert_eq!(runner.enqueue(identify(server.id)).await.unwrap(), None);
    assert_eq!(runner.queue().len().await, 1);

    // 服务器上线后唤醒Job
    setup.harness.connector.add_server(
        "127.0.0.1",
        11002,
        ServerScript::new().on("INFO", replies(&["TYPE CompilationServer"])),
    );
    let jobs = runner.queue().get_jobs(&identify(server.id)).await;
    assert_eq!(jobs.len(), 1);
    jobs[0].wake();

    assert!(setup.wait_status(job_id, JobStatus::Done).await);
    let server = setup.ctx.repositories.servers.find_by_id(server.id).await.unwrap().unwrap();
    assert_eq!(server.server_type, ServerType::Compilation);
}

#[tokio::test]
async fn test_unknown_server_fails_with_alert() {
    let setup = Setup::new();
    let runner = identificator(&setup);

    let job_id = runner.enqueue(identify(999)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Failed).await);

    let alerts = setup.ctx.repositories.jobs.find_alerts(job_id).await.unwrap();
    assert_eq!(alerts.len(), 1);

    let notifier = setup.harness.notifier.clone();
    assert!(TestEnv::wait_for(|| async { notifier.admin_notifications().len() == 1 }, TIMEOUT).await);
    let sent = notifier.admin_notifications();
    assert_eq!(sent[0].subject, "[MASH ALERT] Unknown server ID: 999");
    assert!(sent[0].body.contains("IDENTIFY_SERVER 999"));
}

#[tokio::test]
async fn test_step_error_marks_job_failed() {
    let setup = Setup::new();
    let server = unidentified(&setup, 11003).await;
    // INFO 没有应答，连接被对方关闭
    let recorder = setup
        .harness
        .connector
        .add_server("127.0.0.1", 11003, ServerScript::new().on("INFO", Vec::new()));

    let runner = identificator(&setup);
    let job_id = runner.enqueue(identify(server.id)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Failed).await);

    let notifier = setup.harness.notifier.clone();
    assert!(TestEnv::wait_for(|| async { !notifier.admin_notifications().is_empty() }, TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 异常通知已发送，结束时不再重复通知
    let sent = notifier.admin_notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "[MASH ALERT] Exception during the processing of a job");
    assert_eq!(recorder.closes(), 1);
    assert!(!setup.ctx.claims.is_claimed(server.id).await);
}

/// 发送 `INFO` 时停住，直到 `gate` 放行
fn held_info(setup: &Setup, port: u16, gate: &Arc<Notify>, reply: &str) -> ChannelRecorder {
    setup.harness.connector.add_server(
        "127.0.0.1",
        port,
        ServerScript::new()
            .on("INFO", replies(&[reply]))
            .hold("INFO", gate.clone()),
    )
}

#[tokio::test]
async fn test_cancel_is_observed_after_pending_step() {
    let setup = Setup::new();
    let server = unidentified(&setup, 11004).await;
    let gate = Arc::new(Notify::new());
    let recorder = held_info(&setup, 11004, &gate, "TYPE DebuggingServer");

    let runner = identificator(&setup);
    let command = identify(server.id);
    let job_id = runner.enqueue(command.clone()).await.unwrap().unwrap();
    assert!(TestEnv::wait_for(|| async { recorder.count_sent("INFO") == 1 }, TIMEOUT).await);

    let jobs = runner.queue().get_jobs(&command).await;
    jobs[0].cancel();

    // 进行中的步骤不会被打断
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(setup.job_status(job_id).await, Some(JobStatus::Running));
    assert_eq!(recorder.closes(), 0);

    gate.notify_one();
    assert!(setup.wait_status(job_id, JobStatus::Cancelled).await);
    assert!(TestEnv::wait_for(|| async { recorder.closes() == 1 }, TIMEOUT).await);
    assert!(!setup.ctx.claims.is_claimed(server.id).await);
    assert!(setup.harness.notifier.all().is_empty());

    // 取消发生在读取应答之前，服务器类型保持不变
    let reloaded = setup.ctx.repositories.servers.find_by_id(server.id).await.unwrap().unwrap();
    assert_eq!(reloaded.server_type, ServerType::Unidentified);

    // 被取消的Job不再阻止相同的命令
    assert!(runner.enqueue(command).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stop_reschedules_running_job() {
    let setup = Setup::new();
    let server = unidentified(&setup, 11005).await;
    let gate = Arc::new(Notify::new());
    let recorder = held_info(&setup, 11005, &gate, "TYPE DebuggingServer");

    let runner = identificator(&setup);
    let job_id = runner.enqueue(identify(server.id)).await.unwrap().unwrap();
    assert!(TestEnv::wait_for(|| async { recorder.count_sent("INFO") == 1 }, TIMEOUT).await);

    // stop 等待进行中的步骤结束
    let stopping = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    gate.notify_one();
    tokio::time::timeout(TIMEOUT, stopping).await.unwrap().unwrap();

    assert_eq!(setup.job_status(job_id).await, Some(JobStatus::Scheduled));
    assert_eq!(recorder.closes(), 1);
    assert_eq!(runner.enqueue(identify(server.id)).await.unwrap(), None);
}

#[tokio::test]
async fn test_jobs_limited_per_task() {
    let settings = TaskSettings {
        max_jobs_per_task: 1,
        ..TaskSettings::default()
    };
    let setup = Setup::with_settings(settings);

    let first = unidentified(&setup, 11006).await;
    let second = unidentified(&setup, 11007).await;
    let gate = Arc::new(Notify::new());
    let first_recorder = held_info(&setup, 11006, &gate, "TYPE ExperimentServer");
    let second_recorder = setup.harness.connector.add_server(
        "127.0.0.1",
        11007,
        ServerScript::new().on("INFO", replies(&["TYPE DebuggingServer"])),
    );

    let runner = identificator(&setup);
    let first_job = runner.enqueue(identify(first.id)).await.unwrap().unwrap();
    assert!(TestEnv::wait_for(|| async { first_recorder.count_sent("INFO") == 1 }, TIMEOUT).await);

    let second_job = runner.enqueue(identify(second.id)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second_recorder.connections(), 0);
    assert_eq!(setup.job_status(second_job).await, Some(JobStatus::Scheduled));

    gate.notify_one();
    assert!(setup.wait_status(first_job, JobStatus::Done).await);
    assert!(setup.wait_status(second_job, JobStatus::Done).await);
}

#[tokio::test]
async fn test_failed_notification_does_not_break_job() {
    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify_admins()
        .withf(|subject, _| subject.contains("Unknown server ID: 42"))
        .times(1)
        .returning(|_, _| Err(SchedulerError::Notification("SMTP 服务器不可用".to_string())));
    notifier.expect_notify_user().never();

    let setup = Setup::with_notifier(Arc::new(notifier));
    let runner = identificator(&setup);

    let job_id = runner.enqueue(identify(42)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Failed).await);
    assert!(TestEnv::wait_for(|| async { runner.queue().is_empty().await }, TIMEOUT).await);
}

#[tokio::test]
async fn test_failed_alert_keeps_job_resumable() {
    let persisted = Arc::new(Mutex::new(Vec::new()));

    let mut jobs = MockJobs::new();
    jobs.expect_create().times(1).returning(|command| {
        Ok(JobRecord {
            id: 7,
            command: command.to_string(),
            status: JobStatus::Scheduled,
            server_id: None,
            heuristic_version_id: None,
            experiment_id: None,
            logs_folder: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    });
    let updates = persisted.clone();
    jobs.expect_update().returning(move |record| {
        updates.lock().unwrap().push(record.status);
        Ok(())
    });
    jobs.expect_save_alert()
        .returning(|_, _| Err(SchedulerError::DatabaseOperation("磁盘已满".to_string())));

    let setup = Setup::new();
    let mut ctx = setup.ctx.clone();
    ctx.repositories.jobs = Arc::new(jobs);
    let runner = TaskRunner::new(ServerIdentificator::new(), ctx);

    runner.enqueue(identify(42)).await.unwrap().unwrap();
    assert!(TestEnv::wait_for(|| async { runner.queue().is_empty().await }, TIMEOUT).await);

    // 没有告警就不会持久化失败状态，记录留待下次启动恢复
    let statuses = persisted.lock().unwrap().clone();
    assert!(statuses.iter().all(|status| !status.is_terminal()));
    assert!(setup.harness.notifier.admin_notifications().is_empty());
}

#[tokio::test]
async fn test_logged_notification_is_not_counted_as_mail() {
    let mut notifier = MockNotifier::new();
    // 异常告警只写入了日志，结束时再发一次失败通知
    let mut sequence = mockall::Sequence::new();
    notifier
        .expect_notify_admins()
        .withf(|subject, _| subject == "[MASH ALERT] Exception during the processing of a job")
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|_, _| Ok(Delivery::Logged));
    notifier
        .expect_notify_admins()
        .withf(|subject, _| subject == "[MASH ALERT] Exception during the processing of the job")
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|_, _| Ok(Delivery::Sent));
    notifier.expect_notify_user().never();

    let setup = Setup::with_notifier(Arc::new(notifier));
    let server = unidentified(&setup, 11020).await;
    setup
        .harness
        .connector
        .add_server("127.0.0.1", 11020, ServerScript::new().on("INFO", Vec::new()));

    let runner = identificator(&setup);
    let job_id = runner.enqueue(identify(server.id)).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, JobStatus::Failed).await);
    assert!(TestEnv::wait_for(|| async { runner.queue().is_empty().await }, TIMEOUT).await);
}
