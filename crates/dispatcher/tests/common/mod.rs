#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use scheduler_core::{JobStatus, Message, Notifier};
use scheduler_dispatcher::{TaskContext, TaskSettings};
use scheduler_testing_utils::{TestEnv, TestHarness};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// 测试环境加上任务上下文；任务发出的消息留在 `inbox` 中
pub struct Setup {
    pub harness: TestHarness,
    pub ctx: TaskContext,
    pub inbox: mpsc::UnboundedReceiver<Message>,
}

impl Setup {
    pub fn new() -> Self {
        Self::with_settings(TaskSettings::default())
    }

    pub fn with_settings(settings: TaskSettings) -> Self {
        let harness = TestHarness::new();
        let notifier = harness.notifier.clone();
        Self::build(harness, settings, notifier)
    }

    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self::build(TestHarness::new(), TaskSettings::default(), notifier)
    }

    fn build(harness: TestHarness, settings: TaskSettings, notifier: Arc<dyn Notifier>) -> Self {
        TestEnv::init_logging();

        let (sender, inbox) = mpsc::unbounded_channel();
        let ctx = TaskContext::new(
            harness.repositories(),
            harness.connector.clone(),
            notifier,
            harness.storage.clone(),
            settings,
            sender,
        );

        Self { harness, ctx, inbox }
    }

    pub async fn job_status(&self, job_id: i64) -> Option<JobStatus> {
        self.ctx
            .repositories
            .jobs
            .find_by_id(job_id)
            .await
            .unwrap()
            .map(|record| record.status)
    }

    /// 等待Job的持久化状态变为 `status`
    pub async fn wait_status(&self, job_id: i64, status: JobStatus) -> bool {
        TestEnv::wait_for(|| async move { self.job_status(job_id).await == Some(status) }, TIMEOUT).await
    }

    /// 等待下一条名为 `name` 的消息，跳过其他消息
    pub async fn next_message(&mut self, name: &str) -> Option<Message> {
        tokio::time::timeout(TIMEOUT, async {
            while let Some(message) = self.inbox.recv().await {
                if message.is(name) {
                    return Some(message);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// 已经发出的全部消息
    pub fn drain_messages(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = self.inbox.try_recv() {
            messages.push(message);
        }
        messages
    }
}
