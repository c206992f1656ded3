use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use scheduler_core::{Delivery, NotificationConfig, Notifier, SchedulerError, SchedulerResult, SmtpConfig};
use tracing::{info, warn};

/// 按配置选择通知器：配置了 SMTP 时发送邮件，否则只写日志
pub fn build_notifier(config: &NotificationConfig) -> SchedulerResult<Arc<dyn Notifier>> {
    match &config.smtp {
        Some(smtp) => {
            let notifier = SmtpNotifier::from_config(smtp, config)?;
            info!("通知通过 SMTP 服务器 {} 发送", smtp.host);
            Ok(Arc::new(notifier))
        }
        None => {
            info!("未配置 SMTP 服务器，通知只写入日志");
            Ok(Arc::new(TracingNotifier::new(config.admins.clone())))
        }
    }
}

/// 把通知写入日志的通知器
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier {
    admins: Vec<String>,
}

impl TracingNotifier {
    pub fn new(admins: Vec<String>) -> Self {
        Self { admins }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_admins(&self, subject: &str, body: &str) -> SchedulerResult<Delivery> {
        warn!(
            target: "mash_scheduler::notifications",
            recipients = ?self.admins,
            subject = subject,
            "{}",
            body
        );
        Ok(Delivery::Logged)
    }

    async fn notify_user(&self, user: &str, subject: &str, body: &str) -> SchedulerResult<Delivery> {
        warn!(
            target: "mash_scheduler::notifications",
            recipient = user,
            subject = subject,
            "{}",
            body
        );
        Ok(Delivery::Logged)
    }
}

/// 通过 SMTP 发送邮件的通知器
///
/// 邮箱未知的用户的通知改为写入日志。
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    admins: Vec<Mailbox>,
    /// 键为小写的用户名
    users: HashMap<String, Mailbox>,
    fallback: TracingNotifier,
}

impl SmtpNotifier {
    pub fn from_config(smtp: &SmtpConfig, notifications: &NotificationConfig) -> SchedulerResult<Self> {
        let from = parse_mailbox(&smtp.from)?;
        let admins = notifications
            .admins
            .iter()
            .map(|address| parse_mailbox(address))
            .collect::<SchedulerResult<Vec<_>>>()?;
        if admins.is_empty() {
            return Err(SchedulerError::Configuration("至少需要一个管理员邮箱".to_string()));
        }

        let users = notifications
            .users
            .iter()
            .map(|entry| Ok((entry.name.to_lowercase(), parse_mailbox(&entry.email)?)))
            .collect::<SchedulerResult<HashMap<_, _>>>()?;

        let port = smtp.port.unwrap_or(587);
        let mut builder = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
                .map_err(|e| SchedulerError::Configuration(e.to_string()))?
                .port(port)
        } else if smtp.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                .map_err(|e| SchedulerError::Configuration(e.to_string()))?
                .port(port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host).port(port)
        };

        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            admins,
            users,
            fallback: TracingNotifier::new(notifications.admins.clone()),
        })
    }

    async fn deliver(&self, recipients: &[Mailbox], subject: &str, body: &str) -> SchedulerResult<()> {
        let mut message = Message::builder().from(self.from.clone());
        for recipient in recipients {
            message = message.to(recipient.clone());
        }
        let email = message
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| SchedulerError::Notification(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| SchedulerError::Notification(e.to_string()))?;

        info!(subject = subject, recipients = recipients.len(), "邮件已发送");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify_admins(&self, subject: &str, body: &str) -> SchedulerResult<Delivery> {
        self.deliver(&self.admins, subject, body).await?;
        Ok(Delivery::Sent)
    }

    async fn notify_user(&self, user: &str, subject: &str, body: &str) -> SchedulerResult<Delivery> {
        let Some(address) = self.users.get(&user.to_lowercase()) else {
            return self.fallback.notify_user(user, subject, body).await;
        };
        self.deliver(std::slice::from_ref(address), subject, body).await?;
        Ok(Delivery::Sent)
    }
}

fn parse_mailbox(address: &str) -> SchedulerResult<Mailbox> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| {
            SchedulerError::Configuration(format!("无效的邮箱地址 '{address}': {e}"))
        })
}
