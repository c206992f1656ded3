use scheduler_core::{Channel, Message, SchedulerError, SchedulerResult};
use tracing::debug;

/// 通过已建立的连接取回服务器的日志文件
///
/// 发送 `LOGS`，然后反复读取 `LOG_FILE <name> <size>` 及其数据，收到其它响应时停止。
/// `filter` 不为空时只保留名字在其中的文件。
pub async fn fetch_server_logs(
    channel: &mut dyn Channel,
    filter: Option<&[&str]>,
) -> SchedulerResult<Vec<(String, Vec<u8>)>> {
    channel.send_message(&Message::named("LOGS")).await?;

    let mut files = Vec::new();
    loop {
        let response = channel.wait_response().await?;
        if !response.is("LOG_FILE") || response.parameters().len() != 2 {
            break;
        }

        let name = response.str_param(0)?;
        let size = usize::try_from(response.int_param(1)?).map_err(|_| SchedulerError::Protocol {
            expected: "非负的日志文件长度".to_string(),
            got: response.to_string(),
        })?;
        let content = channel.wait_data(size).await?;

        let wanted = filter.map(|f| f.contains(&name.as_str())).unwrap_or(true);
        if wanted {
            debug!("收到服务器日志文件 {} ({} 字节)", name, size);
            files.push((name, content));
        }
    }

    Ok(files)
}
