//! 总线 topic 约定。
//!
//! - 状态：`{prefix}otgw/status/{name}`
//! - 命令结果：`{prefix}otgw/status/command_{code}`
//! - 命令订阅：`{prefix}otgw/command/+`
//!
//! 前缀原样拼接（不自动补 `/`），与现有部署保持一致。

use crate::BusError;
use domain::Command;

/// 数据点状态 topic。
pub fn status_topic(prefix: &str, name: &str) -> String {
    format!("{}otgw/status/{}", prefix, name)
}

/// 命令结果 topic（命令码转小写）。
pub fn command_result_topic(prefix: &str, code: &str) -> String {
    format!("{}otgw/status/command_{}", prefix, code.to_lowercase())
}

/// 命令订阅过滤器。
pub fn command_filter(prefix: &str) -> String {
    format!("{}otgw/command/+", prefix)
}

/// 从入站命令消息解析出网关命令。
///
/// topic 最后一段（转大写）为命令码，payload 为命令值。
pub fn parse_command(prefix: &str, topic: &str, payload: &[u8]) -> Result<Command, BusError> {
    let base = format!("{}otgw/command/", prefix);
    let code = topic
        .strip_prefix(&base)
        .filter(|code| !code.is_empty() && !code.contains('/'))
        .ok_or_else(|| BusError::Topic(topic.to_string()))?;
    let value = std::str::from_utf8(payload)
        .map_err(|err| BusError::Payload(format!("{}: {}", topic, err)))?;
    Ok(Command::new(code.to_uppercase(), value))
}
