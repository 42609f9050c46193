//! 日志初始化与运行计数。

use std::any::Any;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 运行计数快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lines_received: u64,
    pub frames_decoded: u64,
    pub lines_ignored: u64,
    pub decode_failures: u64,
    pub values_changed: u64,
    pub publish_success: u64,
    pub publish_failure: u64,
    pub publish_skipped: u64,
    pub commands_sent: u64,
    pub commands_dropped: u64,
    pub link_connects: u64,
    pub reconnects_scheduled: u64,
}

/// 运行计数。
pub struct TelemetryMetrics {
    lines_received: AtomicU64,
    frames_decoded: AtomicU64,
    lines_ignored: AtomicU64,
    decode_failures: AtomicU64,
    values_changed: AtomicU64,
    publish_success: AtomicU64,
    publish_failure: AtomicU64,
    publish_skipped: AtomicU64,
    commands_sent: AtomicU64,
    commands_dropped: AtomicU64,
    link_connects: AtomicU64,
    reconnects_scheduled: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            lines_received: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            lines_ignored: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            values_changed: AtomicU64::new(0),
            publish_success: AtomicU64::new(0),
            publish_failure: AtomicU64::new(0),
            publish_skipped: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            link_connects: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            lines_ignored: self.lines_ignored.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            values_changed: self.values_changed.load(Ordering::Relaxed),
            publish_success: self.publish_success.load(Ordering::Relaxed),
            publish_failure: self.publish_failure.load(Ordering::Relaxed),
            publish_skipped: self.publish_skipped.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            link_connects: self.link_connects.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局计数实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing。
///
/// 优先 `RUST_LOG`，其次 `LOG_LEVEL`（兼容 `Debug`/`Information`/`Warning` 等写法），默认 info。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|value| normalize_level(&value))
            .unwrap_or("info");
        EnvFilter::new(level)
    });
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 把未处理的 panic 写入 tracing 日志（需在 `init_tracing` 之后调用）。
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|location| format!("{}:{}", location.file(), location.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            target: "otgw.bridge",
            panic = %panic_message(info.payload()),
            location = %location,
            "unhandled panic"
        );
    }));
}

/// 提取 panic 载荷中的文本。
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// 把常见日志级别写法映射为 tracing 级别。
pub fn normalize_level(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "verbose" | "trace" => Some("trace"),
        "debug" => Some("debug"),
        "information" | "info" => Some("info"),
        "warning" | "warn" => Some("warn"),
        "error" | "fatal" => Some("error"),
        _ => None,
    }
}

/// 记录网关行接收次数。
pub fn record_line_received() {
    metrics().lines_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录状态帧解码次数。
pub fn record_frame_decoded() {
    metrics().frames_decoded.fetch_add(1, Ordering::Relaxed);
}

/// 记录被忽略的行。
pub fn record_line_ignored() {
    metrics().lines_ignored.fetch_add(1, Ordering::Relaxed);
}

/// 记录解码失败次数。
pub fn record_decode_failure() {
    metrics().decode_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录数据点变更次数。
pub fn record_value_changed() {
    metrics().values_changed.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 发布成功次数。
pub fn record_publish_success() {
    metrics().publish_success.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 发布失败次数。
pub fn record_publish_failure() {
    metrics().publish_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录总线未连接时跳过的发布。
pub fn record_publish_skipped() {
    metrics().publish_skipped.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入网关的命令次数。
pub fn record_command_sent() {
    metrics().commands_sent.fetch_add(1, Ordering::Relaxed);
}

/// 记录因未连接而丢弃的命令。
pub fn record_command_dropped() {
    metrics().commands_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录网关连接建立次数。
pub fn record_link_connected() {
    metrics().link_connects.fetch_add(1, Ordering::Relaxed);
}

/// 记录重连调度次数。
pub fn record_reconnect_scheduled() {
    metrics()
        .reconnects_scheduled
        .fetch_add(1, Ordering::Relaxed);
}
