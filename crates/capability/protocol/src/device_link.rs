//! 网关 TCP 链路
//!
//! 维护到 OTGW 的单一逻辑连接：按行读取、写入命令、故障后固定间隔自动重连。
//!
//! ## 状态迁移
//!
//! ```text
//! Disconnected ──start()──▶ Connecting ──ok──▶ Connected
//!                               ▲  │ err          │ 读写故障 / 对端关闭 / 空行
//!                     延迟到期  │  ▼              ▼
//!                           ReconnectPending ◀────┘
//! stop()：任意状态 ──▶ Disconnected
//! ```
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let (link, mut events) = DeviceLink::new(DeviceLinkConfig::new("192.168.1.20", 2323));
//! link.start();
//! while let Some(event) = events.recv().await {
//!     // LinkEvent::LineReceived(line) ...
//! }
//! ```

use crate::types::{ConnectionState, DisconnectReason, LinkEvent};
use async_trait::async_trait;
use domain::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 事件通道容量；满时读循环等待，不丢行也不合并
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 默认重连间隔
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// 行结束符
const LINE_TERMINATOR: &str = "\r\n";

/// 网关链路配置
#[derive(Debug, Clone)]
pub struct DeviceLinkConfig {
    /// 网关主机地址
    pub host: String,
    /// 网关端口
    pub port: u16,
    /// 重连间隔
    pub reconnect_delay: Duration,
}

impl DeviceLinkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 网关写入抽象
///
/// 未连接时写入直接丢弃（不排队、不报错），返回 `false`。
#[async_trait]
pub trait DeviceWriter: Send + Sync {
    /// 写入一行（自动追加 `\r\n`）
    async fn send_line(&self, line: &str) -> bool;

    /// 原样写入字节
    async fn send_raw(&self, data: &[u8]) -> bool;

    /// 写入 `CODE=value\r\n`
    async fn send_command(&self, command: &Command) -> bool {
        info!(target: "otgw.link", command = %command, "command_send");
        self.send_line(&command.to_wire()).await
    }
}

/// 当前连接的写半部
struct SessionWriter {
    session: u64,
    half: OwnedWriteHalf,
    /// 写失败时通知读循环结束本次连接
    fault: CancellationToken,
}

struct Lifecycle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct LinkShared {
    config: DeviceLinkConfig,
    events: mpsc::Sender<LinkEvent>,
    state: watch::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    lifecycle: Mutex<Lifecycle>,
    next_session: AtomicU64,
}

/// 网关 TCP 链路
#[derive(Clone)]
pub struct DeviceLink {
    shared: Arc<LinkShared>,
}

impl DeviceLink {
    /// 创建链路；事件按到达顺序从返回的接收端读出
    pub fn new(config: DeviceLinkConfig) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let shared = LinkShared {
            config,
            events,
            state,
            writer: tokio::sync::Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle { cancel, task: None }),
            next_session: AtomicU64::new(1),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            receiver,
        )
    }

    /// 当前连接状态
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// 订阅连接状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// 启动链路监督任务；已在运行时忽略
    pub fn start(&self) {
        let mut lifecycle = self.shared.lock_lifecycle();
        if !lifecycle.cancel.is_cancelled() {
            debug!(target: "otgw.link", "link already started");
            return;
        }

        info!(
            target: "otgw.link",
            addr = %self.shared.config.addr(),
            "attempting to open connection to gateway"
        );
        let cancel = CancellationToken::new();
        lifecycle.cancel = cancel.clone();
        self.shared.state.send_replace(ConnectionState::Connecting);

        let shared = Arc::clone(&self.shared);
        lifecycle.task = Some(tokio::spawn(async move {
            shared.supervise(cancel).await;
        }));
    }

    /// 强制断开并取消待执行的重连；可重复调用
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.shared.lock_lifecycle();
            if !lifecycle.cancel.is_cancelled() {
                info!(target: "otgw.link", "disconnecting from gateway");
            }
            lifecycle.cancel.cancel();
            lifecycle.task = None;
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
        self.shared.writer.lock().await.take();
    }

    async fn write(&self, data: &[u8]) -> bool {
        let cancel = self.shared.lock_lifecycle().cancel.clone();
        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!(target: "otgw.link", bytes = data.len(), "not connected, write dropped");
            return false;
        };

        // 对端不读时 write_all 会一直挂起，stop() 需要能打断它并拿到写锁
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                writer.half.write_all(data).await?;
                writer.half.flush().await
            } => Some(result),
        };
        match result {
            None => {
                debug!(target: "otgw.link", bytes = data.len(), "link stopped, write aborted");
                guard.take();
                false
            }
            Some(Ok(())) => true,
            Some(Err(err)) => {
                error!(target: "otgw.link", error = %err, "exception during writing to gateway");
                if let Some(writer) = guard.take() {
                    writer.fault.cancel();
                }
                false
            }
        }
    }
}

#[async_trait]
impl DeviceWriter for DeviceLink {
    async fn send_line(&self, line: &str) -> bool {
        let mut framed = String::with_capacity(line.len() + LINE_TERMINATOR.len());
        framed.push_str(line);
        framed.push_str(LINE_TERMINATOR);
        self.write(framed.as_bytes()).await
    }

    async fn send_raw(&self, data: &[u8]) -> bool {
        self.write(data).await
    }
}

impl LinkShared {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 状态迁移；已停止的任务不再改写状态
    fn transition(&self, cancel: &CancellationToken, next: ConnectionState) -> bool {
        let _lifecycle = self.lock_lifecycle();
        if cancel.is_cancelled() {
            return false;
        }
        self.state.send_replace(next);
        true
    }

    async fn emit(&self, cancel: &CancellationToken, event: LinkEvent) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    debug!(target: "otgw.link", "link event receiver dropped");
                }
            }
        }
    }

    async fn supervise(&self, cancel: CancellationToken) {
        let addr = self.config.addr();
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = TcpStream::connect(&addr) => result,
            };

            match connected {
                Ok(stream) => {
                    let Some(reason) = self.run_session(stream, &cancel).await else {
                        break;
                    };
                    if !self.transition(&cancel, ConnectionState::ReconnectPending) {
                        break;
                    }
                    match &reason {
                        DisconnectReason::PeerClosed => {
                            info!(target: "otgw.link", addr = %addr, "gateway disconnected (clean)")
                        }
                        DisconnectReason::Errored(message) => {
                            error!(
                                target: "otgw.link",
                                addr = %addr,
                                error = %message,
                                "exception during reading from gateway"
                            )
                        }
                    }
                    self.emit(&cancel, LinkEvent::Disconnected { reason }).await;
                }
                Err(err) => {
                    if !self.transition(&cancel, ConnectionState::ReconnectPending) {
                        break;
                    }
                    warn!(target: "otgw.link", addr = %addr, error = %err, "unable to connect to gateway");
                    self.emit(
                        &cancel,
                        LinkEvent::ConnectFailed {
                            error: err.to_string(),
                        },
                    )
                    .await;
                }
            }

            info!(
                target: "otgw.link",
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "scheduling reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            if !self.transition(&cancel, ConnectionState::Connecting) {
                break;
            }
            info!(target: "otgw.link", addr = %addr, "attempting to open connection to gateway");
        }
        debug!(target: "otgw.link", "link supervisor stopped");
    }

    /// 单次连接的生命周期；返回 `None` 表示被 `stop()` 中止
    async fn run_session(
        &self,
        stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Option<DisconnectReason> {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let fault = CancellationToken::new();
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(SessionWriter {
            session,
            half: write_half,
            fault: fault.clone(),
        });

        let outcome = if self.transition(cancel, ConnectionState::Connected) {
            let addr = self.config.addr();
            info!(target: "otgw.link", addr = %addr, "connected to gateway");
            self.emit(cancel, LinkEvent::Connected { addr }).await;
            self.read_loop(read_half, cancel, &fault).await
        } else {
            None
        };

        let mut writer = self.writer.lock().await;
        if writer.as_ref().is_some_and(|w| w.session == session) {
            writer.take();
        }
        outcome
    }

    async fn read_loop(
        &self,
        read_half: OwnedReadHalf,
        cancel: &CancellationToken,
        fault: &CancellationToken,
    ) -> Option<DisconnectReason> {
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = fault.cancelled() => {
                    return Some(DisconnectReason::Errored("write failed".to_string()));
                }
                result = reader.read_until(b'\n', &mut buf) => result,
            };

            match read {
                Ok(0) => return Some(DisconnectReason::PeerClosed),
                Ok(_) => {
                    let raw = String::from_utf8_lossy(&buf);
                    let line = raw.trim_end_matches(['\r', '\n']);
                    // 协议不会发送空行
                    if line.is_empty() {
                        return Some(DisconnectReason::Errored("empty line received".to_string()));
                    }
                    debug!(target: "otgw.link", line = %line, "received");
                    self.emit(cancel, LinkEvent::LineReceived(line.to_string()))
                        .await;
                }
                Err(err) => return Some(DisconnectReason::Errored(err.to_string())),
            }
        }
    }
}
