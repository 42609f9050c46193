//! 透传 TCP 服务器
//!
//! 允许其他客户端直接与网关对话：
//! - 客户端发来的每一行作为原始命令转发给网关；
//! - 网关输出的每一行广播给所有已连接客户端。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let (server, mut commands) = PassthroughServer::new(PassthroughConfig::new(2323));
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.run(cancel).await }
//! });
//! server.broadcast("B40191580");
//! ```

use crate::error::ProtocolError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 广播缓冲（行数）；慢客户端超出后丢弃最旧的行
const BROADCAST_CAPACITY: usize = 256;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// 透传服务器配置
#[derive(Debug, Clone)]
pub struct PassthroughConfig {
    /// 监听端口
    pub listen_port: u16,
    /// 最大连接数
    pub max_connections: usize,
}

impl PassthroughConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> usize {
    16
}

/// 透传 TCP 服务器
#[derive(Clone)]
pub struct PassthroughServer {
    config: PassthroughConfig,
    lines: broadcast::Sender<String>,
    commands: mpsc::Sender<String>,
    slots: Arc<Semaphore>,
}

impl PassthroughServer {
    /// 创建服务器；客户端命令从返回的接收端读出
    pub fn new(config: PassthroughConfig) -> (Self, mpsc::Receiver<String>) {
        let (lines, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let slots = Arc::new(Semaphore::new(config.max_connections));
        (
            Self {
                config,
                lines,
                commands,
                slots,
            },
            receiver,
        )
    }

    /// 广播一行网关输出；返回收到的客户端数
    pub fn broadcast(&self, line: &str) -> usize {
        self.lines.send(format!("{}\r\n", line)).unwrap_or(0)
    }

    /// 订阅广播（与客户端收到的内容一致）
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    /// 绑定配置端口并运行
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProtocolError> {
        let addr = format!("0.0.0.0:{}", self.config.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener, cancel).await
    }

    /// 在已绑定的监听器上接受连接，直到取消
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ProtocolError> {
        info!(
            target: "otgw.passthrough",
            addr = %listener.local_addr()?,
            "passthrough server listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                        warn!(
                            target: "otgw.passthrough",
                            peer = %peer_addr,
                            max_connections = self.config.max_connections,
                            "connection limit reached, rejecting"
                        );
                        continue;
                    };
                    info!(target: "otgw.passthrough", peer = %peer_addr, "new connection");

                    let lines = self.lines.subscribe();
                    let commands = self.commands.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, lines, commands, cancel).await
                        {
                            warn!(target: "otgw.passthrough", peer = %peer_addr, error = %e, "connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(target: "otgw.passthrough", error = %e, "failed to accept connection");
                }
            }
        }

        info!(target: "otgw.passthrough", "passthrough server stopped");
        Ok(())
    }
}

/// 处理单个客户端连接
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut lines: broadcast::Receiver<String>,
    commands: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut peer_lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outgoing = lines.recv() => match outgoing {
                Ok(data) => write_half.write_all(data.as_bytes()).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "otgw.passthrough", peer = %peer_addr, skipped, "client lagging, lines skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = peer_lines.next_line() => {
                let Some(command) = incoming? else {
                    info!(target: "otgw.passthrough", peer = %peer_addr, "connection closed");
                    break;
                };
                let command = command.trim_end_matches('\r');
                if command.is_empty() {
                    continue;
                }
                debug!(target: "otgw.passthrough", peer = %peer_addr, command = %command, "received raw command");
                commands
                    .send(command.to_string())
                    .await
                    .map_err(|_| ProtocolError::ChannelClosed)?;
            }
        }
    }

    Ok(())
}
