//! 协议相关类型定义

use std::fmt;

/// 网关连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectPending => "reconnect_pending",
        };
        f.write_str(name)
    }
}

/// 断开原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 对端正常关闭
    PeerClosed,
    /// 读写出错（包括空行）
    Errored(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("clean"),
            Self::Errored(message) => f.write_str(message),
        }
    }
}

/// 网关链路事件
///
/// 由 `DeviceLink` 按到达顺序发送到单一通道。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { addr: String },
    ConnectFailed { error: String },
    Disconnected { reason: DisconnectReason },
    /// 完整的一行（已去掉行结束符）
    LineReceived(String),
}
