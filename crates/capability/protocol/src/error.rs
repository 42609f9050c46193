//! 协议错误类型定义

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}
