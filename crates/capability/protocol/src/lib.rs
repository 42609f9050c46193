//! # OTGW 协议能力模块
//!
//! OpenTherm Gateway 通过 TCP 输出文本行，本模块负责：
//! - **FrameCodec**：把单行报文解码为数据点更新或命令回执
//! - **DeviceLink**：维护到网关的 TCP 连接，按行收发并自动重连
//! - **PassthroughServer**：透传端口，供其他客户端直接收发原始报文
//!
//! ## 数据流
//!
//! ```text
//! OTGW ──TCP──▶ DeviceLink ──LinkEvent::LineReceived──▶ FrameCodec ──▶ Decoded
//!   ▲                                   │
//!   │                                   └──▶ PassthroughServer::broadcast
//!   └──── DeviceWriter::send_line ◀── 总线命令 / 透传客户端
//! ```

mod codec;
mod device_link;
mod error;
mod passthrough;
mod types;

pub use codec::{Decoded, FrameCodec, MessageKind, StatusFrame, TargetRole};
pub use device_link::{DEFAULT_RECONNECT_DELAY, DeviceLink, DeviceLinkConfig, DeviceWriter};
pub use error::ProtocolError;
pub use passthrough::{PassthroughConfig, PassthroughServer};
pub use types::*;
