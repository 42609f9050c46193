//! OTGW 行协议解码
//!
//! 网关每行输出一条报文，两种形状：
//!
//! ```text
//! B40190480      状态帧：<角色><类型><保留><ID:2 hex><载荷:4 hex>
//! TT: 20.50      命令回执：<命令:2>: <结果>
//! ```
//!
//! 其余形状的行直接忽略。解码过程中的任何错误只记录日志，不会中断数据流。

use crate::error::ProtocolError;
use domain::points::{self, flame_bits};
use domain::{Command, DataPointId, DataPointUpdate, DataPointValue, Encoding, PointSource};
use tracing::{debug, warn};

/// 状态帧长度（字符）
const STATUS_FRAME_LEN: usize = 9;

/// 接受的消息类型标记：WriteData / ReadAck（含奇偶校验位）
const ACCEPTED_KIND_MARKERS: [char; 4] = ['1', '4', '9', 'C'];

/// 状态汇总开关命令
const STATUS_SUMMARY_CODE: &str = "PS";

/// 报文来源角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRole {
    /// `B`：锅炉侧应答
    Boiler,
    /// `T`：温控器请求
    Thermostat,
    /// `A`：网关代发的替代请求
    Alternative,
}

impl TargetRole {
    /// `E`（错误）与 `R`（网关改写）不在解码范围内
    fn from_marker(marker: char) -> Option<Self> {
        match marker {
            'B' => Some(Self::Boiler),
            'T' => Some(Self::Thermostat),
            'A' => Some(Self::Alternative),
            _ => None,
        }
    }
}

/// OpenTherm 消息类型（首个半字节的低 3 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ReadData,
    WriteData,
    ReadAck,
    WriteAck,
}

impl MessageKind {
    fn from_marker(marker: char) -> Option<Self> {
        let nibble = marker.to_digit(16)?;
        match nibble & 0x7 {
            0 => Some(Self::ReadData),
            1 => Some(Self::WriteData),
            4 => Some(Self::ReadAck),
            5 => Some(Self::WriteAck),
            _ => None,
        }
    }
}

/// 解码后的状态帧
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFrame {
    pub target: TargetRole,
    pub kind: MessageKind,
    pub id: DataPointId,
    /// 原始 4 位十六进制载荷
    pub payload: String,
    /// 主数据点在前，随后是按声明顺序排列的派生点位
    pub updates: Vec<DataPointUpdate>,
}

/// 单行解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Status(StatusFrame),
    CommandResult { code: String, result: String },
    /// 解码产生的内部后续命令（不向调用方报告数值）
    FollowUp(Command),
    Ignored,
}

/// OTGW 帧解码器（无状态）
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// 解码一行；错误记录后按 `Ignored` 处理
    pub fn decode(&self, line: &str) -> Decoded {
        match self.try_decode(line) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(target: "otgw.codec", line = %line, error = %err, "frame_decode_failed");
                Decoded::Ignored
            }
        }
    }

    /// 解码一行并返回解析错误
    pub fn try_decode(&self, line: &str) -> Result<Decoded, ProtocolError> {
        let line = line.replace('\r', "");

        if line.contains(':') {
            return decode_command_result(&line);
        }

        if line.chars().count() != STATUS_FRAME_LEN {
            debug!(target: "otgw.codec", line = %line, "frame_shape_skipped");
            return Ok(Decoded::Ignored);
        }
        if !line.is_ascii() {
            return Err(ProtocolError::DataParse(format!(
                "non-ascii status frame '{}'",
                line
            )));
        }

        let bytes = line.as_bytes();
        let Some(target) = TargetRole::from_marker(bytes[0] as char) else {
            return Ok(Decoded::Ignored);
        };
        let marker = bytes[1] as char;
        if !ACCEPTED_KIND_MARKERS.contains(&marker) {
            return Ok(Decoded::Ignored);
        }
        let kind = MessageKind::from_marker(marker).ok_or_else(|| {
            ProtocolError::DataParse(format!("unknown message kind '{}'", marker))
        })?;

        let id = DataPointId(parse_hex(&line[3..5])?);
        let payload = &line[STATUS_FRAME_LEN - 4..];

        let Some(def) = points::lookup(id) else {
            debug!(target: "otgw.codec", id = %id, "unknown_data_point_skipped");
            return Ok(Decoded::Ignored);
        };

        let updates = match def.source {
            PointSource::Wire(Encoding::Flag8) => {
                // A 帧的 ID 0 语义不同
                if target == TargetRole::Alternative {
                    return Ok(Decoded::Ignored);
                }
                decode_flag8(id, payload)?
            }
            PointSource::Wire(Encoding::Fixed8_8) => vec![DataPointUpdate {
                id,
                value: DataPointValue::Fixed(decode_fixed8_8(payload)?),
            }],
            PointSource::Wire(Encoding::Uint16) => vec![DataPointUpdate {
                id,
                value: DataPointValue::Unsigned(parse_hex(payload)?),
            }],
            PointSource::FlameBit(_) => return Ok(Decoded::Ignored),
        };

        Ok(Decoded::Status(StatusFrame {
            target,
            kind,
            id,
            payload: payload.to_string(),
            updates,
        }))
    }
}

fn decode_command_result(line: &str) -> Result<Decoded, ProtocolError> {
    let code = line
        .get(0..2)
        .ok_or_else(|| ProtocolError::DataParse(format!("short command result '{}'", line)))?;
    let result = line
        .get(4..)
        .ok_or_else(|| ProtocolError::DataParse(format!("short command result '{}'", line)))?;

    if code == STATUS_SUMMARY_CODE {
        // 汇总模式只回一次状态，切回连续输出
        if result == "1" {
            return Ok(Decoded::FollowUp(Command::new(STATUS_SUMMARY_CODE, "0")));
        }
        return Ok(Decoded::Ignored);
    }

    Ok(Decoded::CommandResult {
        code: code.to_string(),
        result: result.to_string(),
    })
}

/// 解码 flag8 载荷，并派生 flame_status 标志位
fn decode_flag8(id: DataPointId, payload: &str) -> Result<Vec<DataPointUpdate>, ProtocolError> {
    let high = parse_hex(&payload[0..2])?;
    let low = parse_hex(&payload[2..4])?;
    let flags = format!("{:08b}/{:08b}", high, low);

    let mut updates = Vec::with_capacity(7);
    for (def, offset) in flame_bits() {
        let bit = flags.as_bytes().get(offset).copied().ok_or_else(|| {
            ProtocolError::DataParse(format!("flag offset {} out of range", offset))
        })?;
        updates.push(DataPointUpdate {
            id: def.id,
            value: DataPointValue::Bit(bit == b'1'),
        });
    }
    updates.insert(
        0,
        DataPointUpdate {
            id,
            value: DataPointValue::Flags(flags),
        },
    );
    Ok(updates)
}

/// 有符号 8.8 定点数，保留两位小数（银行家舍入）
fn decode_fixed8_8(payload: &str) -> Result<f64, ProtocolError> {
    let raw = parse_hex(payload)? as i16;
    let value = (f64::from(raw) / 256.0 * 100.0).round_ties_even() / 100.0;
    // 避免渲染出 "-0"
    Ok(if value == 0.0 { 0.0 } else { value })
}

fn parse_hex(digits: &str) -> Result<u16, ProtocolError> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtocolError::DataParse(format!("invalid hex '{}'", digits)));
    }
    u16::from_str_radix(digits, 16).map_err(|e| ProtocolError::DataParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(line: &str) -> StatusFrame {
        match FrameCodec::new().decode(line) {
            Decoded::Status(frame) => frame,
            other => panic!("expected status frame, got {:?}", other),
        }
    }

    fn value_of(frame: &StatusFrame, id: u16) -> DataPointValue {
        frame
            .updates
            .iter()
            .find(|update| update.id == DataPointId(id))
            .map(|update| update.value.clone())
            .expect("update present")
    }

    #[test]
    fn test_decode_fixed8_8() {
        let frame = status("B40191580");
        assert_eq!(frame.target, TargetRole::Boiler);
        assert_eq!(frame.kind, MessageKind::ReadAck);
        assert_eq!(frame.id, DataPointId(25));
        assert_eq!(frame.payload, "1580");
        assert_eq!(frame.updates.len(), 1);
        assert_eq!(value_of(&frame, 25), DataPointValue::Fixed(21.5));
    }

    #[test]
    fn test_decode_fixed8_8_negative_and_rounded() {
        // 0xFF80 = -128 → -0.5
        assert_eq!(value_of(&status("BC01BFF80"), 27), DataPointValue::Fixed(-0.5));
        // 0x1234 = 4660 → 18.203125 → 18.2
        assert_eq!(value_of(&status("T10011234"), 1), DataPointValue::Fixed(18.2));
    }

    #[test]
    fn test_decode_uint16() {
        let frame = status("B4074010A");
        assert_eq!(value_of(&frame, 116), DataPointValue::Unsigned(266));
    }

    #[test]
    fn test_decode_flame_status_fan_out() {
        let frame = status("B40000480");
        let ids: Vec<u16> = frame.updates.iter().map(|update| update.id.0).collect();
        assert_eq!(ids, vec![0, 1001, 1002, 1003, 1004, 1005, 1006]);
        assert_eq!(
            value_of(&frame, 0),
            DataPointValue::Flags("00000100/10000000".to_string())
        );
        for id in 1001..=1006 {
            assert_eq!(value_of(&frame, id), DataPointValue::Bit(false));
        }
    }

    #[test]
    fn test_flame_status_offsets() {
        // 高字节 0x02 → index 6；低字节 0x0F → index 13..=16
        let frame = status("B4000020F");
        assert_eq!(
            value_of(&frame, 0),
            DataPointValue::Flags("00000010/00001111".to_string())
        );
        assert_eq!(value_of(&frame, 1001), DataPointValue::Bit(false));
        assert_eq!(value_of(&frame, 1002), DataPointValue::Bit(true));
        assert_eq!(value_of(&frame, 1003), DataPointValue::Bit(true));
        assert_eq!(value_of(&frame, 1004), DataPointValue::Bit(true));
        assert_eq!(value_of(&frame, 1005), DataPointValue::Bit(true));
        assert_eq!(value_of(&frame, 1006), DataPointValue::Bit(true));

        // 低字节 0x10 → index 12（cooling）
        let frame = status("T10000010");
        assert_eq!(value_of(&frame, 1001), DataPointValue::Bit(true));
        assert_eq!(value_of(&frame, 1002), DataPointValue::Bit(false));
    }

    #[test]
    fn test_alternative_flame_status_is_skipped() {
        assert_eq!(FrameCodec::new().decode("A10000300"), Decoded::Ignored);
        // A 帧的其他点位照常解码
        assert_eq!(
            value_of(&status("A1010143C"), 16),
            DataPointValue::Fixed(20.23)
        );
    }

    #[test]
    fn test_rejected_roles_and_kinds() {
        let codec = FrameCodec::new();
        assert_eq!(codec.decode("E40191580"), Decoded::Ignored);
        assert_eq!(codec.decode("R40191580"), Decoded::Ignored);
        assert_eq!(codec.decode("B00191580"), Decoded::Ignored);
        assert_eq!(codec.decode("B50191580"), Decoded::Ignored);
        assert_eq!(codec.decode("B70191580"), Decoded::Ignored);
    }

    #[test]
    fn test_unknown_id_is_ignored_without_error() {
        // 0x63 = 99，不在表中
        assert!(matches!(
            FrameCodec::new().try_decode("B40630000"),
            Ok(Decoded::Ignored)
        ));
    }

    #[test]
    fn test_malformed_lines() {
        let codec = FrameCodec::new();
        assert_eq!(codec.decode("B401915800"), Decoded::Ignored);
        assert_eq!(codec.decode(""), Decoded::Ignored);
        assert_eq!(codec.decode("OpenTherm Gateway 4.2.5"), Decoded::Ignored);
        assert!(codec.try_decode("B40ZZ1580").is_err());
        assert!(codec.try_decode("B4019G580").is_err());
        assert_eq!(codec.decode("B40ZZ1580"), Decoded::Ignored);
        assert_eq!(codec.decode("X:"), Decoded::Ignored);
        assert_eq!(codec.decode("B4019158é"), Decoded::Ignored);
    }

    #[test]
    fn test_carriage_return_is_stripped() {
        let frame = status("B40191580\r");
        assert_eq!(value_of(&frame, 25), DataPointValue::Fixed(21.5));
    }

    #[test]
    fn test_command_result() {
        assert_eq!(
            FrameCodec::new().decode("TT: 20.50"),
            Decoded::CommandResult {
                code: "TT".to_string(),
                result: "20.50".to_string(),
            }
        );
    }

    #[test]
    fn test_status_summary_follow_up() {
        let codec = FrameCodec::new();
        assert_eq!(
            codec.decode("PS: 1"),
            Decoded::FollowUp(Command::new("PS", "0"))
        );
        assert_eq!(codec.decode("PS: 0"), Decoded::Ignored);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let codec = FrameCodec::new();
        let first = codec.decode("B40000480");
        codec.decode("B40191580");
        assert_eq!(codec.decode("B40000480"), first);
    }
}
