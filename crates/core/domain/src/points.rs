//! OpenTherm 数据点定义表。
//!
//! 所有已知数据点按声明顺序存放在 [`DATA_POINTS`] 中，该顺序同时也是
//! 变更事件的发布顺序。

use std::fmt;

/// 数据点 ID（OpenTherm MsgID，派生点位使用 1001 起的私有区间）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataPointId(pub u16);

impl fmt::Display for DataPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 线路载荷编码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// 两个 8 位标志字节，渲染为 `xxxxxxxx/xxxxxxxx`
    Flag8,
    /// 有符号 8.8 定点数（除以 256）
    Fixed8_8,
    /// 无符号 16 位整数
    Uint16,
}

/// 数据点取值来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointSource {
    /// 直接从线路载荷解码
    Wire(Encoding),
    /// 从 flame_status 标志串的固定字符偏移派生
    FlameBit(usize),
}

/// 单个数据点定义。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPointDef {
    pub id: DataPointId,
    pub name: &'static str,
    pub source: PointSource,
}

impl DataPointDef {
    const fn wire(id: u16, name: &'static str, encoding: Encoding) -> Self {
        Self {
            id: DataPointId(id),
            name,
            source: PointSource::Wire(encoding),
        }
    }

    const fn flame_bit(id: u16, name: &'static str, offset: usize) -> Self {
        Self {
            id: DataPointId(id),
            name,
            source: PointSource::FlameBit(offset),
        }
    }

    /// 线路编码；派生点位返回 `None`。
    pub fn encoding(&self) -> Option<Encoding> {
        match self.source {
            PointSource::Wire(encoding) => Some(encoding),
            PointSource::FlameBit(_) => None,
        }
    }
}

use Encoding::{Fixed8_8, Flag8, Uint16};

/// 已知数据点表（声明顺序即发布顺序）。
///
/// 派生点位的字符偏移针对 17 字符的 `HHHHHHHH/LLLLLLLL` 标志串，
/// 必须与网关固件保持一致，不可重新推导。
pub static DATA_POINTS: [DataPointDef; 28] = [
    DataPointDef::wire(0, "flame_status", Flag8),
    DataPointDef::wire(1, "control_setpoint", Fixed8_8),
    DataPointDef::wire(9, "remote_override_setpoint", Fixed8_8),
    DataPointDef::wire(14, "max_relative_modulation_level", Fixed8_8),
    DataPointDef::wire(16, "room_setpoint", Fixed8_8),
    DataPointDef::wire(17, "relative_modulation_level", Fixed8_8),
    DataPointDef::wire(18, "ch_water_pressure", Fixed8_8),
    DataPointDef::wire(24, "room_temperature", Fixed8_8),
    DataPointDef::wire(25, "boiler_water_temperature", Fixed8_8),
    DataPointDef::wire(26, "dhw_temperature", Fixed8_8),
    DataPointDef::wire(27, "outside_temperature", Fixed8_8),
    DataPointDef::wire(28, "return_water_temperature", Fixed8_8),
    DataPointDef::wire(56, "dhw_setpoint", Fixed8_8),
    DataPointDef::wire(57, "max_ch_water_setpoint", Fixed8_8),
    DataPointDef::wire(116, "burner_starts", Uint16),
    DataPointDef::wire(117, "ch_pump_starts", Uint16),
    DataPointDef::wire(118, "dhw_pump_starts", Uint16),
    DataPointDef::wire(119, "dhw_burner_starts", Uint16),
    DataPointDef::wire(120, "burner_operation_hours", Uint16),
    DataPointDef::wire(121, "ch_pump_operation_hours", Uint16),
    DataPointDef::wire(122, "dhw_pump_valve_operation_hours", Uint16),
    DataPointDef::wire(123, "dhw_burner_operation_hours", Uint16),
    // 低字节（slave status）
    DataPointDef::flame_bit(1001, "cooling_mode", 12),
    DataPointDef::flame_bit(1002, "burner_on", 13),
    DataPointDef::flame_bit(1003, "central_heating_mode", 15),
    DataPointDef::flame_bit(1004, "domestic_hot_water_mode", 14),
    // 高字节（master status）
    DataPointDef::flame_bit(1005, "domestic_hot_water_enabled", 6),
    DataPointDef::flame_bit(1006, "fault_indication", 16),
];

/// 按 ID 查找数据点定义。
pub fn lookup(id: DataPointId) -> Option<&'static DataPointDef> {
    DATA_POINTS.iter().find(|def| def.id == id)
}

/// 由 flame_status 派生的点位（声明顺序）。
pub fn flame_bits() -> impl Iterator<Item = (&'static DataPointDef, usize)> {
    DATA_POINTS.iter().filter_map(|def| match def.source {
        PointSource::FlameBit(offset) => Some((def, offset)),
        PointSource::Wire(_) => None,
    })
}
