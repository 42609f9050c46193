use crate::points::DataPointId;
use std::fmt;

/// 数据点的解码值。
#[derive(Debug, Clone, PartialEq)]
pub enum DataPointValue {
    /// flag8 标志串，如 `00000100/10000000`
    Flags(String),
    /// f8.8 定点数（已四舍五入到两位小数）
    Fixed(f64),
    /// u16 计数值
    Unsigned(u16),
    /// 派生的单个标志位
    Bit(bool),
}

impl fmt::Display for DataPointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flags(flags) => f.write_str(flags),
            Self::Fixed(value) => write!(f, "{}", value),
            Self::Unsigned(value) => write!(f, "{}", value),
            Self::Bit(bit) => f.write_str(if *bit { "1" } else { "0" }),
        }
    }
}

/// 单帧解码得到的一个数据点更新。
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointUpdate {
    pub id: DataPointId,
    pub value: DataPointValue,
}

/// 数据点变更事件（值与上次发布不同）。
#[derive(Debug, Clone, PartialEq)]
pub struct DataChanged {
    pub id: DataPointId,
    pub name: &'static str,
    pub value: DataPointValue,
}
