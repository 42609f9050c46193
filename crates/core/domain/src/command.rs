use std::fmt;

/// 发往网关的命令（`CODE=value`）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub code: String,
    pub value: String,
}

impl Command {
    pub fn new(code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: value.into(),
        }
    }

    /// 线路格式（不含行结束符）。
    pub fn to_wire(&self) -> String {
        format!("{}={}", self.code, self.value)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.code, self.value)
    }
}
