//! 网桥运行配置加载。
//!
//! 加载顺序：内置默认值 → 可选的 `appsettings.json`（`Config` 节）→ `OTGW_*` 环境变量。

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// 默认配置文件
pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("config file {0}: {1}")]
    File(String, String),
}

/// 网桥运行配置。
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// 网关主机
    pub tcp_host: Option<String>,
    pub tcp_port: u16,
    /// 透传端口，未设置时与 `tcp_port` 相同
    pub listen_port: Option<u16>,
    pub listen_enabled: bool,
    /// MQTT Broker 主机
    pub mqtt_broker: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// topic 前缀，原样拼接在 `otgw/...` 之前
    pub mqtt_prefix: String,
    pub reconnect_delay_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tcp_host: None,
            tcp_port: 2323,
            listen_port: None,
            listen_enabled: true,
            mqtt_broker: None,
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_prefix: String::new(),
            reconnect_delay_seconds: 15,
        }
    }
}

/// `appsettings.json` 的 `Config` 节，字段均可省略。
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileConfig {
    tcp_host: Option<String>,
    tcp_port: Option<u16>,
    listen_port: Option<u16>,
    listen: Option<bool>,
    mqtt_broker: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_prefix: Option<String>,
    reconnect_delay_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingsFile {
    #[serde(default)]
    config: FileConfig,
}

impl BridgeConfig {
    /// 依次读取配置文件与环境变量。
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            env::var("OTGW_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let base = match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_json(&content)
                .map_err(|err| ConfigError::File(path.clone(), err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(ConfigError::File(path, err.to_string())),
        };
        base.with_env_overrides()
    }

    /// 仅从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// 从 JSON 配置文本读取（缺省字段取默认值）。
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: SettingsFile = serde_json::from_str(json)
            .map_err(|err| ConfigError::Invalid("Config".to_string(), err.to_string()))?;
        let file = settings.config;
        let defaults = Self::default();
        let config = Self {
            tcp_host: file.tcp_host.filter(|value| !value.is_empty()),
            tcp_port: file.tcp_port.unwrap_or(defaults.tcp_port),
            listen_port: file.listen_port,
            listen_enabled: file.listen.unwrap_or(defaults.listen_enabled),
            mqtt_broker: file.mqtt_broker.filter(|value| !value.is_empty()),
            mqtt_port: file.mqtt_port.unwrap_or(defaults.mqtt_port),
            mqtt_username: file.mqtt_username.filter(|value| !value.is_empty()),
            mqtt_password: file.mqtt_password.filter(|value| !value.is_empty()),
            mqtt_prefix: file.mqtt_prefix.unwrap_or(defaults.mqtt_prefix),
            reconnect_delay_seconds: file
                .reconnect_delay_seconds
                .unwrap_or(defaults.reconnect_delay_seconds),
        };
        config.validate("ReconnectDelaySeconds")?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(host) = read_optional("OTGW_TCP_HOST") {
            self.tcp_host = Some(host);
        }
        if let Some(port) = read_u16("OTGW_TCP_PORT")? {
            self.tcp_port = port;
        }
        if let Some(port) = read_u16("OTGW_LISTEN_PORT")? {
            self.listen_port = Some(port);
        }
        self.listen_enabled = read_bool_with_default("OTGW_LISTEN", self.listen_enabled);
        if let Some(broker) = read_optional("OTGW_MQTT_BROKER") {
            self.mqtt_broker = Some(broker);
        }
        if let Some(port) = read_u16("OTGW_MQTT_PORT")? {
            self.mqtt_port = port;
        }
        if let Some(username) = read_optional("OTGW_MQTT_USERNAME") {
            self.mqtt_username = Some(username);
        }
        if let Some(password) = read_optional("OTGW_MQTT_PASSWORD") {
            self.mqtt_password = Some(password);
        }
        if let Ok(prefix) = env::var("OTGW_MQTT_PREFIX") {
            self.mqtt_prefix = prefix;
        }
        if let Some(seconds) = read_u64("OTGW_RECONNECT_DELAY_SECONDS")? {
            self.reconnect_delay_seconds = seconds;
        }
        self.validate("OTGW_RECONNECT_DELAY_SECONDS")?;
        Ok(self)
    }

    /// 重连间隔为 0 会让连接失败变成忙等重试
    fn validate(&self, delay_key: &str) -> Result<(), ConfigError> {
        if self.reconnect_delay_seconds == 0 {
            return Err(ConfigError::Invalid(
                delay_key.to_string(),
                "reconnect delay must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// 透传监听端口
    pub fn listen_port(&self) -> u16 {
        self.listen_port.unwrap_or(self.tcp_port)
    }

    /// 网关重连间隔
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    /// 启动所需但缺失的配置项（缺失不视为加载错误，由调用方记录）。
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.tcp_host.is_none() {
            missing.push("OTGW_TCP_HOST");
        }
        if self.mqtt_broker.is_none() {
            missing.push("OTGW_MQTT_BROKER");
        }
        missing
    }
}

fn read_u16(key: &str) -> Result<Option<u16>, ConfigError> {
    match read_optional(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<u16>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match read_optional(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
