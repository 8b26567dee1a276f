use crate::fallback::FallbackTarget;
use crate::session::SessionSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket 监听地址 (例如: "0.0.0.0:8787")
    pub listen_addr: SocketAddr,
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 日志格式: json, pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// 重试用的 fallback 地址: host:port / host=port / host-port / [v6]:port / host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// 建连超时(秒)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// UDP 请求端口为 0 时使用的端口
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            fallback: None,
            connect_timeout: default_connect_timeout(),
            dns_port: default_dns_port(),
        }
    }
}

impl OutboundConfig {
    /// 解析后的 fallback 地址，格式不合法时为 None
    pub fn fallback_target(&self) -> Option<FallbackTarget> {
        self.fallback.as_deref().and_then(FallbackTarget::parse)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            dns_port: self.dns_port,
        }
    }
}

// 默认值函数
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_dns_port() -> u16 {
    53
}

impl Config {
    /// 从文件加载配置
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }
}
