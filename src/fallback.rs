//! 重试用的 fallback 地址
//!
//! 进程内共享一份，由握手路径或配置在运行时替换；会话只在重试时读取。
//! 读写之间的竞争可以接受，只影响某次重试使用哪个地址。

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// host 与 port 之间允许的分隔符
const SEPARATORS: [char; 3] = [':', '=', '-'];

/// fallback 目标，端口缺省时沿用原始目标端口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTarget {
    pub host: String,
    pub port: Option<u16>,
}

impl FallbackTarget {
    /// 解析 `host:port` / `host=port` / `host-port` / `[v6]:port` / `host`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        // [v6]:port
        if let Some(rest) = value.strip_prefix('[') {
            let end = rest.find(']')?;
            let host = &rest[..end];
            if host.is_empty() {
                return None;
            }
            let tail = &rest[end + 1..];
            let port = match tail.chars().next() {
                None => None,
                Some(c) if SEPARATORS.contains(&c) => Some(tail[1..].parse().ok()?),
                Some(_) => return None,
            };
            return Some(Self {
                host: host.to_string(),
                port,
            });
        }

        // 不带方括号的 IPv6 视为只有 host
        if value.matches(':').count() > 1 {
            return Some(Self {
                host: value.to_string(),
                port: None,
            });
        }

        if let Some(idx) = value.rfind(SEPARATORS) {
            let (host, port) = (&value[..idx], &value[idx + 1..]);
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(port) = port.parse() {
                    return Some(Self {
                        host: host.to_string(),
                        port: Some(port),
                    });
                }
            }
        }

        Some(Self {
            host: value.to_string(),
            port: None,
        })
    }
}

impl fmt::Display for FallbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) if self.host.contains(':') => write!(f, "[{}]:{}", self.host, port),
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// 从握手路径 `/<host><sep><port>` 中提取 fallback 地址，必须带端口
pub fn parse_proxy_path(path: &str) -> Option<FallbackTarget> {
    let value = path.strip_prefix('/')?;
    if value.contains('/') {
        return None;
    }
    FallbackTarget::parse(value).filter(|target| target.port.is_some())
}

/// 可在运行时原子替换的 fallback 地址
#[derive(Clone)]
pub struct FallbackAddress {
    inner: Arc<ArcSwapOption<FallbackTarget>>,
}

impl FallbackAddress {
    pub fn new(initial: Option<FallbackTarget>) -> Self {
        if let Some(target) = &initial {
            info!("Default fallback address: {}", target);
        }
        Self {
            inner: Arc::new(ArcSwapOption::from_pointee(initial)),
        }
    }

    /// 替换当前的 fallback 地址
    pub fn store(&self, target: Option<FallbackTarget>) {
        debug!("Fallback address updated: {:?}", target);
        self.inner.store(target.map(Arc::new));
    }

    pub fn current(&self) -> Option<Arc<FallbackTarget>> {
        self.inner.load_full()
    }

    /// 计算重试目标：未配置时回退到原始目标
    pub fn resolve(&self, host: &str, port: u16) -> (String, u16) {
        match self.current() {
            Some(target) => (target.host.clone(), target.port.unwrap_or(port)),
            None => (host.to_string(), port),
        }
    }
}

impl Default for FallbackAddress {
    fn default() -> Self {
        Self::new(None)
    }
}
