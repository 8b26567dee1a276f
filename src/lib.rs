//! wsproxy-ng 库
//!
//! WebSocket 隧道服务器：自动识别 VLESS / Trojan / Shadowsocks 风格的协议头，
//! 把客户端数据转发到 TCP 或 UDP 目标

pub mod client;
pub mod config;
pub mod early_data;
pub mod fallback;
pub mod outbound;
pub mod protocol;
pub mod server;
pub mod session;

// 重新导出常用类型
pub use config::Config;
pub use protocol::{Protocol, ParsedHeader};
pub use session::{Session, SessionSettings};
