//! 出站连接错误类型

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboundError {
    /// 建立连接失败
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// 建立连接超时
    #[error("connect to {0} timed out")]
    Timeout(String),

    /// 连接建立后的读写错误
    #[error("outbound I/O error: {0}")]
    Io(#[from] io::Error),

    /// 客户端 WebSocket 已关闭
    #[error("client closed")]
    ClientClosed,
}

pub type Result<T> = std::result::Result<T, OutboundError>;
