//! 协议头解析错误类型
use thiserror::Error;

/// 地址解码失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressDecodeError {
    /// 当前协议不认识的地址类型编码
    #[error("invalid address type {0}")]
    UnknownType(u8),

    /// 解出的地址为空
    #[error("address is empty, address type is {0}")]
    Empty(u8),

    /// 域名不是合法 UTF-8
    #[error("domain is not valid utf-8")]
    InvalidDomain,

    /// 域名超过 255 字节，无法编码
    #[error("domain is too long: {0} bytes")]
    DomainTooLong(usize),

    /// 地址字段超出缓冲区
    #[error("address truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// 协议识别与协议头解析过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 地址解码失败
    #[error("address decode failed: {0}")]
    AddressDecode(#[from] AddressDecodeError),

    /// 协议头内容非法 (命令字、分隔符等)
    #[error("header parse failed: {0}")]
    HeaderParse(String),

    /// 数据太短，无法解析协议头
    #[error("header too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// 无法识别的协议
    #[error("unrecognized protocol")]
    Unrecognized,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
