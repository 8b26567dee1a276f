//! 隧道协议头识别与解析
//!
//! 支持三种格式，均由第一个数据块的字节结构自动识别：
//! - VLESS 风格: 版本 + UUID + 选项 + 命令 + 端口 + 地址
//! - Trojan 风格: 56 字节身份块 + CRLF + SOCKS5 风格请求
//! - Shadowsocks 风格: 裸 SOCKS5 地址 + 端口

use bytes::Bytes;
use std::fmt;

pub mod address;
pub mod error;
pub mod shadowsocks;
pub mod sniff;
pub mod trojan;
pub mod vless;

pub use address::{decode_address, Address, AddressKind, AddressScheme};
pub use error::{AddressDecodeError, ProtocolError, Result};
pub use sniff::sniff;

/// 隧道协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vless,
    Trojan,
    Shadowsocks,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vless => f.write_str("vless"),
            Protocol::Trojan => f.write_str("trojan"),
            Protocol::Shadowsocks => f.write_str("shadowsocks"),
        }
    }
}

/// 请求命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP 连接
    Connect,
    /// UDP 转发
    UdpRelay,
}

/// 统一的协议头解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub protocol: Protocol,
    pub command: Command,
    pub address: Address,
    pub port: u16,
    /// 回给客户端的第一个数据块前需要加上的字节，可能为空
    pub response_prefix: Bytes,
    /// 负载在原始缓冲区中的起始位置
    pub payload_offset: usize,
    /// VLESS 版本字节
    pub version: Option<u8>,
}

impl ParsedHeader {
    /// 头部之后紧跟的负载
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.payload_offset..).unwrap_or(&[])
    }
}

/// 按指定协议解析协议头
pub fn parse(protocol: Protocol, buf: &[u8]) -> Result<ParsedHeader> {
    match protocol {
        Protocol::Vless => vless::parse(buf),
        Protocol::Trojan => trojan::parse(buf),
        Protocol::Shadowsocks => shadowsocks::parse(buf),
    }
}

/// 嗅探协议并解析协议头
pub fn decode(buf: &[u8]) -> Result<ParsedHeader> {
    let protocol = sniff(buf)?;
    parse(protocol, buf)
}

/// 读取大端 u16 端口
fn read_port(buf: &[u8], at: usize) -> Result<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(ProtocolError::Truncated {
            expected: at + 2,
            actual: buf.len(),
        })
}

/// 读取单个字节
fn read_u8(buf: &[u8], at: usize) -> Result<u8> {
    buf.get(at).copied().ok_or(ProtocolError::Truncated {
        expected: at + 1,
        actual: buf.len(),
    })
}
