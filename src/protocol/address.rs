//! 目标地址编解码
//!
//! 三种协议共用 IPv4 / 域名 / IPv6 三类地址，但类型编码各不相同：
//!
//! ```text
//! 类型        SOCKS5 风格 (Trojan, Shadowsocks)   VLESS
//! IPv4        0x01                                0x01
//! 域名        0x03                                0x02
//! IPv6        0x04                                0x03
//! ```

use crate::protocol::error::AddressDecodeError;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// 地址类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

/// 地址类型编码方案
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScheme {
    /// SOCKS5 风格编码 (1 / 3 / 4)
    Socks,
    /// VLESS 风格编码 (1 / 2 / 3)
    Vless,
}

impl AddressScheme {
    /// 把类型编码映射为地址类别
    pub fn kind(self, code: u8) -> Result<AddressKind, AddressDecodeError> {
        match (self, code) {
            (_, 0x01) => Ok(AddressKind::Ipv4),
            (AddressScheme::Socks, 0x03) | (AddressScheme::Vless, 0x02) => Ok(AddressKind::Domain),
            (AddressScheme::Socks, 0x04) | (AddressScheme::Vless, 0x03) => Ok(AddressKind::Ipv6),
            _ => Err(AddressDecodeError::UnknownType(code)),
        }
    }

    /// 地址类别对应的类型编码
    pub fn code(self, kind: AddressKind) -> u8 {
        match (self, kind) {
            (_, AddressKind::Ipv4) => 0x01,
            (AddressScheme::Socks, AddressKind::Domain) => 0x03,
            (AddressScheme::Socks, AddressKind::Ipv6) => 0x04,
            (AddressScheme::Vless, AddressKind::Domain) => 0x02,
            (AddressScheme::Vless, AddressKind::Ipv6) => 0x03,
        }
    }
}

/// 解码后的目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Ipv4(_) => AddressKind::Ipv4,
            Address::Ipv6(_) => AddressKind::Ipv6,
            Address::Domain(_) => AddressKind::Domain,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    /// 按指定编码方案写出 `类型编码 + 地址`
    pub fn write_to(&self, scheme: AddressScheme, buf: &mut BytesMut) -> Result<(), AddressDecodeError> {
        let code = scheme.code(self.kind());
        match self {
            Address::Ipv4(ip) => {
                buf.put_u8(code);
                buf.put_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.put_u8(code);
                buf.put_slice(&ip.octets());
            }
            Address::Domain(name) => {
                if name.is_empty() {
                    return Err(AddressDecodeError::Empty(code));
                }
                let len = u8::try_from(name.len())
                    .map_err(|_| AddressDecodeError::DomainTooLong(name.len()))?;
                buf.put_u8(code);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
            }
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            // 八组不压缩的小写十六进制，不补零
            Address::Ipv6(ip) => {
                for (i, group) in ip.segments().iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{:x}", group)?;
                }
                Ok(())
            }
            Address::Domain(name) => f.write_str(name),
        }
    }
}

/// 从 `buf[offset..]` 解码一个地址
///
/// # 参数
/// - `code`: 协议头中的地址类型编码
/// - `scheme`: 当前协议使用的编码方案
///
/// # 返回
/// - (地址, 消耗的字节数)，域名的长度字节计入消耗
pub fn decode_address(
    buf: &[u8],
    offset: usize,
    code: u8,
    scheme: AddressScheme,
) -> Result<(Address, usize), AddressDecodeError> {
    match scheme.kind(code)? {
        AddressKind::Ipv4 => {
            let octets: [u8; 4] = take(buf, offset)?;
            Ok((Address::Ipv4(Ipv4Addr::from(octets)), 4))
        }
        AddressKind::Ipv6 => {
            let octets: [u8; 16] = take(buf, offset)?;
            Ok((Address::Ipv6(Ipv6Addr::from(octets)), 16))
        }
        AddressKind::Domain => {
            let [len]: [u8; 1] = take(buf, offset)?;
            let len = len as usize;
            if len == 0 {
                return Err(AddressDecodeError::Empty(code));
            }
            let start = offset + 1;
            let name = buf.get(start..start + len).ok_or(AddressDecodeError::Truncated {
                expected: start + len,
                actual: buf.len(),
            })?;
            let name = std::str::from_utf8(name).map_err(|_| AddressDecodeError::InvalidDomain)?;
            Ok((Address::Domain(name.to_string()), 1 + len))
        }
    }
}

/// 读取 `buf[at..at + N]`
fn take<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], AddressDecodeError> {
    buf.get(at..at + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(AddressDecodeError::Truncated {
            expected: at + N,
            actual: buf.len(),
        })
}
