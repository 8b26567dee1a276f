//! 协议嗅探
//!
//! 连接上没有任何协商信息，只能根据第一个数据块的结构特征判断协议。
//! 判断顺序固定：Trojan 的 56 字节前缀最具体，必须最先检查；
//! Shadowsocks 没有任何特征，只能作为兜底。

use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::Protocol;

/// Trojan 特征所需的最小长度
pub const TROJAN_MIN_LEN: usize = 62;

/// VLESS 特征 (版本字节 + 16 字节 UUID) 所需的最小长度
pub const VLESS_MIN_LEN: usize = 17;

/// 判断第一个数据块属于哪种协议
///
/// 空数据块无法判断，返回 [`ProtocolError::Unrecognized`]。
pub fn sniff(buf: &[u8]) -> Result<Protocol> {
    if buf.is_empty() {
        return Err(ProtocolError::Unrecognized);
    }

    if is_trojan(buf) {
        return Ok(Protocol::Trojan);
    }

    if is_vless(buf) {
        return Ok(Protocol::Vless);
    }

    Ok(Protocol::Shadowsocks)
}

/// `[56..58)` 为 CRLF，`[58]` 为命令字，`[59]` 为 SOCKS5 地址类型
fn is_trojan(buf: &[u8]) -> bool {
    buf.len() >= TROJAN_MIN_LEN
        && buf[56] == b'\r'
        && buf[57] == b'\n'
        && matches!(buf[58], 0x01 | 0x03 | 0x7f)
        && matches!(buf[59], 0x01 | 0x03 | 0x04)
}

/// `[1..17)` 形如 version-4 UUID：
///
/// ```text
/// xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx
/// ```
///
/// 即 UUID 第 7 字节高半字节为 4，第 9 字节最高两位为 `10`。
fn is_vless(buf: &[u8]) -> bool {
    if buf.len() < VLESS_MIN_LEN {
        return false;
    }
    let uuid = &buf[1..17];
    uuid[6] >> 4 == 0x4 && uuid[8] >> 6 == 0b10
}
