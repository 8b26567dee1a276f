//! VLESS 风格协议头
//!
//! ```text
//! +---------+----------+---------+---------+-----+------+------+---------+----------+
//! | version | id (16)  | opt len | options | cmd | port | atyp | address | reserved |
//! +---------+----------+---------+---------+-----+------+------+---------+----------+
//!      1         16         1        n        1     2      1      var        2
//! ```
//!
//! 端口在地址之前；地址类型使用 VLESS 编码 (1 / 2 / 3)。

use crate::protocol::address::{decode_address, AddressScheme};
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::{read_port, read_u8, Command, ParsedHeader, Protocol};
use bytes::Bytes;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;

/// version + id + opt len
const FIXED_LEN: usize = 18;

/// 地址后的保留字段长度
const RESERVED_LEN: usize = 2;

pub fn parse(buf: &[u8]) -> Result<ParsedHeader> {
    if buf.len() < FIXED_LEN {
        return Err(ProtocolError::Truncated {
            expected: FIXED_LEN,
            actual: buf.len(),
        });
    }

    let version = buf[0];
    let opt_len = buf[17] as usize;
    let cmd_index = FIXED_LEN + opt_len;

    let command = match read_u8(buf, cmd_index)? {
        CMD_TCP => Command::Connect,
        CMD_UDP => Command::UdpRelay,
        other => {
            return Err(ProtocolError::HeaderParse(format!(
                "command {} is not supported, command 01-tcp,02-udp,03-mux",
                other
            )))
        }
    };

    let port_index = cmd_index + 1;
    let port = read_port(buf, port_index)?;

    let atyp_index = port_index + 2;
    let atyp = read_u8(buf, atyp_index)?;
    let (address, consumed) = decode_address(buf, atyp_index + 1, atyp, AddressScheme::Vless)?;

    // 保留字段可能不在第一个数据块里，偏移量不超过缓冲区末尾
    let payload_offset = (atyp_index + 1 + consumed + RESERVED_LEN).min(buf.len());

    Ok(ParsedHeader {
        protocol: Protocol::Vless,
        command,
        address,
        port,
        response_prefix: Bytes::copy_from_slice(&[version, 0x00]),
        payload_offset,
        version: Some(version),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Address, AddressDecodeError};
    use std::net::Ipv4Addr;

    const ID: [u8; 16] = [
        0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44, 0x00,
        0x00,
    ];

    fn header(options: &[u8], cmd: u8, port: u16, addr: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x00];
        buf.extend_from_slice(&ID);
        buf.push(options.len() as u8);
        buf.extend_from_slice(options);
        buf.push(cmd);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(addr);
        buf
    }

    #[test]
    fn test_parse_ipv4_connect() {
        let mut buf = header(&[], CMD_TCP, 443, &[0x01, 1, 1, 1, 1]);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(b"GET /");

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.protocol, Protocol::Vless);
        assert_eq!(parsed.command, Command::Connect);
        assert_eq!(parsed.address, Address::Ipv4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.version, Some(0));
        assert_eq!(&parsed.response_prefix[..], &[0x00, 0x00]);
        assert_eq!(parsed.payload(&buf), b"GET /");
    }

    #[test]
    fn test_parse_domain_udp_with_options() {
        let mut addr = vec![0x02, 7];
        addr.extend_from_slice(b"dns.com");
        let buf = header(&[0xaa, 0xbb, 0xcc], CMD_UDP, 53, &addr);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.command, Command::UdpRelay);
        assert_eq!(parsed.address.to_string(), "dns.com");
        assert_eq!(parsed.port, 53);
        // 没有负载时偏移量停在缓冲区末尾
        assert_eq!(parsed.payload_offset, buf.len());
    }

    #[test]
    fn test_parse_ipv6() {
        let mut addr = vec![0x03];
        addr.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
        let buf = header(&[], CMD_TCP, 8080, &addr);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.address.to_string(), "0:0:0:0:0:0:0:1");
        assert_eq!(parsed.port, 8080);
    }

    #[test]
    fn test_version_echoed_in_prefix() {
        let mut buf = header(&[], CMD_TCP, 80, &[0x01, 127, 0, 0, 1]);
        buf[0] = 0x07;
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.version, Some(7));
        assert_eq!(&parsed.response_prefix[..], &[0x07, 0x00]);
    }

    #[test]
    fn test_mux_command_rejected() {
        let buf = header(&[], 0x03, 80, &[0x01, 127, 0, 0, 1]);
        assert!(matches!(parse(&buf), Err(ProtocolError::HeaderParse(_))));
    }

    #[test]
    fn test_socks_domain_code_rejected() {
        // 0x04 在 VLESS 中不是合法地址类型
        let buf = header(&[], CMD_TCP, 80, &[0x04, 0, 0, 0, 0]);
        assert_eq!(
            parse(&buf),
            Err(ProtocolError::AddressDecode(AddressDecodeError::UnknownType(0x04)))
        );
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(parse(&[0x00; 10]), Err(ProtocolError::Truncated { .. })));

        let buf = header(&[], CMD_TCP, 80, &[0x01, 127, 0]);
        assert!(matches!(
            parse(&buf),
            Err(ProtocolError::AddressDecode(AddressDecodeError::Truncated { .. }))
        ));
    }
}
