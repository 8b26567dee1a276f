//! Shadowsocks 风格协议头
//!
//! ```text
//! +------+---------+------+---------+
//! | atyp | address | port | payload |
//! +------+---------+------+---------+
//!    1      var       2
//! ```
//!
//! 线上没有命令字段，目标端口为 53 时按 UDP (DNS) 转发。

use crate::protocol::address::{decode_address, AddressScheme};
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::{read_port, Command, ParsedHeader, Protocol};
use bytes::{BufMut, BytesMut};

const DNS_PORT: u16 = 53;

pub fn parse(buf: &[u8]) -> Result<ParsedHeader> {
    let atyp = *buf.first().ok_or(ProtocolError::Truncated {
        expected: 1,
        actual: 0,
    })?;

    let (address, consumed) = decode_address(buf, 1, atyp, AddressScheme::Socks)?;
    let port_index = 1 + consumed;
    let port = read_port(buf, port_index)?;
    let payload_offset = port_index + 2;

    let command = if port == DNS_PORT {
        Command::UdpRelay
    } else {
        Command::Connect
    };

    // [0, 0, 0, atyp] + 原始的地址与端口字节
    let mut prefix = BytesMut::with_capacity(3 + payload_offset);
    prefix.put_slice(&[0x00, 0x00, 0x00, atyp]);
    prefix.put_slice(&buf[1..payload_offset]);

    Ok(ParsedHeader {
        protocol: Protocol::Shadowsocks,
        command,
        address,
        port,
        response_prefix: prefix.freeze(),
        payload_offset,
        version: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Address, AddressDecodeError};
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_ipv4_connect() {
        let buf = [0x01, 8, 8, 4, 4, 0x01, 0xbb, b'd', b'a', b't', b'a'];
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.protocol, Protocol::Shadowsocks);
        assert_eq!(parsed.command, Command::Connect);
        assert_eq!(parsed.address, Address::Ipv4(Ipv4Addr::new(8, 8, 4, 4)));
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.payload_offset, 7);
        assert_eq!(parsed.payload(&buf), b"data");
        assert_eq!(
            &parsed.response_prefix[..],
            &[0x00, 0x00, 0x00, 0x01, 8, 8, 4, 4, 0x01, 0xbb]
        );
    }

    #[test]
    fn test_port_53_is_udp() {
        let buf = [0x01, 1, 1, 1, 1, 0x00, 0x35, 0xab, 0xcd];
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.command, Command::UdpRelay);
        assert_eq!(parsed.payload(&buf), &[0xab, 0xcd]);
    }

    #[test]
    fn test_other_ports_are_tcp() {
        for port in [52u16, 54, 80, 5353] {
            let mut buf = vec![0x01, 1, 1, 1, 1];
            buf.extend_from_slice(&port.to_be_bytes());
            assert_eq!(parse(&buf).unwrap().command, Command::Connect);
        }
    }

    #[test]
    fn test_parse_domain() {
        let mut buf = vec![0x03, 9];
        buf.extend_from_slice(b"localhost");
        buf.extend_from_slice(&8080u16.to_be_bytes());
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.address.to_string(), "localhost");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.payload_offset, buf.len());
        assert_eq!(&parsed.response_prefix[4..], &buf[1..]);
    }

    #[test]
    fn test_parse_ipv6() {
        let mut buf = vec![0x04];
        buf.extend_from_slice(&"fd00::53".parse::<std::net::Ipv6Addr>().unwrap().octets());
        buf.extend_from_slice(&53u16.to_be_bytes());
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.address.to_string(), "fd00:0:0:0:0:0:0:53");
        assert_eq!(parsed.command, Command::UdpRelay);
    }

    #[test]
    fn test_invalid_address_type() {
        assert_eq!(
            parse(&[0x05, 1, 2, 3, 4, 0, 80]),
            Err(ProtocolError::AddressDecode(AddressDecodeError::UnknownType(0x05)))
        );
    }

    #[test]
    fn test_empty_domain() {
        assert_eq!(
            parse(&[0x03, 0x00, 0x00, 0x50]),
            Err(ProtocolError::AddressDecode(AddressDecodeError::Empty(0x03)))
        );
    }

    #[test]
    fn test_missing_port() {
        assert!(matches!(
            parse(&[0x01, 1, 2, 3, 4, 0]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(parse(&[]), Err(ProtocolError::Truncated { .. })));
    }
}
