//! Trojan 风格协议头
//!
//! ```text
//! +-----------------+------+-----+------+---------+------+------+---------+
//! | identity (hex)  | CRLF | cmd | atyp | address | port | CRLF | payload |
//! +-----------------+------+-----+------+---------+------+------+---------+
//!        56            2      1     1      var       2      2
//! ```
//!
//! 身份块不做校验，按不透明字节跳过。

use crate::protocol::address::{decode_address, AddressScheme};
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::{read_port, Command, ParsedHeader, Protocol};
use bytes::Bytes;

const IDENTITY_LEN: usize = 56;

/// 身份块 + CRLF
const PREAMBLE_LEN: usize = IDENTITY_LEN + 2;

/// 前缀之后至少需要的字节数 (cmd + atyp + 最短地址 + port 的下限)
const MIN_REQUEST_LEN: usize = 6;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const RESPONSE: u8 = 0x01;

pub fn parse(buf: &[u8]) -> Result<ParsedHeader> {
    if buf.len() < PREAMBLE_LEN + MIN_REQUEST_LEN {
        return Err(ProtocolError::Truncated {
            expected: PREAMBLE_LEN + MIN_REQUEST_LEN,
            actual: buf.len(),
        });
    }

    if &buf[IDENTITY_LEN..PREAMBLE_LEN] != b"\r\n" {
        return Err(ProtocolError::HeaderParse(
            "missing CRLF after identity block".to_string(),
        ));
    }

    let command = match buf[PREAMBLE_LEN] {
        CMD_CONNECT => Command::Connect,
        CMD_UDP_ASSOCIATE => Command::UdpRelay,
        other => {
            return Err(ProtocolError::HeaderParse(format!(
                "Unsupported command type {}",
                other
            )))
        }
    };

    let atyp = buf[PREAMBLE_LEN + 1];
    let address_index = PREAMBLE_LEN + 2;
    let (address, consumed) = decode_address(buf, address_index, atyp, AddressScheme::Socks)?;

    let port_index = address_index + consumed;
    let port = read_port(buf, port_index)?;

    // 端口后的 CRLF 不属于负载
    let payload_offset = (port_index + 4).min(buf.len());

    Ok(ParsedHeader {
        protocol: Protocol::Trojan,
        command,
        address,
        port,
        response_prefix: Bytes::from_static(&[RESPONSE]),
        payload_offset,
        version: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Address, AddressDecodeError};

    fn request(cmd: u8, addr: &[u8], port: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![b'0'; IDENTITY_LEN];
        buf.extend_from_slice(b"\r\n");
        buf.push(cmd);
        buf.extend_from_slice(addr);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_parse_connect_ipv4() {
        let buf = request(CMD_CONNECT, &[0x01, 93, 184, 216, 34], 80, b"hello");
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.protocol, Protocol::Trojan);
        assert_eq!(parsed.command, Command::Connect);
        assert_eq!(parsed.address.to_string(), "93.184.216.34");
        assert_eq!(parsed.port, 80);
        assert_eq!(&parsed.response_prefix[..], &[0x01]);
        assert_eq!(parsed.payload(&buf), b"hello");
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn test_parse_udp_domain() {
        let mut addr = vec![0x03, 11];
        addr.extend_from_slice(b"example.com");
        let buf = request(CMD_UDP_ASSOCIATE, &addr, 53, &[]);
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.command, Command::UdpRelay);
        assert_eq!(parsed.address, Address::Domain("example.com".to_string()));
        assert_eq!(parsed.port, 53);
        assert_eq!(parsed.payload_offset, buf.len());
    }

    #[test]
    fn test_parse_ipv6_big_endian() {
        let mut addr = vec![0x04];
        addr.extend_from_slice(&[
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x01,
        ]);
        let buf = request(CMD_CONNECT, &addr, 443, b"x");
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.address.to_string(), "2001:db8:0:0:0:0:0:1");
        assert_eq!(parsed.payload(&buf), b"x");
    }

    #[test]
    fn test_every_port_recovered() {
        for port in [1u16, 53, 443, 8443, 65535] {
            let buf = request(CMD_CONNECT, &[0x01, 10, 0, 0, 1], port, &[]);
            assert_eq!(parse(&buf).unwrap().port, port);
        }
    }

    #[test]
    fn test_unsupported_command() {
        let buf = request(0x7f, &[0x01, 10, 0, 0, 1], 80, &[]);
        match parse(&buf) {
            Err(ProtocolError::HeaderParse(msg)) => assert!(msg.contains("Unsupported command")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_vless_address_code_rejected() {
        let buf = request(CMD_CONNECT, &[0x02, 10, 0, 0, 1], 80, &[]);
        assert_eq!(
            parse(&buf),
            Err(ProtocolError::AddressDecode(AddressDecodeError::UnknownType(0x02)))
        );
    }

    #[test]
    fn test_requires_six_bytes_after_preamble() {
        let buf = request(CMD_CONNECT, &[0x01, 10, 0, 0, 1], 80, &[]);
        assert!(matches!(
            parse(&buf[..PREAMBLE_LEN + 5]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_missing_crlf() {
        let mut buf = request(CMD_CONNECT, &[0x01, 10, 0, 0, 1], 80, &[]);
        buf[56] = b'x';
        assert!(matches!(parse(&buf), Err(ProtocolError::HeaderParse(_))));
    }

    #[test]
    fn test_port_truncated() {
        let mut addr = vec![0x03, 11];
        addr.extend_from_slice(b"example.com");
        let buf = request(CMD_CONNECT, &addr, 80, &[]);
        // 截掉端口和 CRLF
        let cut = &buf[..buf.len() - 3];
        assert!(matches!(parse(cut), Err(ProtocolError::Truncated { .. })));
    }
}
