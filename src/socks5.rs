//! RFC 1928 SOCKS5 subset: method negotiation with "no authentication"
//! only, and `CONNECT` with an IPv4 or DOMAIN target.
//!
//! Helper functions to build and parse the handful of one-off protocol
//! messages this subset needs, using `bytes`' `BufMut`/`Buf` rather
//! than hand-rolled index arithmetic.
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

use crate::error::Error;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
const REP_SUCCEEDED: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    V4(Ipv4Addr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: Addr,
    pub port: u16,
}

/// Parses the client's method-negotiation message
/// (`VER NMETHODS METHODS...`). Returns `Ok(())` only if "no
/// authentication" (`0x00`) is among the offered methods; any other
/// first byte or missing method aborts the connection.
pub fn parse_greeting(buf: &[u8]) -> Result<(), Error> {
    if buf.len() < 2 || buf[0] != VERSION {
        return Err(Error::Socks5("bad greeting version"));
    }
    let nmethods = buf[1] as usize;
    let methods = buf.get(2..2 + nmethods).ok_or(Error::Socks5("short greeting"))?;
    if methods.contains(&METHOD_NO_AUTH) {
        Ok(())
    } else {
        Err(Error::Socks5("no acceptable auth method"))
    }
}

/// `{0x05, 0x00}`: accept "no authentication".
pub fn method_reply() -> [u8; 2] {
    [VERSION, METHOD_NO_AUTH]
}

/// Returns the total byte length of a method-negotiation message once
/// enough of it has arrived to know that length (`VER NMETHODS` is
/// always 2 bytes, so this needs only those first 2). `None` means
/// "keep reading".
pub fn greeting_len_needed(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    Some(2 + buf[1] as usize)
}

/// Returns the total byte length of a `CONNECT` request once enough of
/// it has arrived to know that length: 4 bytes (`VER CMD RSV ATYP`)
/// plus the address (fixed for IPv4, length-prefixed for DOMAIN) plus
/// a 2-byte port. An unrecognized `ATYP` is reported as already
/// complete so the caller's parser can reject it immediately rather
/// than waiting for bytes that will never resolve the ambiguity.
pub fn request_len_needed(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    match buf[3] {
        ATYP_IPV4 => Some(4 + 4 + 2),
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return None;
            }
            let domain_len = buf[4] as usize;
            Some(4 + 1 + domain_len + 2)
        }
        _ => Some(buf.len()),
    }
}

/// Parses a `CONNECT` request. Returns the number of bytes consumed
/// and the parsed target, so callers that received the request as a
/// prefix of a longer buffer (the server side, unwrapping it from the
/// handshake block) know exactly where it ends.
pub fn parse_connect_request(buf: &[u8]) -> Result<(usize, Target), Error> {
    if buf.len() < 4 || buf[0] != VERSION {
        return Err(Error::Socks5("bad request version"));
    }
    if buf[1] != CMD_CONNECT {
        return Err(Error::Socks5("only CONNECT is supported"));
    }
    // buf[2] is RSV (0x00), ignored.
    let (consumed, target) = parse_target(&buf[3..])?;
    Ok((3 + consumed, target))
}

/// Parses `ATYP ADDR PORT` with no `VER`/`CMD`/`RSV` prefix — the shape
/// shared by the tail of a `CONNECT` request and the Fakio handshake's
/// encrypted target, which carries only a version byte ahead of this.
/// Returns the number of bytes consumed and the parsed target.
pub fn parse_target(buf: &[u8]) -> Result<(usize, Target), Error> {
    if buf.is_empty() {
        return Err(Error::Socks5("missing ATYP"));
    }
    let atyp = buf[0];
    let mut cursor = &buf[1..];

    let (addr, addr_len) = match atyp {
        ATYP_IPV4 => {
            if cursor.len() < 4 {
                return Err(Error::Socks5("short IPv4 address"));
            }
            let octets = [cursor[0], cursor[1], cursor[2], cursor[3]];
            (Addr::V4(Ipv4Addr::from(octets)), 4)
        }
        ATYP_DOMAIN => {
            if cursor.is_empty() {
                return Err(Error::Socks5("missing domain length"));
            }
            let dlen = cursor[0] as usize;
            cursor = &cursor[1..];
            if cursor.len() < dlen {
                return Err(Error::Socks5("short domain name"));
            }
            let name = std::str::from_utf8(&cursor[..dlen])
                .map_err(|_| Error::Socks5("domain name is not utf-8"))?
                .to_string();
            (Addr::Domain(name), 1 + dlen)
        }
        _ => return Err(Error::Socks5("unsupported ATYP")),
    };

    let rest = &buf[1 + addr_len..];
    if rest.len() < 2 {
        return Err(Error::Socks5("short port"));
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);

    Ok((1 + addr_len + 2, Target { addr, port }))
}

/// Encodes a `CONNECT` request body (`VER CMD RSV ATYP ADDR PORT`).
pub fn encode_connect_request(target: &Target) -> BytesMut {
    let mut out = BytesMut::with_capacity(22);
    out.put_u8(VERSION);
    out.put_u8(CMD_CONNECT);
    out.put_u8(0x00); // RSV
    out.extend_from_slice(&encode_target(target));
    out
}

/// Encodes just `ATYP ADDR PORT`, the shape that rides (after a
/// version byte, no `CMD`/`RSV`) inside the Fakio handshake block.
pub fn encode_target(target: &Target) -> BytesMut {
    let mut out = BytesMut::with_capacity(19);
    match &target.addr {
        Addr::V4(ip) => {
            out.put_u8(ATYP_IPV4);
            out.put_slice(&ip.octets());
        }
        Addr::Domain(name) => {
            out.put_u8(ATYP_DOMAIN);
            out.put_u8(name.len() as u8);
            out.put_slice(name.as_bytes());
        }
    }
    out.put_u16(target.port);
    out
}

/// Standard success reply: `{0x05,0x00,0x00,0x01, BND.ADDR, BND.PORT}`.
/// The local side always reports its own loopback bind, since the real
/// connection is established on the server side.
pub fn success_reply(bound_addr: Ipv4Addr, bound_port: u16) -> BytesMut {
    let mut out = BytesMut::with_capacity(10);
    out.put_u8(VERSION);
    out.put_u8(REP_SUCCEEDED);
    out.put_u8(0x00); // RSV
    out.put_u8(ATYP_IPV4);
    out.put_slice(&bound_addr.octets());
    out.put_u16(bound_port);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_accepts_no_auth() {
        assert!(parse_greeting(&[0x05, 0x01, 0x00]).is_ok());
    }

    #[test]
    fn greeting_rejects_other_methods_only() {
        assert!(parse_greeting(&[0x05, 0x01, 0x02]).is_err());
    }

    #[test]
    fn greeting_rejects_bad_version() {
        assert!(parse_greeting(&[0x04, 0x01, 0x00]).is_err());
    }

    #[test]
    fn greeting_len_needed_waits_for_methods() {
        assert_eq!(greeting_len_needed(&[0x05]), None);
        assert_eq!(greeting_len_needed(&[0x05, 0x02]), Some(4));
    }

    #[test]
    fn request_len_needed_ipv4_is_fixed() {
        assert_eq!(request_len_needed(&[0x05, 0x01, 0x00]), None);
        assert_eq!(request_len_needed(&[0x05, 0x01, 0x00, ATYP_IPV4]), Some(10));
    }

    #[test]
    fn request_len_needed_domain_waits_for_len_byte() {
        assert_eq!(request_len_needed(&[0x05, 0x01, 0x00, ATYP_DOMAIN]), None);
        let prefix = [0x05, 0x01, 0x00, ATYP_DOMAIN, 11];
        assert_eq!(request_len_needed(&prefix), Some(4 + 1 + 11 + 2));
    }

    #[test]
    fn connect_request_ipv4_round_trips() {
        let target = Target {
            addr: Addr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 80,
        };
        let encoded = encode_connect_request(&target);
        let (consumed, parsed) = parse_connect_request(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed, target);
    }

    #[test]
    fn connect_request_domain_round_trips() {
        let target = Target {
            addr: Addr::Domain("example.com".to_string()),
            port: 443,
        };
        let encoded = encode_connect_request(&target);
        let (consumed, parsed) = parse_connect_request(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed, target);
    }

    #[test]
    fn connect_request_literal_bytes_from_spec_example() {
        // CONNECT 127.0.0.1:80: `05 01 00 01 7F 00 00 01 00 50`
        // (VER CMD RSV ATYP ADDR PORT).
        let raw = [0x05u8, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let (consumed, parsed) = parse_connect_request(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(parsed.addr, Addr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(parsed.port, 80);
    }

    #[test]
    fn parse_target_literal_bytes_from_spec_example() {
        // E1's handshake tail shape: `05 01 7F 00 00 01 00 50` is
        // `VER ATYP ADDR PORT`, no CMD/RSV. `parse_target` only sees
        // the part after VER.
        let raw = [0x05u8, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let (consumed, parsed) = parse_target(&raw[1..]).unwrap();
        assert_eq!(consumed, raw.len() - 1);
        assert_eq!(parsed.addr, Addr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(parsed.port, 80);
    }

    #[test]
    fn rejects_non_connect_command() {
        let raw = [0x05u8, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        assert!(parse_connect_request(&raw).is_err());
    }
}
