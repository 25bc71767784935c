//! SOCKS4 and SOCKS5 client handshake messages.
//!
//! Only the client side of CONNECT is covered: build the request bytes and
//! validate the server's answers. SOCKS5 supports the no-auth and
//! username/password (RFC 1929) methods.

use std::net::{IpAddr, Ipv4Addr};

use bytes::{BufMut, Bytes, BytesMut};
use interpose_core::Destination;

use crate::ParseResult;
use crate::error::ParseError;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;
pub const SOCKS4_GRANTED: u8 = 0x5a;
pub const SOCKS4_REPLY_LEN: usize = 8;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;
pub const USER_PASS_VERSION: u8 = 0x01;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;

// ── SOCKS4 ──

/// `04 01 <port:2> <ipv4:4> <user-id> 00`
pub fn socks4_connect(ip: Ipv4Addr, port: u16, user_id: &str) -> Result<Bytes, ParseError> {
    if user_id.contains('\0') {
        return Err(ParseError::EmbeddedNul);
    }
    let mut buf = BytesMut::with_capacity(9 + user_id.len());
    buf.put_u8(SOCKS4_VERSION);
    buf.put_u8(SOCKS4_CMD_CONNECT);
    buf.put_u16(port);
    buf.put_slice(&ip.octets());
    buf.put_slice(user_id.as_bytes());
    buf.put_u8(0);
    Ok(buf.freeze())
}

/// Check an 8-byte SOCKS4 reply; byte 1 must be `0x5a`.
pub fn parse_socks4_reply(buf: &[u8]) -> ParseResult<()> {
    if buf.len() < SOCKS4_REPLY_LEN {
        return ParseResult::Incomplete(SOCKS4_REPLY_LEN);
    }
    if buf[1] != SOCKS4_GRANTED {
        return ParseResult::Invalid(ParseError::Socks4Rejected(buf[1]));
    }
    ParseResult::Complete(())
}

// ── SOCKS5 ──

/// Method selection offering exactly one method.
pub fn socks5_greeting(with_auth: bool) -> [u8; 3] {
    let method = if with_auth {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    [SOCKS5_VERSION, 1, method]
}

/// Parse the server's method choice.
pub fn parse_socks5_method(buf: &[u8], offered: u8) -> ParseResult<u8> {
    if buf.len() < 2 {
        return ParseResult::Incomplete(2);
    }
    if buf[0] != SOCKS5_VERSION {
        return ParseResult::Invalid(ParseError::BadVersion(buf[0]));
    }
    match buf[1] {
        METHOD_NO_ACCEPTABLE => ParseResult::Invalid(ParseError::NoAcceptableMethod),
        m if m == offered => ParseResult::Complete(m),
        m => ParseResult::Invalid(ParseError::UnexpectedMethod(m)),
    }
}

/// RFC 1929 username/password request.
pub fn socks5_user_pass(username: &str, password: &str) -> Result<Bytes, ParseError> {
    let (user, pass) = (username.as_bytes(), password.as_bytes());
    if user.len() > 255 || pass.len() > 255 {
        return Err(ParseError::FieldTooLong);
    }
    let mut buf = BytesMut::with_capacity(3 + user.len() + pass.len());
    buf.put_u8(USER_PASS_VERSION);
    buf.put_u8(user.len() as u8);
    buf.put_slice(user);
    buf.put_u8(pass.len() as u8);
    buf.put_slice(pass);
    Ok(buf.freeze())
}

/// Parse the `01 00` success answer to a username/password request.
pub fn parse_socks5_auth_reply(buf: &[u8]) -> ParseResult<()> {
    if buf.len() < 2 {
        return ParseResult::Incomplete(2);
    }
    if buf[0] != USER_PASS_VERSION {
        return ParseResult::Invalid(ParseError::BadVersion(buf[0]));
    }
    if buf[1] != 0 {
        return ParseResult::Invalid(ParseError::AuthRejected(buf[1]));
    }
    ParseResult::Complete(())
}

/// CONNECT request. IP literals use ATYP 1/4, anything else is sent as a domain.
pub fn socks5_connect(dest: &Destination) -> Result<Bytes, ParseError> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    match dest.ip() {
        Some(IpAddr::V4(ip)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Some(IpAddr::V6(ip)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        None => {
            let host = dest.host.as_bytes();
            if host.len() > 255 {
                return Err(ParseError::FieldTooLong);
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host);
        }
    }
    buf.put_u16(dest.port);
    Ok(buf.freeze())
}

/// Parse a CONNECT reply; on success returns the full reply length so the
/// caller knows how many bytes belong to the handshake.
pub fn parse_socks5_connect_reply(buf: &[u8]) -> ParseResult<usize> {
    if buf.len() < 4 {
        return ParseResult::Incomplete(4);
    }
    if buf[0] != SOCKS5_VERSION {
        return ParseResult::Invalid(ParseError::BadVersion(buf[0]));
    }
    if buf[1] != REPLY_SUCCEEDED {
        return ParseResult::Invalid(ParseError::ConnectRejected(buf[1]));
    }
    let total = match buf[3] {
        ATYP_IPV4 => 4 + 4 + 2,
        ATYP_IPV6 => 4 + 16 + 2,
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return ParseResult::Incomplete(5);
            }
            4 + 1 + buf[4] as usize + 2
        }
        other => return ParseResult::Invalid(ParseError::InvalidAtyp(other)),
    };
    if buf.len() < total {
        return ParseResult::Incomplete(total);
    }
    ParseResult::Complete(total)
}
