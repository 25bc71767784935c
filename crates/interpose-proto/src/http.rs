//! HTTP CONNECT request and response heads.

use bytes::Bytes;
use interpose_core::Destination;

use crate::ParseResult;
use crate::error::ParseError;

/// Reply sent to a client once its CONNECT has been accepted.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const HEAD_END: &[u8] = b"\r\n\r\n";
const DEFAULT_TUNNEL_PORT: u16 = 443;

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub destination: Destination,
    /// Bytes of the request head including the blank line.
    pub head_len: usize,
}

/// Offset just past the `\r\n\r\n` ending the head, if present.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len())
        .position(|w| w == HEAD_END)
        .map(|pos| pos + HEAD_END.len())
}

fn head_lines(buf: &[u8], max_head: usize) -> Result<Option<(usize, &str)>, ParseError> {
    match head_end(buf) {
        Some(end) => {
            let head = std::str::from_utf8(&buf[..end]).map_err(|_| ParseError::MalformedHttp)?;
            Ok(Some((end, head)))
        }
        None if buf.len() >= max_head => Err(ParseError::HeadTooLarge),
        None => Ok(None),
    }
}

/// Parse `CONNECT host:port HTTP/1.x` and skip its headers.
///
/// A target without a port tunnels to 443.
pub fn parse_connect_request(buf: &[u8], max_head: usize) -> ParseResult<ConnectRequest> {
    let (head_len, head) = match head_lines(buf, max_head) {
        Ok(Some(v)) => v,
        Ok(None) => return ParseResult::Incomplete(buf.len() + 1),
        Err(e) => return ParseResult::Invalid(e),
    };
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return ParseResult::Invalid(ParseError::MalformedHttp);
    };
    if !method.eq_ignore_ascii_case("CONNECT") {
        return ParseResult::Invalid(ParseError::NotConnect);
    }
    if !version.starts_with("HTTP/1.") {
        return ParseResult::Invalid(ParseError::MalformedHttp);
    }
    let destination = match Destination::parse(target) {
        Ok(dest) => dest,
        Err(_) if !target.is_empty() && !target.contains(':') => {
            Destination::new(target, DEFAULT_TUNNEL_PORT)
        }
        Err(_) => return ParseResult::Invalid(ParseError::MalformedHttp),
    };
    ParseResult::Complete(ConnectRequest {
        destination,
        head_len,
    })
}

/// CONNECT request head sent when tunneling through an HTTP proxy.
pub fn connect_request(dest: &Destination, user_agent: &str) -> Bytes {
    Bytes::from(format!(
        "CONNECT {dest} HTTP/1.1\r\n\
         User-Agent: {user_agent}\r\n\
         Proxy-Connection: keep-alive\r\n\
         Connection: keep-alive\r\n\
         Host: {dest}\r\n\r\n"
    ))
}

/// Parse the proxy's answer; any 2xx status opens the tunnel.
///
/// On success returns the head length.
pub fn parse_connect_response(buf: &[u8], max_head: usize) -> ParseResult<usize> {
    let (head_len, head) = match head_lines(buf, max_head) {
        Ok(Some(v)) => v,
        Ok(None) => return ParseResult::Incomplete(buf.len() + 1),
        Err(e) => return ParseResult::Invalid(e),
    };
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return ParseResult::Invalid(ParseError::MalformedHttp);
    }
    let Some(status) = parts.next().and_then(|s| s.parse::<u16>().ok()) else {
        return ParseResult::Invalid(ParseError::MalformedHttp);
    };
    if !(200..300).contains(&status) {
        return ParseResult::Invalid(ParseError::BadStatus(status));
    }
    ParseResult::Complete(head_len)
}
