//! Stream handshakes driven over a raw connection before it becomes a
//! transport: SOCKS4/5 and HTTP CONNECT as a client, HTTP CONNECT as a server.
//!
//! Each function returns whatever the peer sent past the end of the
//! handshake; callers wrap the stream in a
//! [`ReplayStream`](interpose_core::io::ReplayStream) so those bytes are not
//! lost.

use std::net::{IpAddr, Ipv4Addr};

use bytes::{Bytes, BytesMut};
use interpose_core::Destination;
use interpose_proto::http::{self, ConnectRequest};
use interpose_proto::{ParseResult, socks};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::EndpointError;

/// Read into `buf` until `parse` stops asking for more.
///
/// Returns the parsed value; `buf` keeps every byte read so far.
pub async fn read_until<S, T, F>(
    stream: &mut S,
    buf: &mut BytesMut,
    what: &'static str,
    mut parse: F,
) -> Result<T, EndpointError>
where
    S: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> ParseResult<T>,
{
    loop {
        match parse(&buf[..]) {
            ParseResult::Complete(value) => return Ok(value),
            ParseResult::Invalid(e) => return Err(e.into()),
            ParseResult::Incomplete(needed) => {
                buf.reserve(needed.saturating_sub(buf.len()).max(64));
                if stream.read_buf(buf).await? == 0 {
                    return Err(EndpointError::Handshake(format!(
                        "{what}: connection closed mid-handshake"
                    )));
                }
            }
        }
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<(), EndpointError> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// SOCKS4 only carries IPv4 addresses, so hostnames are resolved locally.
async fn ipv4_of(dest: &Destination) -> Result<Ipv4Addr, EndpointError> {
    if let Some(ip) = dest.ipv4() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((dest.host.as_str(), dest.port))
        .await
        .map_err(|e| EndpointError::resource("resolve", dest, e))?;
    addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| EndpointError::Config(format!("socks4 needs an IPv4 address for {dest}")))
}

/// SOCKS4 CONNECT through an already-connected proxy stream.
pub async fn socks4_connect<S>(
    stream: &mut S,
    target: &Destination,
    user_id: &str,
) -> Result<Bytes, EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ip = ipv4_of(target).await?;
    let request = socks::socks4_connect(ip, target.port, user_id)?;
    send(stream, &request).await?;
    let mut buf = BytesMut::new();
    read_until(stream, &mut buf, "socks4", socks::parse_socks4_reply).await?;
    Ok(buf.split_off(socks::SOCKS4_REPLY_LEN).freeze())
}

/// SOCKS5 CONNECT, optionally authenticating with username/password.
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &Destination,
    credentials: Option<(&str, &str)>,
) -> Result<Bytes, EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = socks::socks5_greeting(credentials.is_some());
    send(stream, &greeting).await?;

    let mut buf = BytesMut::new();
    let offered = greeting[2];
    read_until(stream, &mut buf, "socks5", |b| socks::parse_socks5_method(b, offered)).await?;
    let _ = buf.split_to(2);

    if let Some((username, password)) = credentials {
        send(stream, &socks::socks5_user_pass(username, password)?).await?;
        read_until(stream, &mut buf, "socks5", socks::parse_socks5_auth_reply).await?;
        let _ = buf.split_to(2);
    }

    send(stream, &socks::socks5_connect(target)?).await?;
    let reply_len =
        read_until(stream, &mut buf, "socks5", socks::parse_socks5_connect_reply).await?;
    Ok(buf.split_off(reply_len).freeze())
}

/// HTTP CONNECT as a client of an HTTP proxy.
pub async fn http_connect<S>(
    stream: &mut S,
    target: &Destination,
    user_agent: &str,
    max_head: usize,
) -> Result<Bytes, EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(stream, &http::connect_request(target, user_agent)).await?;
    let mut buf = BytesMut::new();
    let head_len = read_until(stream, &mut buf, "http connect", |b| {
        http::parse_connect_response(b, max_head)
    })
    .await?;
    Ok(buf.split_off(head_len).freeze())
}

/// Serve one HTTP CONNECT: read the request and confirm the tunnel.
pub async fn accept_connect<S>(
    stream: &mut S,
    max_head: usize,
) -> Result<(Destination, Bytes), EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    let ConnectRequest {
        destination,
        head_len,
    } = read_until(stream, &mut buf, "http connect", |b| {
        http::parse_connect_request(b, max_head)
    })
    .await?;
    send(stream, http::CONNECT_ESTABLISHED).await?;
    Ok((destination, buf.split_off(head_len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_proto::ParseError;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_socks4_keeps_bytes_after_reply() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move {
            let mut req = [0u8; 9 + 4];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..8], b"\x04\x01\x23\x28\x0a\x00\x00\x05");
            assert_eq!(&req[8..], b"test\0");
            server.write_all(b"\x00\x5a\0\0\0\0\0\0early").await.unwrap();
            server
        });
        let leftover = socks4_connect(&mut client, &Destination::new("10.0.0.5", 9000), "test")
            .await
            .unwrap();
        assert_eq!(&leftover[..], b"early");
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4_rejects_nul_in_user_id() {
        let (mut client, _server) = duplex(256);
        let err = socks4_connect(&mut client, &Destination::new("10.0.0.5", 9000), "a\0b")
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Protocol(ParseError::EmbeddedNul)));
    }

    #[tokio::test]
    async fn test_socks5_with_credentials() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 2]);
            server.write_all(&[5, 2]).await.unwrap();

            let mut auth = [0u8; 3 + 4 + 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x06secret");
            server.write_all(&[1, 0]).await.unwrap();

            let mut connect = [0u8; 10];
            server.read_exact(&mut connect).await.unwrap();
            assert_eq!(connect, [5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90]);
            server.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            server
        });
        let leftover = socks5_connect(
            &mut client,
            &Destination::new("127.0.0.1", 8080),
            Some(("user", "secret")),
        )
        .await
        .unwrap();
        assert!(leftover.is_empty());
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_rejection_is_protocol_error() {
        let (mut client, mut server) = duplex(256);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0xff]).await.unwrap();
            server
        });
        let err = socks5_connect(&mut client, &Destination::new("127.0.0.1", 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Protocol(ParseError::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn test_accept_connect_replies_and_returns_tail() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n\x16\x03")
            .await
            .unwrap();
        let (dest, leftover) = accept_connect(&mut server, 8192).await.unwrap();
        assert_eq!(dest, Destination::new("example.com", 443));
        assert_eq!(&leftover[..], b"\x16\x03");

        let mut reply = vec![0u8; http::CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, http::CONNECT_ESTABLISHED);
    }

    #[tokio::test]
    async fn test_truncated_handshake() {
        let (mut client, server) = duplex(64);
        drop(server);
        let err = http_connect(&mut client, &Destination::new("h", 1), "ua", 8192).await;
        assert!(err.is_err());
    }
}
