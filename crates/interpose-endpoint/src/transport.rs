//! Byte transports underneath endpoints.
//!
//! A [`Transport`] is the OS resource an endpoint owns: a socket, a TLS
//! session, a pipe. It moves raw chunks; framing happens one layer up in the
//! endpoint's codec. Reads and writes go through separate locks so the two
//! pump directions never wait on each other.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use interpose_core::{DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_READ_BUFFER_SIZE};

/// A duplex byte channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next chunk of bytes, or `None` at end of stream.
    ///
    /// An empty chunk is data (a zero-length datagram), not end of stream.
    async fn recv(&self) -> io::Result<Option<Bytes>>;

    /// Write the whole chunk.
    async fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Release the resource. Must not wait on an in-flight `recv` or `send`.
    async fn shutdown(&self) -> io::Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn recv(&self) -> io::Result<Option<Bytes>> {
        (**self).recv().await
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        (**self).send(data).await
    }

    async fn shutdown(&self) -> io::Result<()> {
        (**self).shutdown().await
    }
}

// ── Streams ──

/// Transport over any async read half and write half.
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    read_size: usize,
}

impl<S> StreamTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }
}

impl<R, W> StreamTransport<R, W> {
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&self) -> io::Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.read_size);
        match reader.read_buf(&mut buf).await? {
            0 => Ok(None),
            _ => Ok(Some(buf.freeze())),
        }
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    async fn shutdown(&self) -> io::Result<()> {
        // A writer blocked on back-pressure keeps the lock; dropping the
        // transport releases the resource in that case.
        match self.writer.try_lock() {
            Ok(mut writer) => writer.shutdown().await,
            Err(_) => Ok(()),
        }
    }
}

// ── Datagrams ──

/// Transport over a connected UDP socket. Each datagram is one chunk.
pub struct DatagramTransport {
    socket: UdpSocket,
}

impl DatagramTransport {
    /// `socket` must already be connected to its peer.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    async fn recv(&self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(DEFAULT_MAX_DATAGRAM_SIZE);
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).await.map(|_| ())
    }

    async fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_transport_moves_chunks() {
        let (a, mut b) = tokio::io::duplex(64);
        let transport = StreamTransport::new(a);
        transport.send(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b.write_all(b"world").await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), Some(Bytes::from_static(b"world")));
    }

    #[tokio::test]
    async fn test_stream_transport_eof_is_none() {
        let (a, b) = tokio::io::duplex(64);
        let transport = StreamTransport::new(a);
        drop(b);
        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_size_bounds_chunks() {
        let (a, mut b) = tokio::io::duplex(64);
        let transport = StreamTransport::new(a).with_read_size(3);
        b.write_all(b"abcdef").await.unwrap();
        assert_eq!(transport.recv().await.unwrap().map(|c| c.len()), Some(3));
    }

    #[tokio::test]
    async fn test_datagram_transport_preserves_boundaries() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        let (ta, tb) = (DatagramTransport::new(a), DatagramTransport::new(b));
        ta.send(b"one").await.unwrap();
        ta.send(b"two").await.unwrap();
        assert_eq!(tb.recv().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(tb.recv().await.unwrap(), Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_empty_datagram_is_not_eof() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        let (ta, tb) = (DatagramTransport::new(a), DatagramTransport::new(b));
        ta.send(b"").await.unwrap();
        assert_eq!(tb.recv().await.unwrap(), Some(Bytes::new()));
    }
}
