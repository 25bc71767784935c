//! In-process endpoints over `tokio::io::duplex`, for embedding the relay in
//! another program and for tests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use interpose_proto::CodecSpec;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::template::{
    Accepted, EndpointTemplate, Incoming, Listener, ListenerTemplate, TemplateOverrides,
    no_destination,
};
use crate::transport::{StreamTransport, Transport};

const DEFAULT_BUFFER: usize = 64 * 1024;

/// One end of an in-memory pipe, handed out on the first `open`.
#[derive(Debug, Clone)]
pub struct MemoryTemplate {
    name: String,
    slot: Arc<Mutex<Option<DuplexStream>>>,
    pub capabilities: Capabilities,
    pub codec: CodecSpec,
}

impl MemoryTemplate {
    /// A template and the stream attached to its far side.
    pub fn pair(name: impl Into<String>) -> (Self, DuplexStream) {
        let (near, far) = tokio::io::duplex(DEFAULT_BUFFER);
        let template = Self {
            name: name.into(),
            slot: Arc::new(Mutex::new(Some(near))),
            capabilities: Capabilities::DUPLEX,
            codec: CodecSpec::Passthrough,
        };
        (template, far)
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl EndpointTemplate for MemoryTemplate {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn describe(&self) -> String {
        format!("memory {}", self.name)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let stream = self.slot.lock().take().ok_or_else(|| {
            EndpointError::Config(format!("memory endpoint '{}' already opened", self.name))
        })?;
        Ok(Box::new(StreamTransport::new(stream)))
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        no_destination(self.kind(), overrides)?;
        Ok(Arc::new(self.clone()))
    }
}

// ── Listener ──

/// Dials a [`MemoryListenTemplate`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl MemoryConnector {
    /// Open a connection; the listener accepts the other end.
    pub fn connect(&self) -> Result<DuplexStream, EndpointError> {
        let (near, far) = tokio::io::duplex(DEFAULT_BUFFER);
        self.tx.send(far).map_err(|_| EndpointError::StreamClosed)?;
        Ok(near)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryListenTemplate {
    name: String,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>>,
    pub codec: CodecSpec,
}

impl MemoryListenTemplate {
    pub fn new(name: impl Into<String>) -> (Self, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let template = Self {
            name: name.into(),
            rx: Arc::new(Mutex::new(Some(rx))),
            codec: CodecSpec::Passthrough,
        };
        (template, MemoryConnector { tx })
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }
}

#[async_trait]
impl ListenerTemplate for MemoryListenTemplate {
    fn kind(&self) -> &'static str {
        "memory-listen"
    }

    fn describe(&self) -> String {
        format!("memory-listen {}", self.name)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError> {
        let rx = self.rx.lock().take().ok_or_else(|| {
            EndpointError::Config(format!("memory listener '{}' already bound", self.name))
        })?;
        Ok(Box::new(MemoryListener {
            rx,
            name: self.name.clone(),
            codec: self.codec,
            accepted: 0,
        }))
    }
}

pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    name: String,
    codec: CodecSpec,
    accepted: u64,
}

#[async_trait]
impl Listener for MemoryListener {
    /// Fails with `StreamClosed` once every connector is dropped.
    async fn accept(&mut self) -> Result<Incoming, EndpointError> {
        let stream = self.rx.recv().await.ok_or(EndpointError::StreamClosed)?;
        self.accepted += 1;
        let endpoint = Endpoint::from_transport(
            format!("memory {}#{}", self.name, self.accepted),
            Capabilities::DUPLEX,
            self.codec,
            Box::new(StreamTransport::new(stream)),
        );
        Ok(Incoming::ready(
            None,
            Accepted {
                endpoint,
                destination: None,
            },
        ))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_template_opens_once() {
        let (template, mut far) = MemoryTemplate::pair("a");
        let template = Arc::new(template);
        let ep = Endpoint::from_template(template.clone());
        ep.init().await.unwrap();
        far.write_all(b"hello").await.unwrap();
        assert_eq!(ep.read_frames().await.unwrap(), vec![Bytes::from_static(b"hello")]);

        let again = Endpoint::from_template(template);
        assert!(matches!(again.init().await, Err(EndpointError::Config(_))));
    }

    #[tokio::test]
    async fn test_memory_listener_accepts_connections() {
        let (template, connector) = MemoryListenTemplate::new("l");
        let mut listener = template.bind().await.unwrap();
        let mut client = connector.connect().unwrap();

        let accepted = listener.accept().await.unwrap().handshake.await.unwrap();
        assert_eq!(accepted.endpoint.name(), "memory l#1");
        accepted.endpoint.write_frame(Bytes::from_static(b"hi")).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(connector);
        assert!(listener.accept().await.unwrap_err().is_stream_closed());
    }
}
