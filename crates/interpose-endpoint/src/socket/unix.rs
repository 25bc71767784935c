use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use interpose_proto::CodecSpec;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::template::{
    Accepted, EndpointTemplate, Incoming, Listener, ListenerTemplate, TemplateOverrides,
    no_destination,
};
use crate::transport::{StreamTransport, Transport};

/// A filesystem path or a Linux abstract-namespace name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixAddress {
    Path(PathBuf),
    Abstract(String),
}

impl UnixAddress {
    pub fn new(name: impl Into<String>, is_abstract: bool) -> Self {
        let name = name.into();
        if is_abstract {
            UnixAddress::Abstract(name)
        } else {
            UnixAddress::Path(PathBuf::from(name))
        }
    }
}

impl fmt::Display for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnixAddress::Path(p) => write!(f, "{}", p.display()),
            UnixAddress::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> std::io::Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &str) -> std::io::Result<std::os::unix::net::SocketAddr> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract unix sockets are only available on Linux",
    ))
}

async fn connect(addr: &UnixAddress) -> std::io::Result<UnixStream> {
    match addr {
        UnixAddress::Path(path) => UnixStream::connect(path).await,
        UnixAddress::Abstract(name) => {
            let std = std::os::unix::net::UnixStream::connect_addr(&abstract_addr(name)?)?;
            std.set_nonblocking(true)?;
            UnixStream::from_std(std)
        }
    }
}

fn listen(addr: &UnixAddress) -> std::io::Result<UnixListener> {
    match addr {
        UnixAddress::Path(path) => UnixListener::bind(path),
        UnixAddress::Abstract(name) => {
            let std = std::os::unix::net::UnixListener::bind_addr(&abstract_addr(name)?)?;
            std.set_nonblocking(true)?;
            UnixListener::from_std(std)
        }
    }
}

// ── Client ──

#[derive(Debug, Clone)]
pub struct UnixTemplate {
    pub address: UnixAddress,
    pub codec: CodecSpec,
}

#[async_trait]
impl EndpointTemplate for UnixTemplate {
    fn kind(&self) -> &'static str {
        "unix"
    }

    fn describe(&self) -> String {
        format!("unix {}", self.address)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let stream = connect(&self.address)
            .await
            .map_err(|e| EndpointError::resource("connect to", &self.address, e))?;
        debug!(address = %self.address, "unix connected");
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

#[derive(Debug, Clone)]
pub struct UnixListenTemplate {
    pub address: UnixAddress,
    pub codec: CodecSpec,
}

#[async_trait]
impl ListenerTemplate for UnixListenTemplate {
    fn kind(&self) -> &'static str {
        "unix-listen"
    }

    fn describe(&self) -> String {
        format!("unix-listen {}", self.address)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError> {
        let listener =
            listen(&self.address).map_err(|e| EndpointError::resource("bind", &self.address, e))?;
        info!(address = %self.address, "unix listening");
        Ok(Box::new(UnixListenerHandle {
            listener,
            address: self.address.clone(),
            codec: self.codec,
            accepted: 0,
        }))
    }
}

/// Bound unix listener. A filesystem socket is unlinked when dropped.
pub struct UnixListenerHandle {
    listener: UnixListener,
    address: UnixAddress,
    codec: CodecSpec,
    accepted: u64,
}

#[async_trait]
impl Listener for UnixListenerHandle {
    async fn accept(&mut self) -> Result<Incoming, EndpointError> {
        let (stream, _) = self.listener.accept().await?;
        self.accepted += 1;
        let endpoint = Endpoint::from_transport(
            format!("unix {}#{}", self.address, self.accepted),
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
}

impl Drop for UnixListenerHandle {
    fn drop(&mut self) {
        if let UnixAddress::Path(path) = &self.address
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove unix socket");
        }
    }
}
