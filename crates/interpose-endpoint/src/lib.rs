//! Endpoints for interpose.
//!
//! An endpoint is one side of a relay: a capability-typed source and sink of
//! frames over a single transport resource. This crate provides:
//!
//! - [`Endpoint`]: lifecycle, capability flags, codec, idempotent close
//! - [`EndpointTemplate`] / [`ListenerTemplate`]: immutable recipes that
//!   open fresh endpoints or bind listeners
//! - Concrete kinds: TCP, UDP, Unix, TLS, HTTPS interception, proxy
//!   tunnels (HTTP CONNECT, SOCKS4/5), stdio, files, child processes and
//!   in-memory pipes
//! - [`endpoints`]: the name → constructor registry used by configuration

pub mod endpoint;
pub mod error;
pub mod exec;
pub mod handshake;
pub mod intercept;
pub mod memory;
pub mod registry;
pub mod socket;
pub mod standard;
pub mod template;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use endpoint::{Capabilities, Endpoint, State};
pub use error::EndpointError;
pub use exec::ExecTemplate;
pub use intercept::InterceptListenTemplate;
pub use memory::{MemoryConnector, MemoryListenTemplate, MemoryTemplate};
pub use registry::{EndpointConstructor, build_endpoint, endpoints};
pub use socket::{
    TcpListenTemplate, TcpTemplate, UdpListenTemplate, UdpTemplate, UnixAddress,
    UnixListenTemplate, UnixTemplate,
};
pub use standard::{FileTemplate, StdioMode, StdioTemplate};
pub use template::{
    Accepted, EndpointKind, EndpointTemplate, HandshakeFuture, Incoming, Listener,
    ListenerTemplate, TemplateOverrides,
};
pub use tls::{TlsListenTemplate, TlsTemplate, TlsVersion, Verification, VersionRange};
pub use transport::{DatagramTransport, StreamTransport, Transport};
pub use tunnel::{TunnelProtocol, TunnelTemplate, TunnelTls};
