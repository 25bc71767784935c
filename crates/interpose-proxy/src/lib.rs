//! Proxies built on the interpose relay engine.
//!
//! A proxy is a listener, a policy choosing each connection's upstream and
//! the host network configuration it needs while it runs:
//!
//! - layer 4 (`tcp`, `udp`, `unix`): static, mirrored or fixed source port,
//!   or transparent interception with TPROXY rules
//! - `tls`: TLS on both sides
//! - `https`: HTTP CONNECT with TLS interception through minted certificates
//! - [`SshMuxProxy`]: SSH channel multiplexing over a pluggable [`SshBackend`]
//!
//! [`proxies`] is the name → constructor registry used by configuration.

pub mod error;
pub mod layer4;
pub mod network;
pub mod proxy;
pub mod registry;
pub mod ssh;

pub use error::ProxyError;
pub use layer4::{Layer4Policy, SourcePort, Target};
pub use network::NetworkSetup;
pub use proxy::Proxy;
pub use registry::{
    HttpsProxyOptions, Layer4Options, ProxyConstructor, TlsProxyOptions, build_proxy, proxies,
};
pub use ssh::{
    ChannelControl, ChannelRequest, InboundChannel, InboundSession, OutboundChannel,
    OutboundSession, PendingRequest, PtyRequest, SshBackend, SshMuxProxy, SshProxyOptions,
    SshTarget,
};
