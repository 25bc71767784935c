//! How a multi-client relay picks the peer for each accepted connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use interpose_core::Destination;
use interpose_endpoint::{EndpointError, EndpointTemplate, TemplateOverrides};

/// What is known about an accepted connection once its handshake is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    /// Original destination (transparent mode) or CONNECT target.
    pub destination: Option<Destination>,
}

/// Produces the template for the server side of one connection.
pub trait PeerPolicy: Send + Sync + fmt::Debug {
    fn peer_template(&self, conn: &ConnectionInfo) -> Result<Arc<dyn EndpointTemplate>, EndpointError>;
}

/// Every connection gets the same peer.
#[derive(Debug, Clone)]
pub struct FixedPeer(pub Arc<dyn EndpointTemplate>);

impl PeerPolicy for FixedPeer {
    fn peer_template(&self, _conn: &ConnectionInfo) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        Ok(self.0.clone())
    }
}

/// Retarget the peer at the destination the client asked for, when it
/// asked for one.
#[derive(Debug, Clone)]
pub struct RequestedPeer(pub Arc<dyn EndpointTemplate>);

impl PeerPolicy for RequestedPeer {
    fn peer_template(&self, conn: &ConnectionInfo) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        match &conn.destination {
            Some(dest) => self.0.with_overrides(&TemplateOverrides::destination(dest.clone())),
            None => Ok(self.0.clone()),
        }
    }
}
