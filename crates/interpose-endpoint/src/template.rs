//! Endpoint templates and listeners.
//!
//! Templates are immutable descriptions of how to open an endpoint; they own
//! no OS resource and can be opened any number of times. Listener templates
//! bind into a [`Listener`], whose `accept` yields connections whose
//! protocol handshake (TLS, CONNECT) is left for the caller to drive off the
//! accept loop.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use interpose_core::Destination;
use interpose_proto::CodecSpec;

use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::transport::Transport;

/// Fields that may be replaced when deriving a template from another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateOverrides {
    pub destination: Option<Destination>,
    pub source_port: Option<u16>,
}

impl TemplateOverrides {
    pub fn destination(destination: Destination) -> Self {
        Self {
            destination: Some(destination),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.destination.is_none() && self.source_port.is_none()
    }
}

/// Recipe for an outbound (or otherwise self-opening) endpoint.
#[async_trait]
pub trait EndpointTemplate: Send + Sync + fmt::Debug {
    /// Registry name of the endpoint kind.
    fn kind(&self) -> &'static str;

    /// Human-readable target, used in logs.
    fn describe(&self) -> String;

    fn capabilities(&self) -> Capabilities {
        Capabilities::DUPLEX
    }

    fn codec(&self) -> CodecSpec;

    /// Where this template connects, if it is a network client.
    fn destination(&self) -> Option<&Destination> {
        None
    }

    /// Open the resource.
    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError>;

    /// A new template equal to this one with `overrides` applied. Kinds that
    /// have no destination reject a destination override.
    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError>;
}

pub type HandshakeFuture = Pin<Box<dyn Future<Output = Result<Accepted, EndpointError>> + Send>>;

/// A connection fresh off the accept loop.
pub struct Incoming {
    pub peer: Option<SocketAddr>,
    pub label: String,
    /// Completes the connection's protocol handshake, if any.
    pub handshake: HandshakeFuture,
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("peer", &self.peer)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Incoming {
    /// An incoming connection with nothing left to negotiate.
    pub fn ready(peer: Option<SocketAddr>, accepted: Accepted) -> Self {
        Self {
            peer,
            label: accepted.endpoint.name().to_string(),
            handshake: Box::pin(async move { Ok(accepted) }),
        }
    }
}

/// The result of a completed handshake.
#[derive(Debug)]
pub struct Accepted {
    pub endpoint: Endpoint,
    /// Where the client was trying to go: the transparent original
    /// destination or the CONNECT target.
    pub destination: Option<Destination>,
}

/// A bound listening resource.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Incoming, EndpointError>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Recipe for a listening endpoint.
#[async_trait]
pub trait ListenerTemplate: Send + Sync + fmt::Debug {
    fn kind(&self) -> &'static str;

    fn describe(&self) -> String;

    fn codec(&self) -> CodecSpec;

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError>;
}

/// What a registry constructor produces.
#[derive(Debug, Clone)]
pub enum EndpointKind {
    Connect(Arc<dyn EndpointTemplate>),
    Listen(Arc<dyn ListenerTemplate>),
}

impl EndpointKind {
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointKind::Connect(t) => t.kind(),
            EndpointKind::Listen(t) => t.kind(),
        }
    }

    pub fn into_connect(self) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        match self {
            EndpointKind::Connect(t) => Ok(t),
            EndpointKind::Listen(t) => Err(EndpointError::Config(format!(
                "'{}' is a listening endpoint, expected a connecting one",
                t.kind()
            ))),
        }
    }

    pub fn into_listen(self) -> Result<Arc<dyn ListenerTemplate>, EndpointError> {
        match self {
            EndpointKind::Listen(t) => Ok(t),
            EndpointKind::Connect(t) => Err(EndpointError::Config(format!(
                "'{}' is a connecting endpoint, expected a listening one",
                t.kind()
            ))),
        }
    }
}

pub(crate) fn no_destination(kind: &str, overrides: &TemplateOverrides) -> Result<(), EndpointError> {
    if overrides.destination.is_some() {
        return Err(EndpointError::Config(format!(
            "endpoint '{kind}' does not take a destination"
        )));
    }
    Ok(())
}
