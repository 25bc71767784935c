//! Endpoint errors.

use std::io;

use interpose_cert::CertError;
use interpose_core::{OptionsError, UnknownEntry};
use interpose_proto::{CodecError, ParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    /// Acquiring the OS resource behind an endpoint failed.
    #[error("failed to {action} {target}: {source}")]
    Resource {
        action: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Unknown(#[from] UnknownEntry),

    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The stream ended or the endpoint was closed. Never surfaced to users.
    #[error("stream closed")]
    StreamClosed,
}

impl EndpointError {
    pub fn resource(action: &'static str, target: impl ToString, source: io::Error) -> Self {
        EndpointError::Resource {
            action,
            target: target.to_string(),
            source,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            EndpointError::Resource { action, .. } if *action == "bind" => interpose_core::ERROR_BIND,
            EndpointError::Resource { .. } => interpose_core::ERROR_CONNECT,
            EndpointError::Handshake(_) | EndpointError::Tls(_) => interpose_core::ERROR_TLS_HANDSHAKE,
            EndpointError::Protocol(_) => interpose_core::ERROR_PROTOCOL,
            EndpointError::Io(_) => interpose_core::ERROR_IO,
            EndpointError::Cert(_) => interpose_core::ERROR_CERT,
            EndpointError::Config(_)
            | EndpointError::Options(_)
            | EndpointError::Codec(_)
            | EndpointError::Unknown(_) => interpose_core::ERROR_CONFIG,
            EndpointError::Timeout(_) => interpose_core::ERROR_TIMEOUT,
            EndpointError::StreamClosed => interpose_core::ERROR_STREAM_CLOSED,
        }
    }

    pub fn is_stream_closed(&self) -> bool {
        matches!(self, EndpointError::StreamClosed)
    }
}
