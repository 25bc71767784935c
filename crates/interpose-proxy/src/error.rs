//! Error types for the proxy crate.

use interpose_cert::CertError;
use interpose_core::{OptionsError, UnknownEntry};
use interpose_endpoint::EndpointError;
use interpose_module::ModuleError;
use interpose_net::NetError;
use interpose_proto::CodecError;
use interpose_relay::RelayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("network configuration failed: {0}")]
    Net(#[from] NetError),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Unknown(#[from] UnknownEntry),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Endpoint(e) => e.error_type(),
            ProxyError::Relay(e) => e.error_type(),
            ProxyError::Net(e) => e.error_type(),
            ProxyError::Cert(e) => e.error_type(),
            ProxyError::Module(e) => e.error_type(),
            ProxyError::Ssh(_) => interpose_core::ERROR_SSH_HANDSHAKE,
            ProxyError::Codec(_)
            | ProxyError::Options(_)
            | ProxyError::Unknown(_)
            | ProxyError::Config(_) => interpose_core::ERROR_CONFIG,
        }
    }
}
