//! Error types for the relay crate.

use interpose_endpoint::EndpointError;
use interpose_module::ModuleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("config error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::Endpoint(e) => e.error_type(),
            RelayError::Module(e) => e.error_type(),
            RelayError::Config(_) => interpose_core::ERROR_CONFIG,
        }
    }
}
