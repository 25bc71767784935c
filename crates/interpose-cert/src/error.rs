//! Certificate service errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    #[error("invalid CA material: {0}")]
    InvalidCa(String),

    /// Exactly one of certificate/key exists on disk.
    #[error("CA {present} exists at {path} but its {missing} is missing; refusing to continue")]
    IncompleteCa {
        present: &'static str,
        missing: &'static str,
        path: PathBuf,
    },

    #[error("no home directory to store CA material in")]
    NoHomeDir,

    #[error("invalid common name: {0}")]
    InvalidCommonName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertError {
    pub fn error_type(&self) -> &'static str {
        match self {
            CertError::IncompleteCa { .. } | CertError::NoHomeDir => interpose_core::ERROR_CONFIG,
            CertError::Io(_) => interpose_core::ERROR_IO,
            _ => interpose_core::ERROR_CERT,
        }
    }
}
