//! Module errors.

use std::path::PathBuf;

use interpose_core::{OptionsError, UnknownEntry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Unknown(#[from] UnknownEntry),

    #[error("invalid module option: {0}")]
    Invalid(String),

    #[error("failed to open {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ModuleError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ModuleError::Output { .. } => interpose_core::ERROR_MODULE,
            _ => interpose_core::ERROR_CONFIG,
        }
    }
}
