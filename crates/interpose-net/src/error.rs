//! Network plumbing errors.

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("command `{command}` failed with {status}")]
    CommandFailed { command: String, status: String },
    #[error("undefined filter label '{0}'")]
    UnknownLabel(String),
    #[error("jump to '{label}' from instruction {from} cannot be encoded (distance {distance})")]
    JumpOutOfRange {
        label: String,
        from: usize,
        distance: i64,
    },
    #[error("{0} is only available on Linux")]
    Unsupported(&'static str),
}

impl NetError {
    pub fn error_type(&self) -> &'static str {
        match self {
            NetError::Io(_) | NetError::CommandFailed { .. } => interpose_core::ERROR_IO,
            _ => interpose_core::ERROR_CONFIG,
        }
    }
}
