//! Process stdio, the null sink, and output files.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use interpose_proto::CodecSpec;
use tokio::fs::OpenOptions;
use tokio::io;
use tracing::debug;

use crate::endpoint::Capabilities;
use crate::error::EndpointError;
use crate::template::{EndpointTemplate, TemplateOverrides, no_destination};
use crate::transport::{StreamTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Read stdin, write stdout.
    Both,
    Stdin,
    Stdout,
    /// Swallow everything written.
    Null,
}

impl StdioMode {
    fn kind(self) -> &'static str {
        match self {
            StdioMode::Both => "stdio",
            StdioMode::Stdin => "stdin",
            StdioMode::Stdout => "stdout",
            StdioMode::Null => "devnull",
        }
    }

    fn capabilities(self) -> Capabilities {
        match self {
            StdioMode::Both => Capabilities::DUPLEX,
            StdioMode::Stdin => Capabilities::READ_ONLY,
            StdioMode::Stdout | StdioMode::Null => Capabilities::WRITE_ONLY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StdioTemplate {
    pub mode: StdioMode,
    pub codec: CodecSpec,
}

impl StdioTemplate {
    pub fn new(mode: StdioMode) -> Self {
        Self {
            mode,
            codec: CodecSpec::Passthrough,
        }
    }
}

#[async_trait]
impl EndpointTemplate for StdioTemplate {
    fn kind(&self) -> &'static str {
        self.mode.kind()
    }

    fn describe(&self) -> String {
        self.mode.kind().to_string()
    }

    fn capabilities(&self) -> Capabilities {
        self.mode.capabilities()
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let transport: Box<dyn Transport> = match self.mode {
            StdioMode::Both => Box::new(StreamTransport::from_parts(io::stdin(), io::stdout())),
            StdioMode::Stdin => Box::new(StreamTransport::from_parts(io::stdin(), io::sink())),
            StdioMode::Stdout => Box::new(StreamTransport::from_parts(io::empty(), io::stdout())),
            StdioMode::Null => Box::new(StreamTransport::from_parts(io::empty(), io::sink())),
        };
        Ok(transport)
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        no_destination(self.kind(), overrides)?;
        Ok(Arc::new(self.clone()))
    }
}

/// Write-only file. Truncated on open unless `append` is set.
#[derive(Debug, Clone)]
pub struct FileTemplate {
    pub path: PathBuf,
    pub append: bool,
    pub codec: CodecSpec,
}

impl FileTemplate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: false,
            codec: CodecSpec::Passthrough,
        }
    }
}

#[async_trait]
impl EndpointTemplate for FileTemplate {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::WRITE_ONLY
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let mut opts = OpenOptions::new();
        opts.create(true);
        if self.append {
            opts.append(true);
        } else {
            opts.write(true).truncate(true);
        }
        let file = opts
            .open(&self.path)
            .await
            .map_err(|e| EndpointError::resource("open", self.path.display(), e))?;
        debug!(path = %self.path.display(), append = self.append, "file opened");
        Ok(Box::new(StreamTransport::from_parts(io::empty(), file)))
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        no_destination(self.kind(), overrides)?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_file_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"stale").unwrap();

        let ep = Endpoint::from_template(Arc::new(FileTemplate::new(&path)));
        assert_eq!(ep.capabilities(), Capabilities::WRITE_ONLY);
        ep.init().await.unwrap();
        ep.write_frame(Bytes::from_static(b"one")).await.unwrap();
        ep.close().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"one");

        let mut appending = FileTemplate::new(&path);
        appending.append = true;
        let ep = Endpoint::from_template(Arc::new(appending));
        ep.init().await.unwrap();
        ep.write_frame(Bytes::from_static(b"two")).await.unwrap();
        ep.close().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"onetwo");
    }

    #[tokio::test]
    async fn test_devnull_accepts_writes() {
        let ep = Endpoint::from_template(Arc::new(StdioTemplate::new(StdioMode::Null)));
        ep.init().await.unwrap();
        ep.write_frame(Bytes::from_static(b"gone")).await.unwrap();
        assert_eq!(ep.capabilities(), Capabilities::WRITE_ONLY);
    }

    #[test]
    fn test_stdio_rejects_destination() {
        let t = StdioTemplate::new(StdioMode::Both);
        let overrides = TemplateOverrides::destination(interpose_core::Destination::new("h", 1));
        assert!(t.with_overrides(&overrides).is_err());
    }
}
