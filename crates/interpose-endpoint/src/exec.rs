//! Child process endpoint: frames go to the child's stdin, its stdout and
//! stderr come back merged on one pipe.

use std::io;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use interpose_proto::CodecSpec;
use parking_lot::Mutex;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;

use crate::error::EndpointError;
use crate::template::{EndpointTemplate, TemplateOverrides, no_destination};
use crate::transport::{StreamTransport, Transport};

/// Run `command` through `sh -c`.
#[derive(Debug, Clone)]
pub struct ExecTemplate {
    pub command: String,
    pub codec: CodecSpec,
}

impl ExecTemplate {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            codec: CodecSpec::Passthrough,
        }
    }

    fn spawn(&self) -> io::Result<ChildTransport> {
        let (reader, writer) = io::pipe()?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        // The command still holds the write ends; the pipe only reports EOF
        // once every copy outside the child is gone.
        drop(cmd);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin unavailable"))?;
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        Ok(ChildTransport {
            io: StreamTransport::from_parts(output, stdin),
            child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl EndpointTemplate for ExecTemplate {
    fn kind(&self) -> &'static str {
        "exec"
    }

    fn describe(&self) -> String {
        format!("exec {}", self.command)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let transport = self
            .spawn()
            .map_err(|e| EndpointError::resource("spawn", &self.command, e))?;
        debug!(command = %self.command, pid = ?transport.child.lock().id(), "child spawned");
        Ok(Box::new(transport))
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        no_destination(self.kind(), overrides)?;
        Ok(Arc::new(self.clone()))
    }
}

struct ChildTransport {
    io: StreamTransport<pipe::Receiver, ChildStdin>,
    child: Mutex<Child>,
}

#[async_trait]
impl Transport for ChildTransport {
    async fn recv(&self) -> io::Result<Option<Bytes>> {
        self.io.recv().await
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.io.send(data).await
    }

    async fn shutdown(&self) -> io::Result<()> {
        let _ = self.io.shutdown().await;
        let mut child = self.child.lock();
        match child.try_wait()? {
            Some(_) => Ok(()),
            None => child.start_kill(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    #[tokio::test]
    async fn test_exec_echoes_through_cat() {
        let ep = Endpoint::from_template(Arc::new(ExecTemplate::new("cat")));
        ep.init().await.unwrap();
        ep.write_frame(Bytes::from_static(b"ping\n")).await.unwrap();
        let frames = ep.read_frames().await.unwrap();
        assert_eq!(frames.concat(), b"ping\n");
        ep.close().await;
    }

    #[tokio::test]
    async fn test_exec_merges_stderr() {
        let ep = Endpoint::from_template(Arc::new(ExecTemplate::new("echo oops 1>&2")));
        ep.init().await.unwrap();
        let mut out = Vec::new();
        while let Ok(frames) = ep.read_frames().await {
            for f in frames {
                out.extend_from_slice(&f);
            }
        }
        assert_eq!(out, b"oops\n");
    }
}
