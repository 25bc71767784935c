//! The endpoint wrapper.
//!
//! An [`Endpoint`] couples a transport with the codec that frames it and a
//! lifecycle:
//!
//! ```text
//! CREATED --init--> INITIALIZED --activate--> ACTIVE --close/error--> CLOSING --> CLOSED
//! ```
//!
//! Once closing has begun every read and write returns
//! [`EndpointError::StreamClosed`] without touching the transport. Transport
//! errors and end of stream are reported the same way and close the endpoint,
//! so callers only ever see one "this side is gone" signal.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use interpose_proto::{Codec, CodecSpec};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::EndpointError;
use crate::template::{EndpointTemplate, TemplateOverrides};
use crate::transport::Transport;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Which directions an endpoint can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
}

impl Capabilities {
    pub const DUPLEX: Self = Self {
        readable: true,
        writable: true,
    };
    pub const READ_ONLY: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITE_ONLY: Self = Self {
        readable: false,
        writable: true,
    };
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::DUPLEX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Created = 0,
    Initialized = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Created,
            1 => State::Initialized,
            2 => State::Active,
            3 => State::Closing,
            _ => State::Closed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Created => "created",
            State::Initialized => "initialized",
            State::Active => "active",
            State::Closing => "closing",
            State::Closed => "closed",
        })
    }
}

pub struct Endpoint {
    name: String,
    capabilities: Capabilities,
    template: Option<Arc<dyn EndpointTemplate>>,
    state: AtomicU8,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    codec: Mutex<Box<dyn Codec>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// A not-yet-initialized endpoint; [`init`](Self::init) opens the resource.
    pub fn from_template(template: Arc<dyn EndpointTemplate>) -> Self {
        Self {
            name: template.describe(),
            capabilities: template.capabilities(),
            codec: Mutex::new(template.codec().build()),
            template: Some(template),
            state: AtomicU8::new(State::Created as u8),
            transport: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// An endpoint around an already-open transport, such as an accepted
    /// connection. Starts INITIALIZED.
    pub fn from_transport(
        name: impl Into<String>,
        capabilities: Capabilities,
        codec: CodecSpec,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities,
            template: None,
            state: AtomicU8::new(State::Initialized as u8),
            transport: Mutex::new(Some(Arc::from(transport))),
            codec: Mutex::new(codec.build()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn template(&self) -> Option<&Arc<dyn EndpointTemplate>> {
        self.template.as_ref()
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= State::Closing
    }

    /// Acquire the OS resource. A no-op unless the endpoint is CREATED.
    pub async fn init(&self) -> Result<(), EndpointError> {
        if self.state() != State::Created {
            return Ok(());
        }
        let Some(template) = &self.template else {
            return Ok(());
        };
        let transport = template.open().await?;
        *self.transport.lock() = Some(Arc::from(transport));
        if self
            .state
            .compare_exchange(
                State::Created as u8,
                State::Initialized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Closed while connecting.
            self.release().await;
            return Err(EndpointError::StreamClosed);
        }
        debug!(endpoint = %self.name, "endpoint initialized");
        Ok(())
    }

    /// Mark the endpoint as being pumped by a forwarder.
    pub fn activate(&self) {
        let _ = self.state.compare_exchange(
            State::Initialized as u8,
            State::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// A fresh endpoint from the same template with `overrides` applied.
    pub fn clone_with(&self, overrides: &TemplateOverrides) -> Result<Endpoint, EndpointError> {
        let template = self.template.as_ref().ok_or_else(|| {
            EndpointError::Config(format!("endpoint '{}' has no template to clone", self.name))
        })?;
        Ok(Endpoint::from_template(template.with_overrides(overrides)?))
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, EndpointError> {
        if self.is_closing() {
            return Err(EndpointError::StreamClosed);
        }
        self.transport.lock().clone().ok_or(EndpointError::StreamClosed)
    }

    /// Wait for at least one complete frame.
    ///
    /// Returns `StreamClosed` on end of stream, transport error, or once
    /// [`close`](Self::close) is called from anywhere.
    pub async fn read_frames(&self) -> Result<Vec<Bytes>, EndpointError> {
        loop {
            let transport = self.transport()?;
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EndpointError::StreamClosed),
                r = transport.recv() => r,
            };
            match chunk {
                Ok(Some(chunk)) => {
                    trace!(endpoint = %self.name, len = chunk.len(), "chunk received");
                    let frames = self.codec.lock().decode(chunk);
                    if !frames.is_empty() {
                        return Ok(frames);
                    }
                }
                Ok(None) => {
                    debug!(endpoint = %self.name, "end of stream");
                    self.close().await;
                    return Err(EndpointError::StreamClosed);
                }
                Err(e) => {
                    debug!(endpoint = %self.name, error = %e, "read failed");
                    self.close().await;
                    return Err(EndpointError::StreamClosed);
                }
            }
        }
    }

    /// Encode and send one frame.
    pub async fn write_frame(&self, frame: Bytes) -> Result<(), EndpointError> {
        let transport = self.transport()?;
        let chunks = self.codec.lock().encode(frame);
        for chunk in chunks {
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EndpointError::StreamClosed),
                r = transport.send(&chunk) => r,
            };
            if let Err(e) = sent {
                debug!(endpoint = %self.name, error = %e, "write failed");
                self.close().await;
                return Err(EndpointError::StreamClosed);
            }
        }
        Ok(())
    }

    /// Release the endpoint. Idempotent and safe to call concurrently; only
    /// the first caller performs the shutdown.
    pub async fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= State::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                State::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.cancel.cancel();
        self.release().await;
        self.state.store(State::Closed as u8, Ordering::Release);
        debug!(endpoint = %self.name, "endpoint closed");
    }

    async fn release(&self) {
        let transport = self.transport.lock().take();
        if let Some(transport) = transport
            && let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_GRACE, transport.shutdown()).await
        {
            trace!(endpoint = %self.name, error = %e, "shutdown error");
        }
    }
}
