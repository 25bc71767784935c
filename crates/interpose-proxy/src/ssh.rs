//! SSH channel multiplexing proxy.
//!
//! Each client gets one inbound SSH session and exactly one outbound session
//! to the server. Every channel the client opens is matched by a channel
//! opened on the outbound session; channel requests (pty, shell, exec, agent
//! forwarding) are replayed on the outbound channel in order, and the client
//! gets the outbound verdict as its reply. Channel data is only relayed once
//! the outbound channel accepted a shell or exec request, so no client bytes
//! reach the server ahead of the command they belong to.
//!
//! Key exchange, authentication and channel framing are left to an
//! [`SshBackend`]. The multiplexer only sees byte transports and requests.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use interpose_core::{Destination, defaults};
use interpose_endpoint::{Capabilities, Endpoint, TcpListenTemplate, Transport};
use interpose_module::{ChainFactory, PairInfo};
use interpose_proto::CodecSpec;
use interpose_relay::Forwarder;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::ProxyError;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ── Backend seam ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
    pub modes: Vec<u8>,
}

/// A request made by the client on one of its channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Pty(PtyRequest),
    Shell,
    Exec(String),
    AgentForward,
}

impl ChannelRequest {
    /// Whether the request starts the channel's session data.
    pub fn starts_session(&self) -> bool {
        matches!(self, ChannelRequest::Shell | ChannelRequest::Exec(_))
    }
}

/// A client request waiting for the outbound channel's answer.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: ChannelRequest,
    /// Receives `true` once the outbound channel accepted the request.
    pub reply: oneshot::Sender<bool>,
}

impl PendingRequest {
    pub fn new(request: ChannelRequest) -> (Self, oneshot::Receiver<bool>) {
        let (reply, verdict) = oneshot::channel();
        (Self { request, reply }, verdict)
    }
}

/// Where and as whom the outbound session logs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub destination: Destination,
    pub user: String,
    pub password: Option<String>,
    pub source_port: Option<u16>,
    /// Bind with `IP_TRANSPARENT`.
    pub transparent: bool,
}

pub struct InboundChannel {
    pub id: u32,
    pub transport: Box<dyn Transport>,
    /// Requests in the order the client made them. Closed with the channel.
    /// The backend answers the client with each request's verdict.
    pub requests: mpsc::UnboundedReceiver<PendingRequest>,
}

impl fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundChannel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub struct OutboundChannel {
    pub transport: Box<dyn Transport>,
    pub control: Box<dyn ChannelControl>,
}

/// Sends requests on an outbound channel.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    async fn request(&self, request: ChannelRequest) -> Result<(), ProxyError>;
}

/// Server side of a client's session.
#[async_trait]
pub trait InboundSession: Send {
    /// Next channel the client opened; `None` once the session is over.
    async fn next_channel(&mut self) -> Option<InboundChannel>;

    async fn close(&mut self);
}

/// Client side of the session toward the real server.
#[async_trait]
pub trait OutboundSession: Send + Sync {
    async fn open_channel(&self) -> Result<OutboundChannel, ProxyError>;

    async fn close(&self);
}

/// SSH protocol implementation used by [`SshMuxProxy`].
#[async_trait]
pub trait SshBackend: Send + Sync + fmt::Debug {
    /// Run the server handshake on an accepted connection.
    async fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Box<dyn InboundSession>, ProxyError>;

    /// Connect and authenticate to the real server.
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn OutboundSession>, ProxyError>;
}

// ── Options ──

fn default_listen_host() -> String {
    defaults::DEFAULT_LISTEN_HOST.to_string()
}

fn default_listen_port() -> u16 {
    defaults::DEFAULT_SSH_LISTEN_PORT
}

fn default_server_host() -> String {
    defaults::DEFAULT_SERVER_HOST.to_string()
}

fn default_server_port() -> u16 {
    defaults::DEFAULT_SSH_SERVER_PORT
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshProxyOptions {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub transparent: bool,
}

impl Default for SshProxyOptions {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            server_host: default_server_host(),
            server_port: default_server_port(),
            user: default_user(),
            password: None,
            source_port: None,
            mirror: false,
            transparent: false,
        }
    }
}

impl SshProxyOptions {
    /// The outbound target for a client, given what the listener learned.
    pub fn target(
        &self,
        peer: SocketAddr,
        original: Option<Destination>,
    ) -> Result<SshTarget, ProxyError> {
        let destination = if self.transparent {
            original.ok_or_else(|| {
                ProxyError::Config(format!("no original destination for ssh client {peer}"))
            })?
        } else {
            Destination::new(&self.server_host, self.server_port)
        };
        let source_port = if self.mirror {
            Some(peer.port())
        } else {
            self.source_port
        };
        Ok(SshTarget {
            destination,
            user: self.user.clone(),
            password: self.password.clone(),
            source_port,
            transparent: self.transparent,
        })
    }
}

// ── Multiplexer ──

type ChannelMap = Arc<Mutex<HashMap<u64, Forwarder>>>;

struct MuxInner {
    options: SshProxyOptions,
    listener: TcpListenTemplate,
    backend: Arc<dyn SshBackend>,
    modules: ChainFactory,
    codec: CodecSpec,
    next_session: AtomicU64,
    next_pair: AtomicU64,
}

#[derive(Clone)]
pub struct SshMuxProxy {
    inner: Arc<MuxInner>,
}

impl fmt::Debug for SshMuxProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshMuxProxy")
            .field("listen", &self.inner.listener.bind)
            .field("backend", &self.inner.backend)
            .finish_non_exhaustive()
    }
}

impl SshMuxProxy {
    pub fn new(
        options: SshProxyOptions,
        backend: Arc<dyn SshBackend>,
        modules: ChainFactory,
        codec: CodecSpec,
    ) -> Result<Self, ProxyError> {
        if options.mirror && options.source_port.is_some() {
            return Err(ProxyError::Config(
                "'mirror' and 'source_port' are mutually exclusive".into(),
            ));
        }
        let listener = TcpListenTemplate::new(Destination::new(&options.host, options.port));
        let listener = if options.transparent {
            listener.transparent()
        } else {
            listener
        };
        Ok(Self::with_listener(options, listener, backend, modules, codec))
    }

    /// Use a prepared listener template, e.g. one with a custom
    /// original-destination lookup.
    pub fn with_listener(
        options: SshProxyOptions,
        listener: TcpListenTemplate,
        backend: Arc<dyn SshBackend>,
        modules: ChainFactory,
        codec: CodecSpec,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                options,
                listener,
                backend,
                modules,
                codec,
                next_session: AtomicU64::new(1),
                next_pair: AtomicU64::new(1),
            }),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        Ok(self.inner.listener.bind_tcp().await?)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept clients until `shutdown`, then wait for every session to wind
    /// down.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        info!(addr = ?listener.local_addr().ok(), "ssh proxy listening");
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("ssh proxy shutting down");
                    break;
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
                        interpose_metrics::record_connection_accepted();
                        let original = self.inner.listener.original_destination(&stream);
                        let inner = self.inner.clone();
                        let shutdown = shutdown.child_token();
                        sessions.spawn(
                            async move {
                                if let Err(e) =
                                    run_session(inner, stream, peer, original, shutdown).await
                                {
                                    warn!(error = %e, "ssh session failed");
                                    interpose_metrics::record_error(e.error_type());
                                }
                            }
                            .instrument(info_span!("ssh", session = id, %peer)),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        interpose_metrics::record_error(interpose_core::ERROR_IO);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        drop(listener);
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

async fn run_session(
    inner: Arc<MuxInner>,
    stream: TcpStream,
    peer: SocketAddr,
    original: Option<Destination>,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    let target = inner.options.target(peer, original)?;

    // The server must be reachable before the client is answered.
    let connected = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Ok(()),
        connected = inner.backend.connect(&target) => connected,
    };
    let outbound: Arc<dyn OutboundSession> = Arc::from(
        connected.inspect_err(|_| interpose_metrics::record_handshake_failure("ssh"))?,
    );

    let accepted = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            outbound.close().await;
            return Ok(());
        }
        accepted = inner.backend.accept(stream, peer) => accepted,
    };
    let mut inbound = match accepted {
        Ok(inbound) => inbound,
        Err(e) => {
            interpose_metrics::record_handshake_failure("ssh");
            outbound.close().await;
            return Err(e);
        }
    };
    info!(server = %target.destination, user = %target.user, "ssh session established");

    let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
    let mut pending = JoinSet::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            Some(_) = pending.join_next(), if !pending.is_empty() => continue,
            next = inbound.next_channel() => next,
        };
        let Some(channel) = next else { break };
        let id = channel.id;
        let upstream = match outbound.open_channel().await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = channel.transport.shutdown().await;
                warn!(channel = id, error = %e, "channel not relayed");
                interpose_metrics::record_error(e.error_type());
                continue;
            }
        };
        debug!(channel = id, "outbound channel opened");
        pending.spawn(
            mirror_channel(inner.clone(), channel, upstream, channels.clone()).in_current_span(),
        );
    }

    // Channels still waiting for a shell or exec never started a forwarder.
    pending.abort_all();
    while pending.join_next().await.is_some() {}
    close_channels(&channels).await;
    inbound.close().await;
    outbound.close().await;
    info!("ssh session closed");
    Ok(())
}

/// Replays the channel's requests upstream and relays its data once the
/// session on it has started.
async fn mirror_channel(
    inner: Arc<MuxInner>,
    channel: InboundChannel,
    upstream: OutboundChannel,
    channels: ChannelMap,
) {
    let InboundChannel {
        id,
        transport,
        mut requests,
    } = channel;
    let OutboundChannel {
        transport: upstream_transport,
        control,
    } = upstream;

    loop {
        let Some(pending) = requests.recv().await else {
            debug!(channel = id, "channel closed before a shell or exec");
            let _ = transport.shutdown().await;
            let _ = upstream_transport.shutdown().await;
            return;
        };
        let starts = pending.request.starts_session();
        if apply_request(id, control.as_ref(), pending).await && starts {
            break;
        }
    }

    if let Err(e) = start_pair(&inner, id, transport, upstream_transport, &channels).await {
        warn!(channel = id, error = %e, "channel not relayed");
        interpose_metrics::record_error(e.error_type());
        return;
    }

    while let Some(pending) = requests.recv().await {
        apply_request(id, control.as_ref(), pending).await;
    }
}

/// Sends one request upstream and hands the verdict back to the client.
async fn apply_request(id: u32, control: &dyn ChannelControl, pending: PendingRequest) -> bool {
    let PendingRequest { request, reply } = pending;
    debug!(channel = id, ?request, "mirroring channel request");
    let accepted = match control.request(request).await {
        Ok(()) => true,
        Err(e) => {
            warn!(channel = id, error = %e, "channel request refused upstream");
            false
        }
    };
    if reply.send(accepted).is_err() {
        debug!(channel = id, "client stopped waiting for the reply");
    }
    accepted
}

async fn start_pair(
    inner: &MuxInner,
    id: u32,
    transport: Box<dyn Transport>,
    upstream: Box<dyn Transport>,
    channels: &ChannelMap,
) -> Result<(), ProxyError> {
    let client = Endpoint::from_transport(
        format!("ssh channel {id}"),
        Capabilities::DUPLEX,
        inner.codec,
        transport,
    );
    let server = Endpoint::from_transport(
        format!("ssh upstream channel {id}"),
        Capabilities::DUPLEX,
        inner.codec,
        upstream,
    );
    let pair = inner.next_pair.fetch_add(1, Ordering::Relaxed);
    let chain = match inner
        .modules
        .build(&PairInfo::new(pair, client.name(), server.name()))
    {
        Ok(chain) => chain,
        Err(e) => {
            client.close().await;
            server.close().await;
            return Err(e.into());
        }
    };

    let mut active = channels.lock();
    let registry = channels.clone();
    let forwarder = Forwarder::start(pair, client, server, chain, move |summary| {
        registry.lock().remove(&summary.id);
        debug!(
            a_to_b = summary.a_to_b.bytes,
            b_to_a = summary.b_to_a.bytes,
            "channel pair finished"
        );
    });
    active.insert(pair, forwarder);
    Ok(())
}

async fn close_channels(channels: &ChannelMap) {
    let forwarders: Vec<Forwarder> = channels.lock().values().cloned().collect();
    let mut closing = JoinSet::new();
    for forwarder in forwarders {
        closing.spawn(async move { forwarder.close().await });
    }
    while closing.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_target_uses_server_options() {
        let options = SshProxyOptions {
            server_host: "10.1.1.1".into(),
            user: "alice".into(),
            ..Default::default()
        };
        let peer: SocketAddr = "192.168.0.9:50022".parse().unwrap();
        let target = options
            .target(peer, Some(Destination::new("10.0.0.5", 22)))
            .unwrap();
        assert_eq!(target.destination, Destination::new("10.1.1.1", 22));
        assert_eq!(target.user, "alice");
        assert_eq!(target.source_port, None);
    }

    #[test]
    fn test_transparent_mirror_target() {
        let options = SshProxyOptions {
            transparent: true,
            mirror: true,
            ..Default::default()
        };
        let peer: SocketAddr = "192.168.0.9:50022".parse().unwrap();
        let target = options
            .target(peer, Some(Destination::new("10.0.0.5", 2200)))
            .unwrap();
        assert_eq!(target.destination, Destination::new("10.0.0.5", 2200));
        assert_eq!(target.source_port, Some(50022));
        assert!(options.target(peer, None).is_err());
    }

    #[test]
    fn test_only_shell_and_exec_start_sessions() {
        assert!(ChannelRequest::Shell.starts_session());
        assert!(ChannelRequest::Exec("id".into()).starts_session());
        assert!(!ChannelRequest::AgentForward.starts_session());
    }

    #[test]
    fn test_defaults() {
        let options = SshProxyOptions::default();
        assert_eq!(options.port, 2222);
        assert_eq!(options.server_port, 22);
    }
}
