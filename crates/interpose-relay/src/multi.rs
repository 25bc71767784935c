//! Listening relay: one forwarder per accepted connection.
//!
//! The accept loop never waits on a connection's handshake or on opening
//! its peer; both run in the connection's own task. Running forwarders are
//! kept in a map keyed by connection id and remove themselves when their
//! pair finishes. Failures stay with the connection that caused them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use interpose_endpoint::{Accepted, Endpoint, Incoming, Listener, ListenerTemplate};
use interpose_module::{ChainFactory, PairInfo};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::RelayError;
use crate::forwarder::Forwarder;
use crate::policy::{ConnectionInfo, PeerPolicy};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type ActiveMap = Arc<Mutex<HashMap<u64, Forwarder>>>;

struct Inner {
    listener: Arc<dyn ListenerTemplate>,
    policy: Arc<dyn PeerPolicy>,
    modules: ChainFactory,
    active: ActiveMap,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct MultiClientRelay {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MultiClientRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiClientRelay")
            .field("listener", &self.inner.listener.describe())
            .field("policy", &self.inner.policy)
            .field("active", &self.active_count())
            .finish()
    }
}

impl MultiClientRelay {
    pub fn new(
        listener: Arc<dyn ListenerTemplate>,
        policy: Arc<dyn PeerPolicy>,
        modules: ChainFactory,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                listener,
                policy,
                modules,
                active: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Pairs currently being forwarded.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Bind the listener and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let listener = self.inner.listener.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` fires or the
    /// listener is gone, then close every active pair.
    pub async fn serve(
        &self,
        mut listener: Box<dyn Listener>,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        info!(
            listener = %self.inner.listener.describe(),
            addr = ?listener.local_addr(),
            "relay listening"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("relay shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(incoming) => self.dispatch(incoming, &shutdown),
                    Err(e) if e.is_stream_closed() => {
                        info!("listener closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        interpose_metrics::record_error(e.error_type());
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        drop(listener);
        self.close_all().await;
        Ok(())
    }

    fn dispatch(&self, incoming: Incoming, shutdown: &CancellationToken) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        interpose_metrics::record_connection_accepted();
        let span = info_span!("conn", id, peer = %incoming.label);
        let inner = self.inner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(&inner, id, incoming, &shutdown).await {
                    warn!(error = %e, "connection failed");
                    interpose_metrics::record_error(e.error_type());
                }
            }
            .instrument(span),
        );
    }

    /// Close every active pair and wait for them to finish.
    pub async fn close_all(&self) {
        let forwarders: Vec<Forwarder> = self.inner.active.lock().values().cloned().collect();
        if forwarders.is_empty() {
            return;
        }
        debug!(count = forwarders.len(), "closing active pairs");
        let mut closing = JoinSet::new();
        for forwarder in forwarders {
            closing.spawn(async move { forwarder.close().await });
        }
        while closing.join_next().await.is_some() {}
    }
}

async fn handle_connection(
    inner: &Inner,
    id: u64,
    incoming: Incoming,
    shutdown: &CancellationToken,
) -> Result<(), RelayError> {
    let Incoming {
        peer, handshake, ..
    } = incoming;

    let accepted = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Ok(()),
        accepted = handshake => accepted,
    };
    let Accepted {
        endpoint: client,
        destination,
    } = accepted.inspect_err(|_| {
        interpose_metrics::record_handshake_failure(inner.listener.kind());
    })?;
    debug!(client = %client.name(), ?destination, "connection accepted");

    let conn = ConnectionInfo {
        id,
        peer,
        destination,
    };
    let template = match inner.policy.peer_template(&conn) {
        Ok(template) => template,
        Err(e) => {
            client.close().await;
            return Err(e.into());
        }
    };

    let server = Endpoint::from_template(template);
    let opened = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            client.close().await;
            return Ok(());
        }
        opened = server.init() => opened,
    };
    if let Err(e) = opened {
        client.close().await;
        return Err(e.into());
    }

    let chain = match inner.modules.build(&PairInfo::new(id, client.name(), server.name())) {
        Ok(chain) => chain,
        Err(e) => {
            client.close().await;
            server.close().await;
            return Err(e.into());
        }
    };
    info!(client = %client.name(), server = %server.name(), "pair started");

    let forwarder = {
        let mut active = inner.active.lock();
        let registry = inner.active.clone();
        let forwarder = Forwarder::start(id, client, server, chain, move |summary| {
            registry.lock().remove(&summary.id);
            info!(
                a_to_b = summary.a_to_b.bytes,
                b_to_a = summary.b_to_a.bytes,
                duration_ms = summary.duration.as_millis() as u64,
                "pair finished"
            );
        });
        active.insert(id, forwarder.clone());
        forwarder
    };

    // Shutdown may have swept the map before this pair was added.
    if shutdown.is_cancelled() {
        forwarder.close().await;
    }
    Ok(())
}
