//! A listening proxy: network setup around a multi-client relay.

use std::sync::Arc;

use interpose_endpoint::{Listener, ListenerTemplate};
use interpose_module::ChainFactory;
use interpose_relay::{MultiClientRelay, PeerPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::network::NetworkSetup;

#[derive(Debug)]
pub struct Proxy {
    kind: &'static str,
    relay: MultiClientRelay,
    listener: Arc<dyn ListenerTemplate>,
    network: NetworkSetup,
}

impl Proxy {
    pub fn new(
        kind: &'static str,
        listener: Arc<dyn ListenerTemplate>,
        policy: Arc<dyn PeerPolicy>,
        modules: ChainFactory,
    ) -> Self {
        Self {
            kind,
            relay: MultiClientRelay::new(listener.clone(), policy, modules),
            listener,
            network: NetworkSetup::new(),
        }
    }

    pub fn with_network(mut self, network: NetworkSetup) -> Self {
        self.network = network;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn relay(&self) -> &MultiClientRelay {
        &self.relay
    }

    pub fn network(&self) -> &NetworkSetup {
        &self.network
    }

    /// Bind the listener without serving yet.
    pub async fn bind(&self) -> Result<Box<dyn Listener>, ProxyError> {
        Ok(self.listener.bind().await?)
    }

    /// Apply the network configuration, serve until `shutdown`, then revert
    /// it. A listener that cannot be bound is fatal.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        self.network.apply().await?;
        let served = match self.listener.bind().await {
            Ok(listener) => self.serve(listener, shutdown).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = self.network.revert().await {
            warn!(proxy = self.kind, error = %e, "network configuration left in place");
        }
        served
    }

    /// Serve on an already-bound listener. Network configuration is the
    /// caller's concern.
    pub async fn serve(
        &self,
        listener: Box<dyn Listener>,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        info!(proxy = self.kind, listener = %self.listener.describe(), "proxy started");
        self.relay.serve(listener, shutdown).await?;
        info!(proxy = self.kind, "proxy stopped");
        Ok(())
    }
}
