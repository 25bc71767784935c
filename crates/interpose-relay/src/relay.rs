//! Single-pair relay.

use interpose_endpoint::Endpoint;
use interpose_module::{ChainFactory, PairInfo};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::RelayError;
use crate::forwarder::{Forwarder, PairSummary};

/// Connects two endpoints and forwards between them until either side ends.
#[derive(Debug)]
pub struct Relay {
    first: Endpoint,
    second: Endpoint,
    modules: ChainFactory,
}

impl Relay {
    pub fn new(first: Endpoint, second: Endpoint, modules: ChainFactory) -> Self {
        Self {
            first,
            second,
            modules,
        }
    }

    /// Initialize both endpoints, forward, and return once the pair has
    /// finished or `shutdown` fires. Failing to open either endpoint is fatal.
    pub async fn run(self, shutdown: CancellationToken) -> Result<PairSummary, RelayError> {
        let Relay {
            first,
            second,
            modules,
        } = self;

        first.init().await?;
        if let Err(e) = second.init().await {
            first.close().await;
            return Err(e.into());
        }
        let chain = match modules.build(&PairInfo::new(0, first.name(), second.name())) {
            Ok(chain) => chain,
            Err(e) => {
                first.close().await;
                second.close().await;
                return Err(e.into());
            }
        };
        info!(first = %first.name(), second = %second.name(), "relay started");

        let forwarder = Forwarder::start(0, first, second, chain, |_| {});
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("relay shutting down");
                forwarder.close().await;
            }
            _ = forwarder.finished() => {}
        }

        let summary = forwarder.summary();
        info!(
            a_to_b = summary.a_to_b.bytes,
            b_to_a = summary.b_to_a.bytes,
            duration_ms = summary.duration.as_millis() as u64,
            "relay finished"
        );
        Ok(summary)
    }
}
