//! Forwarding engines for interpose.
//!
//! - [`Forwarder`]: pumps one endpoint pair through its module chain, one
//!   task per legal direction, with cascading close
//! - [`Relay`]: a single pair, run until either side ends
//! - [`MultiClientRelay`]: a listener that spawns one pair per accepted
//!   connection, choosing each peer through a [`PeerPolicy`]

pub mod error;
pub mod forwarder;
pub mod multi;
pub mod policy;
pub mod relay;

pub use error::RelayError;
pub use forwarder::{DirectionStats, Forwarder, PairSummary};
pub use multi::MultiClientRelay;
pub use policy::{ConnectionInfo, FixedPeer, PeerPolicy, RequestedPeer};
pub use relay::Relay;
