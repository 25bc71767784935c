//! Operating-system plumbing around the relay engine.
//!
//! - [`bpf`]: classic packet-filter assembler and the host/port exclusion filter
//! - [`configurator`]: ordered setup/teardown command groups
//! - [`tproxy`]: transparent-proxy and bridge command sets
//! - [`transparent`]: `IP_TRANSPARENT` and original-destination lookups

pub mod bpf;
pub mod configurator;
pub mod error;
pub mod tproxy;
pub mod transparent;

pub use bpf::{Assembler, Program, SockFilter, compile};
pub use configurator::{CommandRunner, Configurator, ShellRunner, Step};
pub use error::NetError;
pub use tproxy::{BridgeOptions, Protocol, TproxyOptions, bridge_configurator, tproxy_configurator};
pub use transparent::{DatagramOrigin, DestinationLookup, SocketOptionLookup};
