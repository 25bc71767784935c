//! Core types and constants shared across interpose crates.
//!
//! This crate provides:
//! - Default configuration values
//! - Error type constants for metrics/logging
//! - [`Destination`], the host/port pair every connector and listener speaks
//! - [`Registry`], the static name → constructor table used for endpoints,
//!   codecs, modules and proxies, and the [`Options`] bag its constructors read
//! - Stream adapters shared by the handshaking transports

pub mod defaults;
pub mod destination;
pub mod errors;
pub mod io;
pub mod options;
pub mod registry;

// Re-export commonly used items at crate root
pub use defaults::*;
pub use destination::{Destination, DestinationError};
pub use errors::*;
pub use options::{Options, OptionsError, parse_options};
pub use registry::{Registry, RegistryEntry, UnknownEntry};

/// Project name.
pub const PROJECT_NAME: &str = "interpose";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
