//! Per-pair data transforms for interpose.
//!
//! A [`ModuleFactory`] is built once from configuration and creates one
//! [`Module`] per endpoint pair. The modules of a pair form a
//! [`ModuleChain`] that every unit passes through, in order, in both
//! directions. A module may rewrite a unit or drop it.
//!
//! Built-in modules:
//! - `corrupt`: random byte or bit corruption
//! - `logger`: hex dump to the console and JSON Lines to a file
//! - `pcap`: capture to a pcap file

pub mod corrupt;
pub mod error;
pub mod logger;
pub mod module;
pub mod pcap;
pub mod registry;

pub use corrupt::{CorruptFactory, CorruptMode, CorruptOptions, DirectionFilter};
pub use error::ModuleError;
pub use logger::{LoggerFactory, LoggerOptions, SharedWriter, hexdump};
pub use module::{ChainFactory, Direction, Module, ModuleChain, ModuleFactory, PairInfo};
pub use pcap::{PcapFactory, PcapOptions};
pub use registry::{ModuleConstructor, build_chain, build_module, modules};
