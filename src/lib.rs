//! # interpose
//!
//! Byte-stream interception: relay two endpoints, or run a proxy that pairs
//! every accepted client with a server-side endpoint, while a chain of
//! modules observes and rewrites the frames in between.
//!
//! ## Crates
//!
//! - [`interpose_core`] - Defaults, registries and shared types
//! - [`interpose_proto`] - Framing codecs and handshake wire formats
//! - [`interpose_endpoint`] - Endpoints, templates and listeners
//! - [`interpose_module`] - The module pipeline
//! - [`interpose_relay`] - Forwarder, relay and multi-client relay
//! - [`interpose_proxy`] - Layer-4, TLS, HTTPS and SSH proxies
//! - [`interpose_cert`] - Interception CA and certificate minting
//! - [`interpose_net`] - Packet filters and host network configuration
//! - [`interpose_config`] - Configuration loading and validation
//! - [`interpose_metrics`] - Prometheus-compatible metrics

pub mod cli;
pub mod session;

pub use interpose_cert as cert;
pub use interpose_config as config;
pub use interpose_core as core;
pub use interpose_endpoint as endpoint;
pub use interpose_metrics as metrics;
pub use interpose_module as module;
pub use interpose_net as net;
pub use interpose_proto as proto;
pub use interpose_proxy as proxy;
pub use interpose_relay as relay;

pub use session::{Session, SessionError, build_session};
