//! Error type constants for metrics and logging.
//!
//! These constants provide consistent error classification across all crates.

/// TLS handshake error.
pub const ERROR_TLS_HANDSHAKE: &str = "tls_handshake";
/// SSH session or channel negotiation error.
pub const ERROR_SSH_HANDSHAKE: &str = "ssh_handshake";
/// Proxy protocol (SOCKS, HTTP CONNECT) negotiation error.
pub const ERROR_PROTOCOL: &str = "protocol";
/// I/O error.
pub const ERROR_IO: &str = "io";
/// DNS/address resolution error.
pub const ERROR_RESOLVE: &str = "resolve";
/// Timeout error.
pub const ERROR_TIMEOUT: &str = "timeout";
/// Outbound connect failure.
pub const ERROR_CONNECT: &str = "connect";
/// Listener bind failure.
pub const ERROR_BIND: &str = "bind";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
/// Certificate minting or loading error.
pub const ERROR_CERT: &str = "cert";
/// Module instantiation or output error.
pub const ERROR_MODULE: &str = "module";
/// Stream ended (normal or abnormal).
pub const ERROR_STREAM_CLOSED: &str = "stream_closed";
