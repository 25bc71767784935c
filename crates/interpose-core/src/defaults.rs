//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// I/O Defaults
// ============================================================================

/// Bytes requested from a stream transport per read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// Largest datagram a UDP transport will receive.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65535;
/// Maximum bytes of an HTTP CONNECT request/response head.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8192;

// ============================================================================
// Framing Defaults
// ============================================================================

/// Width of the length prefix in bytes.
pub const DEFAULT_LENGTH_PREFIX_SIZE: usize = 2;

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Default outbound connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default TLS/SOCKS/CONNECT handshake timeout in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Time granted to active pairs to wind down after a stop request.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Socket Defaults
// ============================================================================

/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;
/// Default TCP_NODELAY.
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Default proxy listen address.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
/// Default proxy listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
/// Default upstream host for proxies without transparent interception.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
/// Default SSH proxy listen port.
pub const DEFAULT_SSH_LISTEN_PORT: u16 = 2222;
/// Default upstream SSH port.
pub const DEFAULT_SSH_SERVER_PORT: u16 = 22;

// ============================================================================
// TLS / Certificate Defaults
// ============================================================================

/// Default minimum TLS version.
pub const DEFAULT_TLS_MIN_VERSION: &str = "tls12";
/// Default maximum TLS version.
pub const DEFAULT_TLS_MAX_VERSION: &str = "tls13";
/// Directory (relative to the home directory) holding CA material.
pub const DEFAULT_CA_DIR: &str = ".interpose";
/// CA certificate file name.
pub const DEFAULT_CA_CERT_FILE: &str = "ca.pem";
/// CA private key file name.
pub const DEFAULT_CA_KEY_FILE: &str = "ca-key.pem";
/// Common name of a bootstrapped CA.
pub const DEFAULT_CA_COMMON_NAME: &str = "interpose CA";
/// Validity of minted certificates, applied both before and after now.
pub const DEFAULT_CERT_VALIDITY_DAYS: i64 = 3650;

// ============================================================================
// Proxy Client Defaults
// ============================================================================

/// User id sent in SOCKS4 connect requests.
pub const DEFAULT_SOCKS4_USER_ID: &str = "interpose";
/// User-Agent sent in HTTP CONNECT requests.
pub const DEFAULT_HTTP_USER_AGENT: &str = concat!("interpose/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Module Defaults
// ============================================================================

/// Fraction of a unit corrupted when neither rate nor count is configured.
pub const DEFAULT_CORRUPT_RATE: f64 = 0.01;
/// Capture file written by the pcap module.
pub const DEFAULT_PCAP_FILE: &str = "out.pcap";
/// Bytes per hexdump line.
pub const DEFAULT_HEXDUMP_WIDTH: usize = 16;

// ============================================================================
// Transparent Interception Defaults
// ============================================================================

/// iptables chain receiving intercepted traffic.
pub const DEFAULT_TPROXY_CHAIN: &str = "INTERCEPT";
/// Firewall mark for intercepted packets.
pub const DEFAULT_TPROXY_MARK: u32 = 64;
/// Policy routing table for marked packets.
pub const DEFAULT_TPROXY_TABLE: u32 = 101;
/// Client-facing interface.
pub const DEFAULT_CLIENT_IFACE: &str = "eth0";
/// Server-facing interface.
pub const DEFAULT_SERVER_IFACE: &str = "eth1";
/// Bridge device created in bridge mode.
pub const DEFAULT_BRIDGE_NAME: &str = "br0";

// ============================================================================
// Logging Defaults
// ============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";
