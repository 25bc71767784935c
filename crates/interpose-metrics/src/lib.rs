//! Metrics for relays and proxies, with an optional Prometheus exporter.
//!
//! Recording functions go through the `metrics` facade and are no-ops until
//! a recorder is installed, so library users pay nothing unless they call
//! [`init_prometheus`].

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter HTTP listener on `listen`.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Connections accepted by listening endpoints.
pub const CONNECTIONS_TOTAL: &str = "interpose_connections_total";
/// Endpoint pairs currently being forwarded.
pub const PAIRS_ACTIVE: &str = "interpose_pairs_active";
/// Pair lifetime histogram (seconds).
pub const PAIR_DURATION_SECONDS: &str = "interpose_pair_duration_seconds";
/// Frames written to the peer, by direction.
pub const FRAMES_FORWARDED_TOTAL: &str = "interpose_frames_forwarded_total";
/// Payload bytes written to the peer, by direction.
pub const BYTES_FORWARDED_TOTAL: &str = "interpose_bytes_forwarded_total";
/// Frames dropped by the module chain, by direction.
pub const FRAMES_DROPPED_TOTAL: &str = "interpose_frames_dropped_total";
/// Failed TLS/SSH/proxy handshakes, by kind.
pub const HANDSHAKE_FAILURES_TOTAL: &str = "interpose_handshake_failures_total";
/// Certificates minted for intercepted hosts.
pub const CERTS_MINTED_TOTAL: &str = "interpose_certs_minted_total";
/// Errors by type.
pub const ERRORS_TOTAL: &str = "interpose_errors_total";

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a connection accepted by a listener.
#[inline]
pub fn record_connection_accepted() {
    counter!(CONNECTIONS_TOTAL).increment(1);
}

/// Record a pair starting to forward.
#[inline]
pub fn record_pair_started() {
    gauge!(PAIRS_ACTIVE).increment(1.0);
}

/// Record a pair whose pumps have all exited.
#[inline]
pub fn record_pair_finished(duration_secs: f64) {
    gauge!(PAIRS_ACTIVE).decrement(1.0);
    histogram!(PAIR_DURATION_SECONDS).record(duration_secs);
}

/// Record one frame written to the peer (direction: "a_to_b" or "b_to_a").
#[inline]
pub fn record_frame_forwarded(direction: &'static str, bytes: u64) {
    counter!(FRAMES_FORWARDED_TOTAL, "direction" => direction).increment(1);
    counter!(BYTES_FORWARDED_TOTAL, "direction" => direction).increment(bytes);
}

/// Record a frame suppressed by a module.
#[inline]
pub fn record_frame_dropped(direction: &'static str) {
    counter!(FRAMES_DROPPED_TOTAL, "direction" => direction).increment(1);
}

/// Record a failed handshake (kind: "tls", "ssh", "socks", "connect").
#[inline]
pub fn record_handshake_failure(kind: &'static str) {
    counter!(HANDSHAKE_FAILURES_TOTAL, "kind" => kind).increment(1);
}

/// Record a freshly minted interception certificate.
#[inline]
pub fn record_cert_minted() {
    counter!(CERTS_MINTED_TOTAL).increment(1);
}

/// Record an error by type.
#[inline]
pub fn record_error(error_type: &'static str) {
    counter!(ERRORS_TOTAL, "type" => error_type).increment(1);
}

// ============================================================================
// Error Type Constants (re-exported from interpose-core)
// ============================================================================

pub use interpose_core::{
    ERROR_BIND, ERROR_CERT, ERROR_CONFIG, ERROR_CONNECT, ERROR_IO, ERROR_MODULE, ERROR_PROTOCOL,
    ERROR_RESOLVE, ERROR_SSH_HANDSHAKE, ERROR_STREAM_CLOSED, ERROR_TIMEOUT, ERROR_TLS_HANDSHAKE,
};
