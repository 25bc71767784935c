//! Framing codecs and wire formats.
//!
//! - [`codec`]: the [`Codec`] contract, the passthrough codec and the
//!   per-endpoint [`CodecSpec`]
//! - [`length`]: length-prefixed framing built on a pure reassembly step
//! - [`socks`]: SOCKS4 / SOCKS5 client handshake messages
//! - [`http`]: HTTP CONNECT request and response heads
//! - [`pcap`]: classic capture file writer
//! - [`registry`]: name → codec constructor table

pub mod codec;
pub mod error;
pub mod http;
pub mod length;
pub mod pcap;
pub mod registry;
pub mod socks;

pub use codec::{Codec, CodecSpec, Passthrough};
pub use error::{CodecError, ParseError};
pub use length::{ByteOrder, LengthFormat, LengthPrefixed, Reassembly, reassemble};
pub use registry::{CodecConstructor, build_codec, codecs};

/// Parse result for incremental parsing.
///
/// - `Complete(T)` - parsing succeeded.
/// - `Incomplete(n)` - `n` is the minimum **total** bytes needed; accumulate and retry.
/// - `Invalid(e)` - protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult<T> {
    Complete(T),
    Incomplete(usize),
    Invalid(ParseError),
}
