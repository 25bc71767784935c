//! Codec configuration and wire parsing errors.

use interpose_core::{OptionsError, UnknownEntry};

/// Errors raised while building a codec from configuration.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported length prefix size {0} (expected 1, 2, 4 or 8)")]
    UnsupportedPrefixSize(usize),
    #[error(transparent)]
    Unknown(#[from] UnknownEntry),
    #[error(transparent)]
    Options(#[from] OptionsError),
}

/// Protocol violations found while parsing handshake messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected protocol version {0:#04x}")]
    BadVersion(u8),
    #[error("socks4 request rejected (code {0:#04x})")]
    Socks4Rejected(u8),
    #[error("socks5 server accepted none of the offered methods")]
    NoAcceptableMethod,
    #[error("socks5 server selected unoffered method {0:#04x}")]
    UnexpectedMethod(u8),
    #[error("socks5 authentication rejected (status {0:#04x})")]
    AuthRejected(u8),
    #[error("socks5 connect rejected (reply {0:#04x})")]
    ConnectRejected(u8),
    #[error("invalid address type {0:#04x}")]
    InvalidAtyp(u8),
    #[error("field longer than 255 bytes")]
    FieldTooLong,
    #[error("field contains a NUL byte")]
    EmbeddedNul,
    #[error("malformed http head")]
    MalformedHttp,
    #[error("expected CONNECT method")]
    NotConnect,
    #[error("http proxy answered with status {0}")]
    BadStatus(u16),
    #[error("http head exceeds size limit")]
    HeadTooLarge,
}
