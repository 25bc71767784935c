//! Stream adapters shared by the handshaking transports.

mod replay;

pub use replay::ReplayStream;
