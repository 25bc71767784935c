//! The codec contract.
//!
//! A codec converts between the byte chunks a transport produces and the
//! discrete frames the module chain sees. Each endpoint owns its own codec
//! instance; the only state a codec may keep is its reassembly remainder.

use std::fmt;

use bytes::Bytes;

use crate::length::{LengthFormat, LengthPrefixed};

/// Bidirectional framer/deframer for one stream.
pub trait Codec: Send + fmt::Debug {
    /// Turn one frame into the wire chunks that carry it.
    fn encode(&mut self, frame: Bytes) -> Vec<Bytes>;

    /// Feed one received chunk; returns every frame completed by it.
    fn decode(&mut self, chunk: Bytes) -> Vec<Bytes>;

    /// Bytes held back waiting for the rest of a frame.
    fn buffered(&self) -> usize {
        0
    }
}

/// No framing: each received chunk is one frame and frames go out as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Codec for Passthrough {
    fn encode(&mut self, frame: Bytes) -> Vec<Bytes> {
        vec![frame]
    }

    fn decode(&mut self, chunk: Bytes) -> Vec<Bytes> {
        if chunk.is_empty() {
            Vec::new()
        } else {
            vec![chunk]
        }
    }
}

/// Immutable codec configuration carried by endpoint templates.
///
/// Every endpoint built from a template gets a fresh codec with an empty
/// remainder via [`CodecSpec::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecSpec {
    #[default]
    Passthrough,
    Length(LengthFormat),
}

impl CodecSpec {
    pub fn build(&self) -> Box<dyn Codec> {
        match self {
            CodecSpec::Passthrough => Box::new(Passthrough),
            CodecSpec::Length(format) => Box::new(LengthPrefixed::new(*format)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecSpec::Passthrough => "passthrough",
            CodecSpec::Length(_) => "length",
        }
    }
}
