//! Length-prefixed framing.
//!
//! Wire layout: `[N-byte length][payload]`, N ∈ {1, 2, 4, 8}, big- or
//! little-endian. Reassembly is the pure function [`reassemble`]; the
//! [`LengthPrefixed`] codec only stores the remainder it returns.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::codec::Codec;
use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    #[serde(alias = "be")]
    Big,
    #[serde(alias = "le")]
    Little,
}

/// Prefix width, byte order and orientation of a length codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthFormat {
    prefix_size: usize,
    order: ByteOrder,
    reverse: bool,
}

impl Default for LengthFormat {
    fn default() -> Self {
        Self {
            prefix_size: interpose_core::DEFAULT_LENGTH_PREFIX_SIZE,
            order: ByteOrder::Big,
            reverse: false,
        }
    }
}

impl LengthFormat {
    pub fn new(prefix_size: usize, order: ByteOrder) -> Result<Self, CodecError> {
        if !matches!(prefix_size, 1 | 2 | 4 | 8) {
            return Err(CodecError::UnsupportedPrefixSize(prefix_size));
        }
        Ok(Self {
            prefix_size,
            order,
            reverse: false,
        })
    }

    /// Swap directions: frames are added on decode and stripped on encode.
    ///
    /// Used when the framed peer is the one this endpoint writes to.
    pub fn reversed(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    pub fn prefix_size(&self) -> usize {
        self.prefix_size
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

    /// Largest payload a single frame can declare.
    pub fn max_payload(&self) -> u64 {
        if self.prefix_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.prefix_size * 8)) - 1
        }
    }

    fn read_len(&self, prefix: &[u8]) -> u64 {
        match self.order {
            ByteOrder::Big => prefix.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            ByteOrder::Little => prefix
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        }
    }

    fn put_len(&self, len: u64, out: &mut BytesMut) {
        match self.order {
            ByteOrder::Big => out.put_slice(&len.to_be_bytes()[8 - self.prefix_size..]),
            ByteOrder::Little => out.put_slice(&len.to_le_bytes()[..self.prefix_size]),
        }
    }

    /// Encode `payload` as one frame, or several if it exceeds [`max_payload`](Self::max_payload).
    pub fn frame(&self, payload: &[u8]) -> Vec<Bytes> {
        if payload.is_empty() {
            let mut out = BytesMut::with_capacity(self.prefix_size);
            self.put_len(0, &mut out);
            return vec![out.freeze()];
        }
        let max = usize::try_from(self.max_payload()).unwrap_or(usize::MAX);
        payload
            .chunks(max)
            .map(|part| {
                let mut out = BytesMut::with_capacity(self.prefix_size + part.len());
                self.put_len(part.len() as u64, &mut out);
                out.put_slice(part);
                out.freeze()
            })
            .collect()
    }
}

/// Result of one reassembly step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reassembly {
    /// Bytes of the trailing incomplete frame, possibly empty.
    pub remainder: Bytes,
    /// Complete payloads in stream order.
    pub frames: Vec<Bytes>,
}

/// Parse every complete frame out of `remainder + chunk`.
///
/// Deterministic in its two inputs. At most one incomplete frame is left in
/// the returned remainder. Frames and remainder share the input buffers when
/// either input is empty; otherwise both are copied once, so a frame spread
/// over many chunks is copied once per chunk until it completes.
pub fn reassemble(format: &LengthFormat, remainder: Bytes, chunk: Bytes) -> Reassembly {
    let mut buf = if remainder.is_empty() {
        chunk
    } else if chunk.is_empty() {
        remainder
    } else {
        let mut joined = BytesMut::with_capacity(remainder.len() + chunk.len());
        joined.put_slice(&remainder);
        joined.put_slice(&chunk);
        joined.freeze()
    };

    let n = format.prefix_size;
    let mut frames = Vec::new();
    while buf.len() >= n {
        let declared = format.read_len(&buf[..n]);
        let available = (buf.len() - n) as u64;
        if declared > available {
            break;
        }
        let end = n + declared as usize;
        frames.push(buf.slice(n..end));
        buf = buf.slice(end..);
    }
    Reassembly {
        remainder: buf,
        frames,
    }
}

/// Stateful length codec: a [`LengthFormat`] plus the remainders it carries.
#[derive(Debug, Clone)]
pub struct LengthPrefixed {
    format: LengthFormat,
    inbound: Bytes,
    outbound: Bytes,
}

impl LengthPrefixed {
    pub fn new(format: LengthFormat) -> Self {
        Self {
            format,
            inbound: Bytes::new(),
            outbound: Bytes::new(),
        }
    }

    pub fn format(&self) -> &LengthFormat {
        &self.format
    }
}

impl Codec for LengthPrefixed {
    fn encode(&mut self, frame: Bytes) -> Vec<Bytes> {
        if self.format.reverse {
            let step = reassemble(&self.format, std::mem::take(&mut self.outbound), frame);
            self.outbound = step.remainder;
            step.frames
        } else {
            self.format.frame(&frame)
        }
    }

    fn decode(&mut self, chunk: Bytes) -> Vec<Bytes> {
        if self.format.reverse {
            if chunk.is_empty() {
                return Vec::new();
            }
            self.format.frame(&chunk)
        } else {
            let step = reassemble(&self.format, std::mem::take(&mut self.inbound), chunk);
            self.inbound = step.remainder;
            step.frames
        }
    }

    fn buffered(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }
}
