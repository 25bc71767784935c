//! Classic capture file format.
//!
//! Global header followed by one record per unit. Each record carries a
//! synthetic 14-byte Ethernet header (zero MACs, IPv4 ethertype) in front of
//! the payload so capture viewers accept the file. All header fields are
//! written little-endian; readers detect the order from the magic number.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_SNAPLEN: u32 = 0xffff;
pub const LINKTYPE_ETHERNET: u32 = 1;
pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// Zero source/destination MACs and ethertype 0x0800.
pub const SYNTHETIC_LINK_HEADER: [u8; 14] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x08, 0x00];

pub fn global_header() -> [u8; GLOBAL_HEADER_LEN] {
    let mut buf = BytesMut::with_capacity(GLOBAL_HEADER_LEN);
    buf.put_u32_le(PCAP_MAGIC);
    buf.put_u16_le(PCAP_VERSION_MAJOR);
    buf.put_u16_le(PCAP_VERSION_MINOR);
    buf.put_i32_le(0); // thiszone
    buf.put_u32_le(0); // sigfigs
    buf.put_u32_le(PCAP_SNAPLEN);
    buf.put_u32_le(LINKTYPE_ETHERNET);
    let mut out = [0u8; GLOBAL_HEADER_LEN];
    out.copy_from_slice(&buf);
    out
}

/// Serialize one record: header, synthetic link prefix, payload.
///
/// Payloads beyond the snap length are truncated in the file while the
/// original length field keeps the real size.
pub fn record(timestamp: SystemTime, payload: &[u8]) -> BytesMut {
    let since = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    let orig_len = SYNTHETIC_LINK_HEADER.len() + payload.len();
    let incl_len = orig_len.min(PCAP_SNAPLEN as usize);
    let body = &payload[..incl_len - SYNTHETIC_LINK_HEADER.len()];

    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + incl_len);
    buf.put_u32_le(since.as_secs() as u32);
    buf.put_u32_le(since.subsec_micros());
    buf.put_u32_le(incl_len as u32);
    buf.put_u32_le(orig_len as u32);
    buf.put_slice(&SYNTHETIC_LINK_HEADER);
    buf.put_slice(body);
    buf
}

/// Appends records to any writer.
#[derive(Debug)]
pub struct PcapWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> PcapWriter<W> {
    /// Wrap `inner`, writing the global header first unless `resume` is set
    /// (appending to a file that already has one).
    pub fn new(mut inner: W, resume: bool) -> io::Result<Self> {
        if !resume {
            inner.write_all(&global_header())?;
        }
        Ok(Self { inner, records: 0 })
    }

    pub fn write_record(&mut self, timestamp: SystemTime, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(&record(timestamp, payload))?;
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
