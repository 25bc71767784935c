//! Classic BPF assembler.
//!
//! Instructions carry symbolic jump targets which are resolved to relative
//! offsets when the program is assembled. [`compile`] produces the socket
//! filter used by raw-socket interception to ignore the proxy's own traffic:
//! IPv4 packets exchanged with `host` on `port` are rejected, everything else
//! (ARP, other hosts, other ports, fragments) is accepted.

use std::net::Ipv4Addr;

use crate::error::NetError;

// ============================================================================
// Opcodes
// ============================================================================

/// `BPF_LD | BPF_W | BPF_ABS`
pub const LD: u16 = 0x20;
/// `BPF_LD | BPF_H | BPF_ABS`
pub const LDH: u16 = 0x28;
/// `BPF_LD | BPF_B | BPF_ABS`
pub const LDB: u16 = 0x30;
/// `BPF_LD | BPF_H | BPF_IND`
pub const LDH_X: u16 = 0x48;
/// `BPF_LDX | BPF_B | BPF_MSH`
pub const LDXB_MSH: u16 = 0xb1;
/// `BPF_JMP | BPF_JEQ | BPF_K`
pub const JEQ: u16 = 0x15;
/// `BPF_JMP | BPF_JSET | BPF_K`
pub const JSET: u16 = 0x45;
/// `BPF_RET | BPF_K`
pub const RET: u16 = 0x06;

const ETHERTYPE_OFFSET: u32 = 0x0c;
const ETHERTYPE_IPV4: u32 = 0x0800;
const IP_FLAGS_OFFSET: u32 = 0x14;
const IP_FRAGMENT_MASK: u32 = 0x1fff;
const IP_SRC_OFFSET: u32 = 0x1a;
const IP_DST_OFFSET: u32 = 0x1e;
const IP_HEADER_OFFSET: u32 = 0x0e;
const L4_SRC_PORT_OFFSET: u32 = 0x0e;
const L4_DST_PORT_OFFSET: u32 = 0x10;

const REJECT: &str = "reject";
const ALLOW: &str = "allow";
const RESPONSE: &str = "response";

/// One encoded instruction, laid out like the kernel's `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    /// Native-endian encoding: `u16 code, u8 jt, u8 jf, u32 k`.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..2].copy_from_slice(&self.code.to_ne_bytes());
        out[2] = self.jt;
        out[3] = self.jf;
        out[4..].copy_from_slice(&self.k.to_ne_bytes());
        out
    }
}

#[derive(Debug, Clone)]
struct Pending {
    code: u16,
    k: u32,
    on_true: Option<String>,
    on_false: Option<String>,
}

/// Label-aware instruction buffer.
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    insns: Vec<Pending>,
    labels: Vec<(String, usize)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `name` to the next instruction pushed.
    pub fn label(&mut self, name: impl Into<String>) -> &mut Self {
        self.labels.push((name.into(), self.insns.len()));
        self
    }

    /// Non-jump instruction.
    pub fn op(&mut self, code: u16, k: u32) -> &mut Self {
        self.jump(code, k, None, None)
    }

    /// Conditional jump; `None` falls through to the next instruction.
    pub fn jump(
        &mut self,
        code: u16,
        k: u32,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> &mut Self {
        self.insns.push(Pending {
            code,
            k,
            on_true: on_true.map(str::to_string),
            on_false: on_false.map(str::to_string),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Resolve labels into relative jump offsets (`label_pos - pos - 1`).
    ///
    /// Classic BPF only jumps forward by at most 255 instructions; anything
    /// else is rejected rather than silently truncated.
    pub fn assemble(&self) -> Result<Program, NetError> {
        let filters = self
            .insns
            .iter()
            .enumerate()
            .map(|(pos, insn)| {
                Ok(SockFilter {
                    code: insn.code,
                    jt: self.offset(pos, insn.on_true.as_deref())?,
                    jf: self.offset(pos, insn.on_false.as_deref())?,
                    k: insn.k,
                })
            })
            .collect::<Result<Vec<_>, NetError>>()?;
        Ok(Program { filters })
    }

    fn offset(&self, pos: usize, label: Option<&str>) -> Result<u8, NetError> {
        let Some(label) = label else {
            return Ok(0);
        };
        let target = self
            .labels
            .iter()
            .rev()
            .find(|(name, _)| name == label)
            .map(|(_, at)| *at)
            .ok_or_else(|| NetError::UnknownLabel(label.to_string()))?;
        let distance = target as i64 - pos as i64 - 1;
        u8::try_from(distance).map_err(|_| NetError::JumpOutOfRange {
            label: label.to_string(),
            from: pos,
            distance,
        })
    }

    // ------------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------------

    fn is_ipv4(&mut self, on_true: Option<&str>, on_false: Option<&str>) -> &mut Self {
        self.op(LDH, ETHERTYPE_OFFSET)
            .jump(JEQ, ETHERTYPE_IPV4, on_true, on_false)
    }

    fn is_host(
        &mut self,
        offset: u32,
        host: Ipv4Addr,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> &mut Self {
        self.op(LD, offset)
            .jump(JEQ, u32::from(host), on_true, on_false)
    }

    fn is_fragmented(&mut self, on_true: Option<&str>, on_false: Option<&str>) -> &mut Self {
        self.op(LDH, IP_FLAGS_OFFSET)
            .jump(JSET, IP_FRAGMENT_MASK, on_true, on_false)
    }

    fn is_port(
        &mut self,
        offset: u32,
        port: u16,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> &mut Self {
        self.op(LDXB_MSH, IP_HEADER_OFFSET)
            .op(LDH_X, offset)
            .jump(JEQ, u32::from(port), on_true, on_false)
    }
}

/// An assembled filter program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    filters: Vec<SockFilter>,
}

impl Program {
    pub fn filters(&self) -> &[SockFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Concatenated native-endian instruction bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.filters.iter().flat_map(|f| f.to_bytes()).collect()
    }

    /// Attach the program to a socket with `SO_ATTACH_FILTER`.
    #[cfg(target_os = "linux")]
    pub fn attach(&self, fd: std::os::fd::BorrowedFd<'_>) -> Result<(), NetError> {
        use std::os::fd::AsRawFd;

        let mut raw: Vec<libc::sock_filter> = self
            .filters
            .iter()
            .map(|f| libc::sock_filter {
                code: f.code,
                jt: f.jt,
                jf: f.jf,
                k: f.k,
            })
            .collect();
        let len = u16::try_from(raw.len()).map_err(|_| NetError::JumpOutOfRange {
            label: "program length".to_string(),
            from: raw.len(),
            distance: raw.len() as i64,
        })?;
        let prog = libc::sock_fprog {
            len,
            filter: raw.as_mut_ptr(),
        };
        // SAFETY: `prog` points at `raw`, which outlives the call; the kernel
        // copies the program before returning.
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                (&prog as *const libc::sock_fprog).cast(),
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn attach(&self, _fd: std::os::fd::BorrowedFd<'_>) -> Result<(), NetError> {
        Err(NetError::Unsupported("SO_ATTACH_FILTER"))
    }
}

/// Build the filter that hides traffic between us and `host:port`.
///
/// Non-IPv4 frames and fragments pass. For packets from `host` the source
/// side is checked against `port`; for packets to `host` the destination
/// side is. A port match rejects the packet.
pub fn compile(host: Ipv4Addr, port: u16) -> Result<Program, NetError> {
    let mut asm = Assembler::new();
    asm.is_ipv4(None, Some(ALLOW))
        .is_host(IP_SRC_OFFSET, host, None, Some(RESPONSE))
        .is_fragmented(Some(ALLOW), None)
        .is_port(L4_DST_PORT_OFFSET, port, Some(REJECT), Some(ALLOW))
        .label(RESPONSE)
        .is_host(IP_DST_OFFSET, host, None, Some(ALLOW))
        .is_fragmented(Some(ALLOW), None)
        .is_port(L4_SRC_PORT_OFFSET, port, Some(REJECT), Some(ALLOW))
        .label(REJECT)
        .op(RET, 0)
        .label(ALLOW)
        .op(RET, u32::MAX);
    asm.assemble()
}
