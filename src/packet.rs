//! Owned vsock packets: a header plus an optional payload buffer.

use crate::error::{Result, SocketError};
use crate::protocol::{StreamShutdown, VirtioVsockHdr, VirtioVsockOp, VsockAddr};
use alloc::vec::Vec;
use core::mem::size_of;
use log::trace;
use zerocopy::{FromBytes, IntoBytes};

/// Fields of a packet which are not derived from the socket it is sent on.
#[derive(Clone, Debug)]
pub struct PacketInfo<'a> {
    /// The operation.
    pub op: VirtioVsockOp,
    /// The raw socket type.
    pub socket_type: u16,
    /// Shutdown directions, only meaningful for `Shutdown`.
    pub flags: StreamShutdown,
    /// The payload to copy into the packet, for `Rw`.
    pub payload: &'a [u8],
    /// Overrides the socket's remote address.
    pub remote: Option<VsockAddr>,
    /// Whether the packet is a reply to a packet from the peer.
    pub reply: bool,
}

impl PacketInfo<'_> {
    /// A stream packet without payload or flags.
    pub fn control(op: VirtioVsockOp) -> Self {
        PacketInfo {
            op,
            socket_type: crate::protocol::SocketType::Stream as u16,
            flags: StreamShutdown::empty(),
            payload: &[],
            remote: None,
            reply: false,
        }
    }
}

/// A packet travelling between the transport and the connection state machine.
///
/// A packet has exactly one owner at a time; dropping it frees the header and payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VsockPacket {
    /// The packet header. `buf_alloc` and `fwd_cnt` are stamped just before sending.
    pub hdr: VirtioVsockHdr,
    buf: Vec<u8>,
    reply: bool,
}

impl VsockPacket {
    /// Builds a packet from `info`, copying the first `len` bytes of `info.payload`.
    ///
    /// Fails with [`SocketError::BufferTooShort`] if `info.payload` holds fewer than `len` bytes,
    /// or with [`SocketError::OutOfMemory`] if the payload buffer cannot be allocated.
    pub fn allocate(info: &PacketInfo, len: u32, src: VsockAddr, dst: VsockAddr) -> Result<Self> {
        let mut buf = Vec::new();
        if len > 0 {
            let len = len as usize;
            let payload = info
                .payload
                .get(..len)
                .ok_or(SocketError::BufferTooShort)?;
            buf.try_reserve_exact(len)
                .map_err(|_| SocketError::OutOfMemory)?;
            buf.extend_from_slice(payload);
        }
        let hdr = VirtioVsockHdr {
            src_cid: src.cid.into(),
            dst_cid: dst.cid.into(),
            src_port: src.port.into(),
            dst_port: dst.port.into(),
            len: len.into(),
            socket_type: info.socket_type.into(),
            op: info.op.into(),
            flags: info.flags.into(),
            ..Default::default()
        };
        trace!(
            "alloc pkt {} -> {} len={} type={} op={:?} flags={:#x}",
            src,
            dst,
            len,
            info.socket_type,
            info.op,
            info.flags.bits()
        );
        Ok(Self {
            hdr,
            buf,
            reply: info.reply,
        })
    }

    /// Builds the RST answering a packet with header `hdr`, or `None` if `hdr` is itself a RST.
    ///
    /// Only header fields are used, so this works whether or not a local socket exists.
    pub fn build_reset(hdr: &VirtioVsockHdr) -> Option<Self> {
        if hdr.is_op(VirtioVsockOp::Rst) {
            return None;
        }
        let reset = VirtioVsockHdr {
            src_cid: hdr.dst_cid,
            dst_cid: hdr.src_cid,
            src_port: hdr.dst_port,
            dst_port: hdr.src_port,
            socket_type: hdr.socket_type,
            op: VirtioVsockOp::Rst.into(),
            ..Default::default()
        };
        Some(Self {
            hdr: reset,
            buf: Vec::new(),
            reply: true,
        })
    }

    /// Parses a packet received from the wire.
    pub fn read_from(buffer: &[u8]) -> Result<Self> {
        let (hdr, rest) =
            VirtioVsockHdr::read_from_prefix(buffer).map_err(|_| SocketError::BufferTooShort)?;
        let payload = rest
            .get(..hdr.len() as usize)
            .ok_or(SocketError::BufferTooShort)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(payload.len())
            .map_err(|_| SocketError::OutOfMemory)?;
        buf.extend_from_slice(payload);
        Ok(Self {
            hdr,
            buf,
            reply: false,
        })
    }

    /// Serialises the header followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(size_of::<VirtioVsockHdr>() + self.buf.len());
        bytes.extend_from_slice(self.hdr.as_bytes());
        bytes.extend_from_slice(&self.buf);
        bytes
    }

    /// The payload.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Whether the packet answers a packet from the peer.
    pub fn is_reply(&self) -> bool {
        self.reply
    }
}
