//! The virtio-vsock packet header and its fields, as laid out in section 5.10 of virtio 1.1.

// `enumn::N` derives an undocumented `pub fn n` constructor, which `missing_docs` would reject.
#![allow(missing_docs)]

use super::error::{self, SocketError};
use bitflags::bitflags;
use core::fmt::{self, Display, Formatter};
use enumn::N;
use zerocopy::{
    byteorder::{LittleEndian, U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Well-known CID for the host.
pub const VMADDR_CID_HOST: u64 = 2;

/// Wildcard CID a socket can be bound to in order to accept packets for any local CID.
pub const VMADDR_CID_ANY: u64 = 0xFFFF_FFFF;

/// The socket type carried in every header. Only streams are handled by this crate.
#[derive(Copy, Clone, Debug, Eq, N, PartialEq)]
#[repr(u16)]
pub enum SocketType {
    /// Stream sockets provide in-order, guaranteed, connection-oriented delivery without message
    /// boundaries.
    Stream = 1,
    /// seqpacket socket type introduced in virtio-v1.2.
    SeqPacket = 2,
}

impl From<SocketType> for U16<LittleEndian> {
    fn from(socket_type: SocketType) -> Self {
        (socket_type as u16).into()
    }
}

/// The message header for data packets sent on the tx/rx queues
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
pub struct VirtioVsockHdr {
    /// Source context id.
    pub src_cid: U64<LittleEndian>,
    /// Destination context id.
    pub dst_cid: U64<LittleEndian>,
    /// Source port.
    pub src_port: U32<LittleEndian>,
    /// Destination port.
    pub dst_port: U32<LittleEndian>,
    /// Length of the payload following the header.
    pub len: U32<LittleEndian>,
    /// Socket type, see [`SocketType`].
    pub socket_type: U16<LittleEndian>,
    /// Operation, see [`VirtioVsockOp`].
    pub op: U16<LittleEndian>,
    /// Operation specific flags, the shutdown directions for `Shutdown`.
    pub flags: U32<LittleEndian>,
    /// Total receive buffer space for this socket. This includes both free and in-use buffers.
    pub buf_alloc: U32<LittleEndian>,
    /// Free-running bytes received counter.
    pub fwd_cnt: U32<LittleEndian>,
}

impl Default for VirtioVsockHdr {
    fn default() -> Self {
        Self {
            src_cid: 0.into(),
            dst_cid: 0.into(),
            src_port: 0.into(),
            dst_port: 0.into(),
            len: 0.into(),
            socket_type: SocketType::Stream.into(),
            op: 0.into(),
            flags: 0.into(),
            buf_alloc: 0.into(),
            fwd_cnt: 0.into(),
        }
    }
}

impl VirtioVsockHdr {
    /// Returns the length of the data.
    pub fn len(&self) -> u32 {
        self.len.get()
    }

    /// Returns the decoded operation, or an error carrying the raw value if it is not one we know.
    pub fn op(&self) -> error::Result<VirtioVsockOp> {
        let op = self.op.get();
        VirtioVsockOp::n(op).ok_or(SocketError::UnknownOperation(op))
    }

    /// Returns whether the header carries the given operation.
    pub fn is_op(&self, op: VirtioVsockOp) -> bool {
        self.op.get() == op as u16
    }

    /// Returns whether this packet belongs to a stream socket.
    pub fn is_stream(&self) -> bool {
        self.socket_type.get() == SocketType::Stream as u16
    }

    /// Returns the shutdown directions carried in the flags field. Unknown bits are dropped.
    pub fn shutdown_flags(&self) -> StreamShutdown {
        StreamShutdown::from_bits_truncate(self.flags.get())
    }

    /// The address the packet was sent from.
    pub fn source(&self) -> VsockAddr {
        VsockAddr {
            cid: self.src_cid.get(),
            port: self.src_port.get(),
        }
    }

    /// The address the packet is sent to.
    pub fn destination(&self) -> VsockAddr {
        VsockAddr {
            cid: self.dst_cid.get(),
            port: self.dst_port.get(),
        }
    }
}

/// Socket address.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VsockAddr {
    /// Context Identifier.
    pub cid: u64,
    /// Port number.
    pub port: u32,
}

impl VsockAddr {
    /// Creates a new address from its parts.
    pub const fn new(cid: u64, port: u32) -> Self {
        Self { cid, port }
    }
}

impl Display for VsockAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.cid, self.port)
    }
}

/// Operations of the virtio vsock protocol.
#[derive(Copy, Clone, Debug, Eq, N, PartialEq)]
#[repr(u16)]
pub enum VirtioVsockOp {
    /// Not a valid operation.
    Invalid = 0,

    /* Connect operations */
    /// Request to open a connection.
    Request = 1,
    /// Accept a connection request.
    Response = 2,
    /// Abort or refuse a connection.
    Rst = 3,
    /// Shut down one or both directions of a connection.
    Shutdown = 4,

    /* To send payload */
    /// Payload.
    Rw = 5,

    /* Tell the peer our credit info */
    /// Advertise our buffer space and forward count.
    CreditUpdate = 6,
    /* Request the peer to send the credit info to us */
    /// Ask the peer for a credit update.
    CreditRequest = 7,
}

impl From<VirtioVsockOp> for U16<LittleEndian> {
    fn from(op: VirtioVsockOp) -> Self {
        (op as u16).into()
    }
}

bitflags! {
    /// Directions of a stream which have been shut down.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct StreamShutdown: u32 {
        /// The sender will not receive any more data.
        const RECEIVE = 1 << 0;
        /// The sender will not send any more data.
        const SEND = 1 << 1;
    }
}

impl From<StreamShutdown> for U32<LittleEndian> {
    fn from(flags: StreamShutdown) -> Self {
        flags.bits().into()
    }
}
