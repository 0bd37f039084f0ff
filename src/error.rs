//! This module contain the error from the vsock transport.

use core::result;
use thiserror::Error;

/// The error type of the vsock transport.
#[derive(Copy, Clone, Debug, Eq, Error, PartialEq)]
pub enum SocketError {
    /// The peer reset the connection (`ECONNRESET`).
    #[error("Connection reset by peer")]
    ConnectionReset,
    /// The peer sent a packet which is not valid in the current state (`EPROTO`).
    #[error("Protocol error")]
    ProtocolError,
    /// A packet buffer could not be allocated (`ENOMEM`).
    #[error("Out of memory")]
    OutOfMemory,
    /// The socket is not connected.
    #[error("The socket is not connected")]
    NotConnected,
    /// There is already a socket bound to the given address.
    #[error("There is already a socket bound to the given address")]
    AddressInUse,
    /// The peer or the local side has shut down the direction being used.
    #[error("The socket has been shut down")]
    PeerSocketShutdown,
    /// The operation is not supported by this transport (`EOPNOTSUPP`).
    #[error("Operation not supported")]
    Unsupported,
    /// The given buffer is shorter than expected.
    #[error("The given buffer is shorter than expected")]
    BufferTooShort,
    /// Unknown operation.
    #[error("The operation code '{0}' is unknown")]
    UnknownOperation(u16),
    /// Waiting for the peer timed out.
    #[error("Timed out waiting for the peer")]
    TimedOut,
    /// The packet transport could not take the packet.
    #[error("The packet transport failed to send the packet")]
    TransmitFailed,
}

/// The type returned by transport methods.
pub type Result<T = ()> = result::Result<T, SocketError>;
