//! Implementation of `embedded-io` traits for vsock streams.

use crate::connection::{Connection, SocketState};
use crate::error::SocketError;
use crate::hal::PacketTransport;
use crate::protocol::StreamShutdown;
use crate::registry::SocketRegistry;
use crate::vsock::{RecvFlags, VirtioVsock};
use alloc::sync::Arc;
use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};

impl embedded_io::Error for SocketError {
    fn kind(&self) -> ErrorKind {
        match self {
            SocketError::ConnectionReset => ErrorKind::ConnectionReset,
            SocketError::ProtocolError => ErrorKind::InvalidData,
            SocketError::OutOfMemory => ErrorKind::OutOfMemory,
            SocketError::NotConnected => ErrorKind::NotConnected,
            SocketError::AddressInUse => ErrorKind::AddrInUse,
            SocketError::PeerSocketShutdown => ErrorKind::ConnectionAborted,
            SocketError::Unsupported => ErrorKind::Unsupported,
            SocketError::BufferTooShort => ErrorKind::InvalidInput,
            SocketError::TimedOut => ErrorKind::TimedOut,
            SocketError::UnknownOperation(_) | SocketError::TransmitFailed => ErrorKind::Other,
        }
    }
}

/// A blocking byte stream over an established connection.
///
/// Reads wait for data from the peer and writes wait for send credit. Both rely on some other
/// thread delivering the peer's packets.
pub struct VsockStream<T: PacketTransport, R: SocketRegistry> {
    vsock: VirtioVsock<T, R>,
    connection: Arc<Connection>,
}

impl<T: PacketTransport, R: SocketRegistry> VsockStream<T, R> {
    /// Wraps `connection`, which must belong to `vsock`.
    pub fn new(vsock: VirtioVsock<T, R>, connection: Arc<Connection>) -> Self {
        Self { vsock, connection }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl<T: PacketTransport, R: SocketRegistry> ErrorType for VsockStream<T, R> {
    type Error = SocketError;
}

impl<T: PacketTransport, R: SocketRegistry> Write for VsockStream<T, R> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let sent = self.vsock.stream_enqueue(&self.connection, buf)?;
            if sent > 0 {
                return Ok(sent);
            }
            let connection = &self.connection;
            let state = connection.lock_state();
            drop(connection.wait_while(state, None, |state| {
                state.state == SocketState::Connected
                    && !state.peer_shutdown.contains(StreamShutdown::RECEIVE)
                    && !connection.notify_poll_out()
            }));
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        // We don't buffer writes so this is a no-op.
        Ok(())
    }
}

impl<T: PacketTransport, R: SocketRegistry> Read for VsockStream<T, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let read = self
                .vsock
                .stream_dequeue(&self.connection, buf, RecvFlags::empty())?;
            if read > 0 {
                return Ok(read);
            }

            let connection = &self.connection;
            let state = connection.lock_state();
            if let Some(error) = state.error {
                return Err(error);
            }
            let (state, _) = connection.wait_while(state, None, |state| {
                state.state == SocketState::Connected
                    && !state.peer_shutdown.contains(StreamShutdown::SEND)
                    && !connection.notify_poll_in()
            });
            // Nothing more will arrive.
            if !connection.notify_poll_in() {
                return match state.error {
                    Some(error) => Err(error),
                    None => Ok(0),
                };
            }
        }
    }
}

impl<T: PacketTransport, R: SocketRegistry> ReadReady for VsockStream<T, R> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.connection.notify_poll_in())
    }
}
