//! The transport core: the send path and the local socket operations.
//!
//! Inbound packets are handled by the [`recv`] module and teardown by the [`close`] module.

mod close;
mod recv;

use crate::config::VsockConfig;
use crate::connection::{Connection, SocketState};
use crate::credit::FlowControl;
use crate::error::{Result, SocketError};
use crate::hal::{PacketTransport, Scheduler};
use crate::listener::Listener;
use crate::packet::{PacketInfo, VsockPacket};
use crate::protocol::{StreamShutdown, VirtioVsockHdr, VirtioVsockOp, VsockAddr};
use crate::registry::{Socket, SocketRegistry};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::time::Duration;
use log::{debug, info, warn};

bitflags! {
    /// Flags for [`VirtioVsock::stream_dequeue`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RecvFlags: u32 {
        /// Copy data without consuming it.
        const PEEK = 0x2;
    }
}

/// The common virtio-vsock transport.
///
/// It sits between a socket layer, represented by a [`SocketRegistry`], and a raw
/// [`PacketTransport`]. Local socket operations are methods on this type; packets from the peer
/// enter through [`deliver_packet`](Self::deliver_packet).
///
/// Cloning is cheap and gives another handle to the same transport.
pub struct VirtioVsock<T: PacketTransport, R: SocketRegistry> {
    transport: Arc<T>,
    registry: Arc<R>,
    scheduler: Arc<dyn Scheduler>,
    config: VsockConfig,
}

impl<T: PacketTransport, R: SocketRegistry> Clone for VirtioVsock<T, R> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            config: self.config,
        }
    }
}

impl<T: PacketTransport, R: SocketRegistry> VirtioVsock<T, R> {
    /// Creates a transport sending packets through `transport` and finding sockets in `registry`.
    pub fn new(
        transport: T,
        registry: R,
        scheduler: Arc<dyn Scheduler>,
        config: VsockConfig,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            registry: Arc::new(registry),
            scheduler,
            config,
        }
    }

    /// The underlying packet transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The socket registry.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// The configuration the transport was created with.
    pub fn config(&self) -> &VsockConfig {
        &self.config
    }

    /// The context id of the local endpoint.
    pub fn local_cid(&self) -> u64 {
        self.transport.local_cid()
    }

    /// Builds a packet for `connection` from `info` and hands it to the transport.
    ///
    /// For `Rw` packets the payload is cut to the largest packet size and then to the available
    /// send credit. If no credit is available nothing is sent and 0 is returned. Credit reserved
    /// for a packet which could not be built or sent is given back.
    ///
    /// Returns the number of payload bytes sent.
    pub fn send_pkt_info(&self, connection: &Connection, info: &PacketInfo) -> Result<u32> {
        let src = VsockAddr::new(self.transport.local_cid(), connection.local().port);
        let dst = info.remote.unwrap_or_else(|| connection.remote());
        let is_rw = info.op == VirtioVsockOp::Rw;

        let requested = u32::try_from(info.payload.len()).unwrap_or(u32::MAX);
        let mut len = requested.min(self.config.max_packet_len);
        if is_rw {
            len = connection.lock_credit().get_credit(len);
            if len == 0 {
                return Ok(0);
            }
        }
        let rollback = |error: SocketError| {
            if is_rw {
                connection.lock_credit().put_credit(len);
            }
            error
        };

        let mut packet = VsockPacket::allocate(info, len, src, dst).map_err(rollback)?;
        connection.lock_credit().stamp(&mut packet.hdr);
        self.transport.send_packet(packet).map_err(|e| {
            warn!("Failed to send {:?} to {}: {}", info.op, dst, e);
            rollback(e)
        })?;
        Ok(len)
    }

    fn send_control(&self, connection: &Connection, info: &PacketInfo) {
        if let Err(e) = self.send_pkt_info(connection, info) {
            debug!("Dropped {:?} for {}: {}", info.op, connection.local(), e);
        }
    }

    /// Tells the peer how much receive buffer space we have.
    pub fn send_credit_update(&self, connection: &Connection) -> Result {
        self.send_pkt_info(connection, &PacketInfo::control(VirtioVsockOp::CreditUpdate))?;
        Ok(())
    }

    /// Asks the peer to tell us how much receive buffer space it has.
    pub fn send_credit_request(&self, connection: &Connection) -> Result {
        self.send_pkt_info(connection, &PacketInfo::control(VirtioVsockOp::CreditRequest))?;
        Ok(())
    }

    /// Sends a RST for `connection`, unless `reply_to` is itself a RST.
    fn reset(&self, connection: &Connection, reply_to: Option<&VirtioVsockHdr>) {
        if reply_to.is_some_and(|hdr| hdr.is_op(VirtioVsockOp::Rst)) {
            return;
        }
        let info = PacketInfo {
            reply: reply_to.is_some(),
            ..PacketInfo::control(VirtioVsockOp::Rst)
        };
        self.send_control(connection, &info);
    }

    /// Answers a packet for which there is no socket with a RST, unless it is itself a RST.
    fn reset_no_sock(&self, hdr: &VirtioVsockHdr) {
        let Some(reset) = VsockPacket::build_reset(hdr) else {
            return;
        };
        if let Err(e) = self.transport.send_packet(reset) {
            warn!("Failed to reset {}: {}", hdr.source(), e);
        }
    }

    /// Starts connecting from `local_port` to `remote` by sending a REQUEST.
    ///
    /// The returned connection is in [`SocketState::Connecting`] until the peer answers; use
    /// [`wait_for_connect`](Self::wait_for_connect) to wait for that. If the REQUEST cannot be sent
    /// the attempt is abandoned and the error returned.
    pub fn connect(&self, remote: VsockAddr, local_port: u32) -> Result<Arc<Connection>> {
        let local = VsockAddr::new(self.transport.local_cid(), local_port);
        let connection = Arc::new(Connection::new(
            local,
            remote,
            SocketState::Connecting,
            FlowControl::new(self.config.buffer_sizes),
        ));
        let socket = Socket::Stream(connection.clone());
        self.registry.insert_bound(socket.clone())?;

        let mut state = connection.lock_state();
        if let Err(e) =
            self.send_pkt_info(&connection, &PacketInfo::control(VirtioVsockOp::Request))
        {
            state.state = SocketState::Closed;
            state.error = Some(e);
            self.registry.remove(&socket);
            return Err(e);
        }
        drop(state);
        debug!("Connection requested {} -> {}", local, remote);
        Ok(connection)
    }

    /// Blocks until the connect attempt on `connection` resolves, or until `timeout` passes.
    ///
    /// A timed out attempt is abandoned, as is one refused by the peer.
    pub fn wait_for_connect(
        &self,
        connection: &Arc<Connection>,
        timeout: Option<Duration>,
    ) -> Result {
        let state = connection.lock_state();
        let (mut state, _) = connection.wait_while(state, timeout, |state| {
            state.state == SocketState::Connecting
        });
        let error = match state.state {
            SocketState::Connected | SocketState::Disconnecting => return Ok(()),
            SocketState::Connecting => {
                state.state = SocketState::Closed;
                state.error = Some(SocketError::TimedOut);
                SocketError::TimedOut
            }
            SocketState::Closed => state.error.unwrap_or(SocketError::NotConnected),
        };
        drop(state);
        self.registry.remove(&Socket::Stream(connection.clone()));
        Err(error)
    }

    /// Binds a listening socket to `local`, accepting up to `backlog` pending connections.
    ///
    /// `local` may use [`VMADDR_CID_ANY`](crate::VMADDR_CID_ANY) to accept requests addressed to
    /// any CID.
    pub fn listen(&self, local: VsockAddr, backlog: usize) -> Result<Arc<Listener>> {
        let listener = Arc::new(Listener::new(local, backlog, self.config.buffer_sizes));
        self.registry
            .insert_bound(Socket::Listener(listener.clone()))?;
        info!("Listening on {} with backlog {}", local, backlog);
        Ok(listener)
    }

    /// Sends `buf`, or as much of it as fits into one packet and the peer's free buffer space.
    ///
    /// Returns the number of bytes sent, which is 0 if the peer has no space. Wait for the
    /// registry's write space signal before trying again.
    pub fn stream_enqueue(&self, connection: &Connection, buf: &[u8]) -> Result<usize> {
        let state = connection.lock_state();
        if state.state != SocketState::Connected {
            return Err(SocketError::NotConnected);
        }
        if state.shutdown.contains(StreamShutdown::SEND)
            || state.peer_shutdown.contains(StreamShutdown::RECEIVE)
        {
            return Err(SocketError::PeerSocketShutdown);
        }
        let info = PacketInfo {
            payload: buf,
            ..PacketInfo::control(VirtioVsockOp::Rw)
        };
        let sent = self.send_pkt_info(connection, &info)?;
        drop(state);
        Ok(sent as usize)
    }

    /// Copies received data into `buf` and tells the peer how much space that freed.
    ///
    /// Returns the number of bytes copied, 0 if there is nothing to read. Peeking is not
    /// supported.
    pub fn stream_dequeue(
        &self,
        connection: &Connection,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> Result<usize> {
        if flags.contains(RecvFlags::PEEK) {
            return Err(SocketError::Unsupported);
        }
        let mut state = connection.lock_state();
        let copied = connection.dequeue(buf);
        if copied == 0 {
            return Ok(0);
        }
        self.send_control(connection, &PacketInfo::control(VirtioVsockOp::CreditUpdate));

        if state.state == SocketState::Connected
            && state.peer_shutdown == StreamShutdown::all()
            && connection.rx_is_empty()
        {
            debug!("{} drained after peer shutdown", connection.local());
            state.state = SocketState::Disconnecting;
            self.registry.state_change(connection);
            connection.wake();
        }
        Ok(copied)
    }

    /// Shuts down the given directions of `connection` and tells the peer.
    ///
    /// The local bookkeeping is updated even if the packet cannot be sent.
    pub fn shutdown(&self, connection: &Connection, how: StreamShutdown) -> Result {
        let mut state = connection.lock_state();
        if state.state != SocketState::Connected {
            return Err(SocketError::NotConnected);
        }
        state.shutdown |= how;
        self.send_shutdown(connection, how)
    }

    fn send_shutdown(&self, connection: &Connection, how: StreamShutdown) -> Result {
        let info = PacketInfo {
            flags: how,
            ..PacketInfo::control(VirtioVsockOp::Shutdown)
        };
        self.send_pkt_info(connection, &info)?;
        Ok(())
    }

    /// Datagram sockets are not supported.
    pub fn dgram_bind(&self, _local: VsockAddr) -> Result {
        Err(SocketError::Unsupported)
    }

    /// Datagram sockets are not supported.
    pub fn dgram_enqueue(&self, _remote: VsockAddr, _buf: &[u8]) -> Result<usize> {
        Err(SocketError::Unsupported)
    }

    /// Datagram sockets are not supported.
    pub fn dgram_dequeue(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(SocketError::Unsupported)
    }

    /// Whether datagrams to the given address are allowed. They never are.
    pub fn dgram_allow(&self, _cid: u64, _port: u32) -> bool {
        false
    }

    /// Whether streams to the given address are allowed.
    pub fn stream_allow(&self, _cid: u64, _port: u32) -> bool {
        true
    }

    /// Whether a stream is active.
    pub fn stream_is_active(&self, _connection: &Connection) -> bool {
        true
    }
}
