//! Receive dispatch: routing packets from the peer to sockets, and the per-state handlers.

use super::VirtioVsock;
use crate::connection::{child_flow_control, Connection, ConnectionState, SocketState};
use crate::error::{Result, SocketError};
use crate::hal::PacketTransport;
use crate::listener::Listener;
use crate::packet::{PacketInfo, VsockPacket};
use crate::protocol::{StreamShutdown, VirtioVsockHdr, VirtioVsockOp};
use crate::registry::{Socket, SocketRegistry};
use alloc::sync::Arc;
use log::{debug, info, trace, warn};

impl<T: PacketTransport, R: SocketRegistry> VirtioVsock<T, R> {
    /// Parses a packet received from the wire and handles it.
    ///
    /// Fails only if `bytes` does not hold a whole packet.
    pub fn deliver_bytes(&self, bytes: &[u8]) -> Result {
        let packet = VsockPacket::read_from(bytes)?;
        self.deliver_packet(packet);
        Ok(())
    }

    /// Handles one packet from the peer.
    ///
    /// Packets for one connection must be delivered in the order they arrived. Packets which no
    /// socket accepts are answered with a RST.
    pub fn deliver_packet(&self, packet: VsockPacket) {
        let hdr = packet.hdr;
        let (local, remote) = (hdr.destination(), hdr.source());
        trace!(
            "recv pkt {} -> {} len={} type={} op={} flags={:#x} buf_alloc={} fwd_cnt={}",
            remote,
            local,
            hdr.len(),
            hdr.socket_type.get(),
            hdr.op.get(),
            hdr.flags.get(),
            hdr.buf_alloc.get(),
            hdr.fwd_cnt.get()
        );

        if !hdr.is_stream() {
            debug!("Unsupported socket type {} from {}", hdr.socket_type.get(), remote);
            self.reset_no_sock(&hdr);
            return;
        }

        let socket = self
            .registry
            .lookup_connected(remote, local)
            .map(Socket::Stream)
            .or_else(|| {
                // A connecting stream only takes packets from the peer it is connecting to.
                self.registry
                    .lookup_bound(local)
                    .filter(|socket| match socket {
                        Socket::Stream(connection) => connection.remote() == remote,
                        Socket::Listener(_) => true,
                    })
            });
        match socket {
            Some(Socket::Listener(listener)) => self.recv_listen(&listener, &hdr),
            Some(Socket::Stream(connection)) => self.recv_stream(&connection, packet),
            None => {
                debug!("No socket for {} -> {}", remote, local);
                self.reset_no_sock(&hdr);
            }
        }
    }

    fn recv_stream(&self, connection: &Arc<Connection>, packet: VsockPacket) {
        let hdr = packet.hdr;
        let space_available = connection
            .lock_credit()
            .update_from_peer(hdr.buf_alloc.get(), hdr.fwd_cnt.get());

        let mut state = connection.lock_state();
        if space_available {
            self.registry.write_space(connection);
            connection.wake();
        }
        match state.state {
            SocketState::Connecting => self.recv_connecting(connection, &mut state, &hdr),
            SocketState::Connected => self.recv_connected(connection, &mut state, packet),
            SocketState::Disconnecting => self.recv_disconnecting(connection, &mut state, &hdr),
            SocketState::Closed => {
                debug!("Dropped op {} for closed {}", hdr.op.get(), connection.local())
            }
        }
    }

    fn recv_connecting(
        &self,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        hdr: &VirtioVsockHdr,
    ) {
        let error = match hdr.op() {
            Ok(VirtioVsockOp::Response) => {
                state.state = SocketState::Connected;
                self.registry.insert_connected(connection.clone());
                info!("Connected {} -> {}", connection.local(), connection.remote());
                self.registry.state_change(connection);
                connection.wake();
                return;
            }
            Ok(VirtioVsockOp::Invalid) => return,
            Ok(VirtioVsockOp::Rst) => SocketError::ConnectionReset,
            _ => SocketError::ProtocolError,
        };

        self.reset(connection, Some(hdr));
        warn!("Connect to {} failed: {}", connection.remote(), error);
        state.state = SocketState::Closed;
        state.error = Some(error);
        self.registry.error_report(connection, error);
        self.registry.remove(&Socket::Stream(connection.clone()));
        connection.wake();
    }

    fn recv_connected(
        &self,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        packet: VsockPacket,
    ) {
        let hdr = packet.hdr;
        match hdr.op() {
            Ok(VirtioVsockOp::Rw) => {
                let len = packet.payload().len();
                if len == 0 {
                    warn!("Dropped empty RW packet from {}", connection.remote());
                } else if hdr.len() as usize != len {
                    warn!(
                        "Dropped RW packet from {}: header says {} bytes, payload has {}",
                        connection.remote(),
                        hdr.len(),
                        len
                    );
                } else if connection.enqueue(packet) {
                    self.registry
                        .data_ready(&Socket::Stream(connection.clone()));
                    connection.wake();
                } else {
                    warn!(
                        "Dropped {} bytes from {}: receive buffer full",
                        len,
                        connection.remote()
                    );
                }
            }
            // The new credit has already been recorded.
            Ok(VirtioVsockOp::CreditUpdate) => {}
            Ok(VirtioVsockOp::CreditRequest) => {
                let info = PacketInfo {
                    reply: true,
                    ..PacketInfo::control(VirtioVsockOp::CreditUpdate)
                };
                self.send_control(connection, &info);
            }
            Ok(VirtioVsockOp::Shutdown) => {
                let flags = hdr.shutdown_flags();
                state.peer_shutdown |= flags;
                debug!(
                    "{} shut down {:?} of {}",
                    connection.remote(),
                    flags,
                    connection.local()
                );
                if state.peer_shutdown == StreamShutdown::all() && connection.rx_is_empty() {
                    if state.shutdown == StreamShutdown::all() {
                        // Both sides have shut down everything, so nobody is left to send the
                        // final RST.
                        self.reset(connection, None);
                        self.do_close(connection, state, true, None);
                        return;
                    }
                    state.state = SocketState::Disconnecting;
                }
                if !flags.is_empty() {
                    self.registry.state_change(connection);
                    connection.wake();
                }
            }
            Ok(VirtioVsockOp::Rst) => self.recv_reset(connection, state),
            Ok(op) => debug!("Ignored {:?} on connected {}", op, connection.local()),
            Err(e) => warn!("Ignored packet from {}: {}", connection.remote(), e),
        }
    }

    fn recv_disconnecting(
        &self,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        hdr: &VirtioVsockHdr,
    ) {
        if hdr.is_op(VirtioVsockOp::Rst) {
            self.recv_reset(connection, state);
        }
    }

    /// Force closes `connection` after the peer reset it.
    ///
    /// The reset is only an error if we were still using the connection. Once we have shut down
    /// both directions it is the expected end of a close.
    fn recv_reset(&self, connection: &Arc<Connection>, state: &mut ConnectionState) {
        let error =
            (state.shutdown != StreamShutdown::all()).then_some(SocketError::ConnectionReset);
        if error.is_some() {
            warn!("{} reset {}", connection.remote(), connection.local());
        }
        self.do_close(connection, state, true, error);
    }

    fn recv_listen(&self, listener: &Arc<Listener>, hdr: &VirtioVsockHdr) {
        if !hdr.is_op(VirtioVsockOp::Request) {
            debug!("Listener {} got op {}", listener.local(), hdr.op.get());
            self.reset_no_sock(hdr);
            return;
        }

        let mut state = listener.lock_state();
        if state.is_accept_queue_full() {
            warn!(
                "Refused {}: backlog of {} is full",
                hdr.source(),
                listener.local()
            );
            self.reset_no_sock(hdr);
            return;
        }

        let credit =
            child_flow_control(state.buffer_sizes, hdr.buf_alloc.get(), hdr.fwd_cnt.get());
        let child = Arc::new(Connection::new(
            hdr.destination(),
            hdr.source(),
            SocketState::Connected,
            credit,
        ));
        self.registry.insert_connected(child.clone());
        state.accept_queue.push_back(child.clone());

        let response = PacketInfo {
            reply: true,
            ..PacketInfo::control(VirtioVsockOp::Response)
        };
        self.send_control(&child, &response);
        info!("Accepted {} on {}", child.remote(), child.local());

        self.registry
            .data_ready(&Socket::Listener(listener.clone()));
        listener.wake();
    }
}
