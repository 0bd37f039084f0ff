//! One stream connection and the locks guarding its parts.
//!
//! A connection has three locks which are always taken in this order:
//!
//! 1. the state lock, serialising state machine transitions and local socket calls;
//! 2. the receive queue lock;
//! 3. the credit lock, guarding [`FlowControl`].
//!
//! The credit lock is never held while taking one of the others, so a writer can query its credit
//! without waiting for a transition to finish.

use crate::config::BufferSizes;
use crate::credit::FlowControl;
use crate::error::SocketError;
use crate::hal::TaskHandle;
use crate::packet::VsockPacket;
use crate::protocol::{StreamShutdown, VsockAddr};
use alloc::{boxed::Box, collections::VecDeque};
use core::fmt::{self, Debug, Formatter};
use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// The state of a stream connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SocketState {
    /// We sent a connection request and are waiting for the response.
    Connecting,
    /// The connection is established.
    Connected,
    /// The peer has shut down both directions and we have nothing left to read.
    Disconnecting,
    /// The connection has been torn down, or never got established.
    Closed,
}

/// Fields guarded by the connection's state lock.
pub(crate) struct ConnectionState {
    pub(crate) state: SocketState,
    /// Directions the peer has shut down.
    pub(crate) peer_shutdown: StreamShutdown,
    /// Directions we have shut down.
    pub(crate) shutdown: StreamShutdown,
    /// Set once the connection has been force closed.
    pub(crate) done: bool,
    pub(crate) error: Option<SocketError>,
    /// The pending close timeout, if the connection was released before the peer acknowledged.
    pub(crate) close_task: Option<Box<dyn TaskHandle>>,
}

struct RxEntry {
    packet: VsockPacket,
    /// Number of payload bytes already handed to the consumer.
    offset: usize,
}

/// A vsock stream connection, created by an active connect or by accepting a request on a
/// [`Listener`](crate::Listener).
pub struct Connection {
    local: VsockAddr,
    remote: VsockAddr,
    state: Mutex<ConnectionState>,
    rx_queue: Mutex<VecDeque<RxEntry>>,
    credit: Mutex<FlowControl>,
    /// Signalled on every state change, data arrival and credit change.
    event: Condvar,
}

impl Connection {
    pub(crate) fn new(
        local: VsockAddr,
        remote: VsockAddr,
        state: SocketState,
        credit: FlowControl,
    ) -> Self {
        Self {
            local,
            remote,
            state: Mutex::new(ConnectionState {
                state,
                peer_shutdown: StreamShutdown::empty(),
                shutdown: StreamShutdown::empty(),
                done: false,
                error: None,
                close_task: None,
            }),
            rx_queue: Mutex::new(VecDeque::new()),
            credit: Mutex::new(credit),
            event: Condvar::new(),
        }
    }

    /// The local address.
    pub fn local(&self) -> VsockAddr {
        self.local
    }

    /// The address of the peer.
    pub fn remote(&self) -> VsockAddr {
        self.remote
    }

    /// The current state.
    pub fn state(&self) -> SocketState {
        self.lock_state().state
    }

    /// The error which closed the connection, if any.
    pub fn error(&self) -> Option<SocketError> {
        self.lock_state().error
    }

    /// The directions the peer has shut down.
    pub fn peer_shutdown(&self) -> StreamShutdown {
        self.lock_state().peer_shutdown
    }

    /// The directions we have shut down.
    pub fn local_shutdown(&self) -> StreamShutdown {
        self.lock_state().shutdown
    }

    /// Whether the connection has been force closed.
    pub fn is_done(&self) -> bool {
        self.lock_state().done
    }

    /// The number of received bytes waiting to be read.
    pub fn stream_has_data(&self) -> u32 {
        self.lock_credit().rx_bytes()
    }

    /// The number of bytes the peer can accept right now.
    pub fn stream_has_space(&self) -> u32 {
        self.lock_credit().peer_free()
    }

    /// Whether a read would find data.
    pub fn notify_poll_in(&self) -> bool {
        self.stream_has_data() > 0
    }

    /// Whether a write would make progress.
    pub fn notify_poll_out(&self) -> bool {
        self.stream_has_space() > 0
    }

    /// The receive high water mark, which is the receive buffer size.
    pub fn rcvhiwat(&self) -> u32 {
        self.lock_credit().buffer_sizes().size
    }

    /// A snapshot of the flow control counters.
    pub fn flow_control(&self) -> FlowControl {
        self.lock_credit().clone()
    }

    /// The receive buffer size.
    pub fn buffer_size(&self) -> u32 {
        self.lock_credit().buffer_sizes().size
    }

    /// The lower bound of the receive buffer size.
    pub fn min_buffer_size(&self) -> u32 {
        self.lock_credit().buffer_sizes().min
    }

    /// The upper bound of the receive buffer size.
    pub fn max_buffer_size(&self) -> u32 {
        self.lock_credit().buffer_sizes().max
    }

    /// Sets the receive buffer size. The new size is advertised with the next packet we send.
    pub fn set_buffer_size(&self, val: u64) {
        self.lock_credit().set_buffer_size(val);
    }

    /// Sets the lower bound of the receive buffer size.
    pub fn set_min_buffer_size(&self, val: u64) {
        self.lock_credit().set_min_buffer_size(val);
    }

    /// Sets the upper bound of the receive buffer size.
    pub fn set_max_buffer_size(&self, val: u64) {
        self.lock_credit().set_max_buffer_size(val);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_credit(&self) -> MutexGuard<'_, FlowControl> {
        self.credit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rx(&self) -> MutexGuard<'_, VecDeque<RxEntry>> {
        self.rx_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes every thread waiting on this connection.
    pub(crate) fn wake(&self) {
        self.event.notify_all();
    }

    /// Waits with the state lock released until `condition` returns false or `timeout` passes.
    ///
    /// Returns the reacquired guard and whether the wait timed out.
    pub(crate) fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, ConnectionState>,
        timeout: Option<Duration>,
        condition: impl FnMut(&mut ConnectionState) -> bool,
    ) -> (MutexGuard<'a, ConnectionState>, bool) {
        match timeout {
            Some(timeout) => {
                let (guard, result) = self
                    .event
                    .wait_timeout_while(guard, timeout, condition)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, result.timed_out())
            }
            None => {
                let guard = self
                    .event
                    .wait_while(guard, condition)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
        }
    }

    /// Queues an RW packet for the consumer. Returns false, dropping the packet, if it does not
    /// fit in the receive buffer we advertised.
    pub(crate) fn enqueue(&self, packet: VsockPacket) -> bool {
        let Ok(len) = u32::try_from(packet.payload().len()) else {
            return false;
        };
        let mut rx_queue = self.lock_rx();
        let mut credit = self.lock_credit();
        if !credit.can_receive(len) {
            return false;
        }
        credit.record_received(len);
        drop(credit);
        rx_queue.push_back(RxEntry { packet, offset: 0 });
        true
    }

    /// Copies queued payload into `buf` in arrival order, returning the number of bytes copied.
    pub(crate) fn dequeue(&self, buf: &mut [u8]) -> usize {
        let mut total = 0;
        let mut rx_queue = self.lock_rx();
        while total < buf.len() {
            let Some(entry) = rx_queue.front_mut() else {
                break;
            };
            let remaining = &entry.packet.payload()[entry.offset..];
            let bytes = remaining.len().min(buf.len() - total);
            buf[total..total + bytes].copy_from_slice(&remaining[..bytes]);
            total += bytes;
            entry.offset += bytes;
            if entry.offset == entry.packet.payload().len() {
                rx_queue.pop_front();
            }
            // `bytes` is bounded by a packet length, which is a u32.
            self.lock_credit().record_consumed(bytes as u32);
        }
        total
    }

    pub(crate) fn rx_is_empty(&self) -> bool {
        self.lock_rx().is_empty()
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Buffer sizes for a connection accepted by a listener with `sizes`.
pub(crate) fn child_flow_control(
    sizes: BufferSizes,
    peer_buf_alloc: u32,
    peer_fwd_cnt: u32,
) -> FlowControl {
    let mut credit = FlowControl::new(sizes);
    credit.update_from_peer(peer_buf_alloc, peer_fwd_cnt);
    credit
}
