//! Connection teardown.
//!
//! Closing a connection shuts it down and waits a bounded time for the peer to answer with a RST.
//! If the peer stays silent, a deferred task resets the connection. Whichever of the RST and the
//! deferred task comes first does the force close, and exactly one of them removes the
//! connection from the registry.

use super::VirtioVsock;
use crate::connection::{Connection, ConnectionState, SocketState};
use crate::error::SocketError;
use crate::hal::PacketTransport;
use crate::listener::Listener;
use crate::protocol::StreamShutdown;
use crate::registry::{Socket, SocketRegistry};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::time::Duration;
use log::{debug, info, warn};

impl<T: PacketTransport, R: SocketRegistry> VirtioVsock<T, R> {
    /// Marks `connection` as done and, if it owns the close timeout, removes it from the registry.
    ///
    /// With `cancel_timeout` the pending close timeout is cancelled first; if it has already
    /// started it is left to finish the teardown. `error`, if any, is recorded on the connection
    /// and reported to the registry.
    pub(super) fn do_close(
        &self,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        cancel_timeout: bool,
        error: Option<SocketError>,
    ) {
        if !state.done {
            state.done = true;
            state.peer_shutdown = StreamShutdown::all();
            state.state = SocketState::Closed;
            info!("Closed {} -> {}", connection.local(), connection.remote());
            if let Some(error) = error {
                state.error = Some(error);
                self.registry.error_report(connection, error);
            }
            self.registry.state_change(connection);
            connection.wake();
        }

        if let Some(task) = state.close_task.take() {
            if !cancel_timeout || task.cancel() {
                self.registry.remove(&Socket::Stream(connection.clone()));
            } else {
                state.close_task = Some(task);
            }
        }
    }

    /// Closes a listening socket, resetting every connection it has not handed out yet.
    pub fn close_listener(&self, listener: &Arc<Listener>) {
        self.registry.remove(&Socket::Listener(listener.clone()));
        let pending: Vec<_> = listener.lock_state().accept_queue.drain(..).collect();
        for child in pending {
            let mut state = child.lock_state();
            self.reset(&child, None);
            state.state = SocketState::Closed;
            state.done = true;
            child.wake();
            drop(state);
            self.registry.remove(&Socket::Stream(child));
        }
        info!("Closed listener {}", listener.local());
    }
}

impl<T, R> VirtioVsock<T, R>
where
    T: PacketTransport + 'static,
    R: SocketRegistry + 'static,
{
    /// Releases `connection` once its owner is done with it.
    ///
    /// An established connection is shut down in both directions first. If the peer had already
    /// shut down everything, it is reset and released at once. Otherwise this waits up to
    /// `linger` for the peer to finish, and if it has not, leaves a close timeout behind to reset
    /// the connection later. The connection stays in the registry until then.
    pub fn release(&self, connection: &Arc<Connection>, linger: Option<Duration>) {
        let mut state = connection.lock_state();
        if state.close_task.is_some() {
            return;
        }

        if matches!(
            state.state,
            SocketState::Connected | SocketState::Disconnecting
        ) {
            if state.peer_shutdown == StreamShutdown::all() {
                self.reset(connection, None);
            } else {
                if state.shutdown != StreamShutdown::all() {
                    state.shutdown = StreamShutdown::all();
                    if let Err(e) = self.send_shutdown(connection, StreamShutdown::all()) {
                        warn!("Failed to shut down {}: {}", connection.local(), e);
                    }
                }
                if let Some(linger) = linger {
                    state = connection
                        .wait_while(state, Some(linger), |state| !state.done)
                        .0;
                }
                if !state.done {
                    let vsock = self.clone();
                    let timed = connection.clone();
                    let task = self.scheduler.schedule(
                        self.config.close_timeout,
                        Box::new(move || vsock.close_timeout(&timed)),
                    );
                    state.close_task = Some(task);
                    debug!(
                        "{} waiting up to {:?} for {} to close",
                        connection.local(),
                        self.config.close_timeout,
                        connection.remote()
                    );
                    return;
                }
            }
        }

        if state.state != SocketState::Closed {
            state.state = SocketState::Closed;
            connection.wake();
        }
        drop(state);
        self.registry.remove(&Socket::Stream(connection.clone()));
    }

    fn close_timeout(&self, connection: &Arc<Connection>) {
        let mut state = connection.lock_state();
        if !state.done {
            info!(
                "{} did not close {} in time, resetting",
                connection.remote(),
                connection.local()
            );
            self.reset(connection, None);
            self.do_close(connection, &mut state, false, None);
        } else if state.close_task.take().is_some() {
            self.registry.remove(&Socket::Stream(connection.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{VsockConfig, VSOCK_CLOSE_TIMEOUT};
    use crate::connection::{Connection, SocketState};
    use crate::hal::fake::{CountingRegistry, FakeTransport, Pair, GUEST_CID, HOST_CID};
    use crate::packet::{PacketInfo, VsockPacket};
    use crate::protocol::{StreamShutdown, VirtioVsockOp, VsockAddr};
    use crate::timer::ThreadScheduler;
    use crate::vsock::VirtioVsock;
    use alloc::sync::Arc;
    use core::time::Duration;
    use std::thread;

    const SERVER: VsockAddr = VsockAddr::new(HOST_CID, 50);

    fn connected(pair: &Pair) -> (Arc<Connection>, Arc<Connection>) {
        let listener = pair.host.listen(SERVER, 4).unwrap();
        let client = pair.guest.connect(SERVER, 100).unwrap();
        pair.pump();
        (client, listener.try_accept().unwrap())
    }

    fn ops(packets: &[VsockPacket]) -> Vec<VirtioVsockOp> {
        packets.iter().map(|packet| packet.hdr.op().unwrap()).collect()
    }

    #[test]
    fn graceful_close() {
        let pair = Pair::new();
        let (client, server) = connected(&pair);

        pair.guest.release(&client, None);
        let shutdown = pair.guest.transport().take_sent();
        assert_eq!(ops(&shutdown), vec![VirtioVsockOp::Shutdown]);
        assert_eq!(shutdown[0].hdr.shutdown_flags(), StreamShutdown::all());
        assert_eq!(pair.scheduler.pending(), vec![VSOCK_CLOSE_TIMEOUT]);
        assert_eq!(client.local_shutdown(), StreamShutdown::all());
        assert_eq!(client.state(), SocketState::Connected);

        pair.host.deliver_packet(shutdown[0].clone());
        assert_eq!(server.state(), SocketState::Disconnecting);

        // The server has nothing more to say, so it answers with a RST.
        pair.host.release(&server, None);
        assert_eq!(server.state(), SocketState::Closed);
        assert_eq!(pair.host.registry().table.sizes(), (1, 0));
        pair.pump();

        assert_eq!(client.state(), SocketState::Closed);
        assert!(client.is_done());
        assert!(pair.scheduler.pending().is_empty());
        assert_eq!(pair.scheduler.fire_all(), 0);
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
    }

    #[test]
    fn simultaneous_close() {
        let pair = Pair::new();
        let (client, server) = connected(&pair);

        pair.guest.release(&client, None);
        pair.host.release(&server, None);
        assert_eq!(pair.scheduler.pending().len(), 2);
        pair.pump();

        assert_eq!(client.state(), SocketState::Closed);
        assert_eq!(server.state(), SocketState::Closed);
        assert!(pair.scheduler.pending().is_empty());
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
        assert_eq!(pair.host.registry().table.sizes(), (1, 0));
    }

    #[test]
    fn close_times_out() {
        let pair = Pair::new();
        let (client, _server) = connected(&pair);

        pair.guest.release(&client, None);
        pair.guest.transport().take_sent();
        assert_eq!(pair.guest.registry().table.sizes(), (1, 1));

        assert_eq!(pair.scheduler.fire_all(), 1);
        assert_eq!(ops(&pair.guest.transport().take_sent()), vec![VirtioVsockOp::Rst]);
        assert_eq!(client.state(), SocketState::Closed);
        assert!(client.is_done());
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
        assert_eq!(
            CountingRegistry::count(&pair.guest.registry().state_change),
            2
        );
    }

    #[test]
    fn reset_after_timeout_fired() {
        let pair = Pair::new();
        let (client, server) = connected(&pair);
        pair.guest.release(&client, None);
        pair.scheduler.fire_all();
        let state_changes = CountingRegistry::count(&pair.guest.registry().state_change);

        // Whatever the server sends now finds no connection.
        pair.host.release(&server, None);
        pair.pump();
        assert_eq!(client.state(), SocketState::Closed);
        assert_eq!(
            CountingRegistry::count(&pair.guest.registry().state_change),
            state_changes
        );
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
    }

    #[test]
    fn reset_races_running_timeout() {
        let pair = Pair::new();
        let (client, _server) = connected(&pair);
        pair.guest.release(&client, None);
        pair.guest.transport().take_sent();

        // The timer expires, but the task has not run yet when the RST comes in.
        let tasks = pair.scheduler.start_all();
        assert_eq!(tasks.len(), 1);
        let rst = PacketInfo::control(VirtioVsockOp::Rst);
        let reset = VsockPacket::allocate(&rst, 0, SERVER, client.local()).unwrap();
        pair.guest.deliver_packet(reset);
        assert_eq!(client.state(), SocketState::Closed);
        // The running task still owns the teardown.
        assert_eq!(pair.guest.registry().table.sizes(), (1, 1));
        let state_changes = CountingRegistry::count(&pair.guest.registry().state_change);

        for task in tasks {
            task();
        }
        assert!(pair.guest.transport().take_sent().is_empty());
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
        assert_eq!(
            CountingRegistry::count(&pair.guest.registry().state_change),
            state_changes
        );
    }

    #[test]
    fn release_after_peer_shutdown_resets() {
        let pair = Pair::new();
        let (client, server) = connected(&pair);
        pair.host.shutdown(&server, StreamShutdown::all()).unwrap();
        pair.pump();
        assert_eq!(client.state(), SocketState::Disconnecting);

        pair.guest.release(&client, None);
        assert_eq!(
            ops(&pair.guest.transport().take_sent()),
            vec![VirtioVsockOp::Rst]
        );
        assert!(pair.scheduler.pending().is_empty());
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
    }

    #[test]
    fn release_twice_schedules_once() {
        let pair = Pair::new();
        let (client, _server) = connected(&pair);
        pair.guest.release(&client, None);
        pair.guest.release(&client, None);
        assert_eq!(ops(&pair.guest.transport().take_sent()), vec![VirtioVsockOp::Shutdown]);
        assert_eq!(pair.scheduler.pending().len(), 1);
    }

    #[test]
    fn release_unconnected() {
        let pair = Pair::new();
        let client = pair.guest.connect(SERVER, 100).unwrap();
        pair.guest.transport().take_sent();
        pair.guest.release(&client, None);
        assert_eq!(client.state(), SocketState::Closed);
        assert!(pair.guest.transport().take_sent().is_empty());
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
    }

    #[test]
    fn linger_waits_for_peer() {
        let pair = Pair::new();
        let (client, server) = connected(&pair);

        let closer = {
            let guest = pair.guest.clone();
            let client = client.clone();
            thread::spawn(move || guest.release(&client, Some(Duration::from_secs(30))))
        };
        // Wait for the SHUTDOWN, then answer it.
        let shutdown = loop {
            let sent = pair.guest.transport().take_sent();
            if !sent.is_empty() {
                break sent;
            }
            thread::yield_now();
        };
        pair.host.deliver_packet(shutdown[0].clone());
        pair.host.release(&server, None);
        pair.pump();
        closer.join().unwrap();

        assert_eq!(client.state(), SocketState::Closed);
        assert!(pair.scheduler.pending().is_empty());
        assert_eq!(pair.guest.registry().table.sizes(), (0, 0));
    }

    #[test]
    fn linger_expires() {
        let pair = Pair::new();
        let (client, _server) = connected(&pair);
        pair.guest.release(&client, Some(Duration::from_millis(10)));
        assert_eq!(pair.scheduler.pending().len(), 1);
        assert_eq!(client.state(), SocketState::Connected);
    }

    #[test]
    fn close_listener_resets_pending() {
        let pair = Pair::new();
        let listener = pair.host.listen(SERVER, 4).unwrap();
        let client = pair.guest.connect(SERVER, 100).unwrap();
        pair.pump();
        assert_eq!(client.state(), SocketState::Connected);

        pair.host.close_listener(&listener);
        assert_eq!(pair.host.registry().table.sizes(), (0, 0));
        assert_eq!(listener.pending(), 0);
        pair.pump();
        assert_eq!(client.state(), SocketState::Closed);
        assert!(client.is_done());

        // New requests are refused.
        let again = pair.guest.connect(SERVER, 101).unwrap();
        pair.pump();
        assert_eq!(again.state(), SocketState::Closed);
    }

    #[test]
    fn thread_scheduler_timeout() {
        let config = VsockConfig {
            close_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let guest = VirtioVsock::new(
            FakeTransport::new(GUEST_CID),
            CountingRegistry::default(),
            Arc::new(ThreadScheduler),
            config,
        );
        let client = guest.connect(SERVER, 100).unwrap();
        let response = PacketInfo::control(VirtioVsockOp::Response);
        guest.deliver_packet(
            VsockPacket::allocate(&response, 0, SERVER, client.local()).unwrap(),
        );
        assert_eq!(client.state(), SocketState::Connected);

        guest.release(&client, None);
        let state = client.lock_state();
        let (state, timed_out) =
            client.wait_while(state, Some(Duration::from_secs(10)), |state| !state.done);
        assert!(!timed_out);
        drop(state);
        assert_eq!(client.state(), SocketState::Closed);
        assert_eq!(
            ops(&guest.transport().take_sent()),
            vec![
                VirtioVsockOp::Request,
                VirtioVsockOp::Shutdown,
                VirtioVsockOp::Rst
            ]
        );
    }
}
