//! Listening sockets.

use crate::config::BufferSizes;
use crate::connection::Connection;
use crate::error::{Result, SocketError};
use crate::protocol::VsockAddr;
use alloc::{collections::VecDeque, sync::Arc};
use core::fmt::{self, Debug, Formatter};
use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub(crate) struct ListenerState {
    pub(crate) backlog: usize,
    pub(crate) accept_queue: VecDeque<Arc<Connection>>,
    /// Buffer sizes inherited by accepted connections.
    pub(crate) buffer_sizes: BufferSizes,
}

impl ListenerState {
    pub(crate) fn is_accept_queue_full(&self) -> bool {
        self.accept_queue.len() >= self.backlog
    }
}

/// A socket bound to a local address which accepts incoming connection requests.
///
/// A listener has no flow control state of its own; each accepted [`Connection`] gets its own.
pub struct Listener {
    local: VsockAddr,
    state: Mutex<ListenerState>,
    event: Condvar,
}

impl Listener {
    pub(crate) fn new(local: VsockAddr, backlog: usize, buffer_sizes: BufferSizes) -> Self {
        Self {
            local,
            state: Mutex::new(ListenerState {
                backlog,
                accept_queue: VecDeque::new(),
                buffer_sizes,
            }),
            event: Condvar::new(),
        }
    }

    /// The address the listener is bound to.
    pub fn local(&self) -> VsockAddr {
        self.local
    }

    /// The maximum number of connections waiting to be accepted.
    pub fn backlog(&self) -> usize {
        self.lock_state().backlog
    }

    /// Changes the backlog. Connections already queued are kept.
    pub fn set_backlog(&self, backlog: usize) {
        self.lock_state().backlog = backlog;
    }

    /// The number of connections waiting to be accepted.
    pub fn pending(&self) -> usize {
        self.lock_state().accept_queue.len()
    }

    /// The buffer sizes accepted connections start with.
    pub fn buffer_sizes(&self) -> BufferSizes {
        self.lock_state().buffer_sizes
    }

    /// Changes the buffer sizes given to connections accepted from now on.
    pub fn set_buffer_sizes(&self, buffer_sizes: BufferSizes) {
        self.lock_state().buffer_sizes = buffer_sizes;
    }

    /// Takes the oldest established connection off the accept queue, if there is one.
    pub fn try_accept(&self) -> Option<Arc<Connection>> {
        self.lock_state().accept_queue.pop_front()
    }

    /// Blocks until a connection can be accepted, or until `timeout` passes.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Arc<Connection>> {
        let state = self.lock_state();
        let mut state = match timeout {
            Some(timeout) => {
                self.event
                    .wait_timeout_while(state, timeout, |state| state.accept_queue.is_empty())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .event
                .wait_while(state, |state| state.accept_queue.is_empty())
                .unwrap_or_else(PoisonError::into_inner),
        };
        state.accept_queue.pop_front().ok_or(SocketError::TimedOut)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake(&self) {
        self.event.notify_all();
    }
}

impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
