//! Lookup tables of live sockets, owned by the socket layer.

use crate::connection::Connection;
use crate::error::SocketError;
use crate::listener::Listener;
use crate::protocol::{VsockAddr, VMADDR_CID_ANY};
use alloc::{collections::BTreeMap, sync::Arc};
use log::debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A socket which can receive packets.
#[derive(Clone, Debug)]
pub enum Socket {
    /// A connecting or connected stream.
    Stream(Arc<Connection>),
    /// A listening socket.
    Listener(Arc<Listener>),
}

impl Socket {
    /// The local address the socket is bound to.
    pub fn local(&self) -> VsockAddr {
        match self {
            Self::Stream(connection) => connection.local(),
            Self::Listener(listener) => listener.local(),
        }
    }

    fn is(&self, other: &Socket) -> bool {
        match (self, other) {
            (Self::Stream(a), Self::Stream(b)) => Arc::ptr_eq(a, b),
            (Self::Listener(a), Self::Listener(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The socket layer as seen from the transport: tables mapping addresses to sockets, and the
/// readiness notifications sockets receive.
///
/// A returned `Arc` keeps the socket alive for as long as the caller holds it.
pub trait SocketRegistry: Send + Sync {
    /// Finds the connection between `remote` and `local`.
    fn lookup_connected(&self, remote: VsockAddr, local: VsockAddr) -> Option<Arc<Connection>>;

    /// Finds the socket bound to `local`: a listener, or a stream still waiting for its
    /// connection response.
    fn lookup_bound(&self, local: VsockAddr) -> Option<Socket>;

    /// Adds a socket to the bound table. Fails if the address is taken.
    fn insert_bound(&self, socket: Socket) -> Result<(), SocketError>;

    /// Adds an established connection to the connected table.
    fn insert_connected(&self, connection: Arc<Connection>);

    /// Removes the socket from every table.
    fn remove(&self, socket: &Socket);

    /// Data arrived on a connection, or a connection is ready to be accepted from a listener.
    fn data_ready(&self, _socket: &Socket) {}

    /// Send credit became available on a connection.
    fn write_space(&self, _connection: &Connection) {}

    /// The state of a connection changed.
    fn state_change(&self, _connection: &Connection) {}

    /// A connection failed with the given error.
    fn error_report(&self, _connection: &Connection, _error: SocketError) {}
}

#[derive(Default)]
struct Tables {
    bound: BTreeMap<VsockAddr, Socket>,
    connected: BTreeMap<(VsockAddr, VsockAddr), Arc<Connection>>,
}

/// An in-memory [`SocketRegistry`].
#[derive(Default)]
pub struct SocketTable {
    tables: Mutex<Tables>,
}

impl SocketTable {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of sockets in the bound and connected tables.
    pub fn sizes(&self) -> (usize, usize) {
        let tables = self.lock();
        (tables.bound.len(), tables.connected.len())
    }
}

impl SocketRegistry for SocketTable {
    fn lookup_connected(&self, remote: VsockAddr, local: VsockAddr) -> Option<Arc<Connection>> {
        self.lock().connected.get(&(remote, local)).cloned()
    }

    fn lookup_bound(&self, local: VsockAddr) -> Option<Socket> {
        let tables = self.lock();
        tables
            .bound
            .get(&local)
            .or_else(|| tables.bound.get(&VsockAddr::new(VMADDR_CID_ANY, local.port)))
            .cloned()
    }

    fn insert_bound(&self, socket: Socket) -> Result<(), SocketError> {
        let mut tables = self.lock();
        let local = socket.local();
        if tables.bound.contains_key(&local) {
            return Err(SocketError::AddressInUse);
        }
        debug!("Bound {}", local);
        tables.bound.insert(local, socket);
        Ok(())
    }

    fn insert_connected(&self, connection: Arc<Connection>) {
        let key = (connection.remote(), connection.local());
        debug!("Connected {} -> {}", key.1, key.0);
        self.lock().connected.insert(key, connection);
    }

    fn remove(&self, socket: &Socket) {
        let mut tables = self.lock();
        tables.bound.retain(|_, bound| !bound.is(socket));
        if let Socket::Stream(connection) = socket {
            tables
                .connected
                .retain(|_, connected| !Arc::ptr_eq(connected, connection));
        }
    }
}
