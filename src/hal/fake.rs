//! Fake collaborators for tests.

use crate::{
    config::VsockConfig,
    connection::Connection,
    error::{Result, SocketError},
    hal::{DeferredTask, PacketTransport, Scheduler, TaskHandle},
    packet::VsockPacket,
    protocol::VsockAddr,
    registry::{Socket, SocketRegistry, SocketTable},
    vsock::VirtioVsock,
};
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Mutex;

pub const HOST_CID: u64 = 2;
pub const GUEST_CID: u64 = 3;

/// Queues every packet sent so tests can inspect or forward it.
#[derive(Debug)]
pub struct FakeTransport {
    cid: u64,
    sent: Mutex<VecDeque<VsockPacket>>,
    /// Makes every send fail while set.
    pub fail: AtomicBool,
}

impl FakeTransport {
    pub fn new(cid: u64) -> Self {
        Self {
            cid,
            sent: Mutex::new(VecDeque::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn take_sent(&self) -> Vec<VsockPacket> {
        self.sent.lock().unwrap().drain(..).collect()
    }
}

impl PacketTransport for FakeTransport {
    fn local_cid(&self) -> u64 {
        self.cid
    }

    fn send_packet(&self, packet: VsockPacket) -> Result {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SocketError::TransmitFailed);
        }
        self.sent.lock().unwrap().push_back(packet);
        Ok(())
    }
}

struct FakeTaskState {
    task: Mutex<Option<DeferredTask>>,
    delay: Duration,
}

struct FakeTask(Arc<FakeTaskState>);

impl TaskHandle for FakeTask {
    fn cancel(&self) -> bool {
        self.0.task.lock().unwrap().take().is_some()
    }
}

/// Holds deferred tasks until the test fires them.
#[derive(Default)]
pub struct FakeScheduler {
    tasks: Mutex<Vec<Arc<FakeTaskState>>>,
}

impl FakeScheduler {
    /// The delays of tasks which have neither run nor been cancelled.
    pub fn pending(&self) -> Vec<Duration> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|state| state.task.lock().unwrap().is_some())
            .map(|state| state.delay)
            .collect()
    }

    /// Claims every pending task as if its timer had expired, without running it yet.
    pub fn start_all(&self) -> Vec<DeferredTask> {
        self.tasks
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|state| state.task.lock().unwrap().take())
            .collect()
    }

    /// Runs every pending task on the current thread. Returns how many ran.
    pub fn fire_all(&self) -> usize {
        let tasks = self.start_all();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }
}

impl Scheduler for FakeScheduler {
    fn schedule(&self, delay: Duration, task: DeferredTask) -> Box<dyn TaskHandle> {
        let state = Arc::new(FakeTaskState {
            task: Mutex::new(Some(task)),
            delay,
        });
        self.tasks.lock().unwrap().push(state.clone());
        Box::new(FakeTask(state))
    }
}

/// A [`SocketTable`] which counts the readiness signals it receives.
#[derive(Default)]
pub struct CountingRegistry {
    pub table: SocketTable,
    pub data_ready: AtomicUsize,
    pub write_space: AtomicUsize,
    pub state_change: AtomicUsize,
    pub errors: Mutex<Vec<SocketError>>,
}

impl CountingRegistry {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl SocketRegistry for CountingRegistry {
    fn lookup_connected(&self, remote: VsockAddr, local: VsockAddr) -> Option<Arc<Connection>> {
        self.table.lookup_connected(remote, local)
    }

    fn lookup_bound(&self, local: VsockAddr) -> Option<Socket> {
        self.table.lookup_bound(local)
    }

    fn insert_bound(&self, socket: Socket) -> Result {
        self.table.insert_bound(socket)
    }

    fn insert_connected(&self, connection: Arc<Connection>) {
        self.table.insert_connected(connection)
    }

    fn remove(&self, socket: &Socket) {
        self.table.remove(socket)
    }

    fn data_ready(&self, _socket: &Socket) {
        self.data_ready.fetch_add(1, Ordering::SeqCst);
    }

    fn write_space(&self, _connection: &Connection) {
        self.write_space.fetch_add(1, Ordering::SeqCst);
    }

    fn state_change(&self, _connection: &Connection) {
        self.state_change.fetch_add(1, Ordering::SeqCst);
    }

    fn error_report(&self, _connection: &Connection, error: SocketError) {
        self.errors.lock().unwrap().push(error);
    }
}

pub type FakeVsock = VirtioVsock<FakeTransport, CountingRegistry>;

/// A host and a guest endpoint whose transports are connected by [`Pair::pump`].
pub struct Pair {
    pub host: FakeVsock,
    pub guest: FakeVsock,
    pub scheduler: Arc<FakeScheduler>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(VsockConfig::default())
    }

    pub fn with_config(config: VsockConfig) -> Self {
        let scheduler = Arc::new(FakeScheduler::default());
        Self {
            host: VirtioVsock::new(
                FakeTransport::new(HOST_CID),
                CountingRegistry::default(),
                scheduler.clone(),
                config,
            ),
            guest: VirtioVsock::new(
                FakeTransport::new(GUEST_CID),
                CountingRegistry::default(),
                scheduler.clone(),
                config,
            ),
            scheduler,
        }
    }

    /// Forwards packets in both directions until neither side has anything left to send.
    /// Returns the number of packets forwarded.
    pub fn pump(&self) -> usize {
        let mut total = 0;
        loop {
            let moved = forward(&self.guest, &self.host) + forward(&self.host, &self.guest);
            if moved == 0 {
                return total;
            }
            total += moved;
        }
    }
}

/// Delivers everything `from` has sent to `to` through the wire encoding.
pub fn forward(from: &FakeVsock, to: &FakeVsock) -> usize {
    let packets = from.transport().take_sent();
    for packet in &packets {
        to.deliver_bytes(&packet.to_bytes()).unwrap();
    }
    packets.len()
}
