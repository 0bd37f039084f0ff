#[cfg(test)]
pub mod fake;

use crate::error::Result;
use crate::packet::VsockPacket;
use alloc::boxed::Box;
use core::time::Duration;

/// The raw packet delivery mechanism underneath the transport, e.g. the tx virtqueue of a vsock
/// device or a vhost backend.
///
/// Received packets are handed back through [`VirtioVsock::deliver_packet`](crate::VirtioVsock::deliver_packet).
pub trait PacketTransport: Send + Sync {
    /// Returns the context id of the local endpoint. It is used as the source CID of every packet
    /// sent.
    fn local_cid(&self) -> u64;

    /// Sends one packet to the peer.
    ///
    /// The packet is consumed whether or not this succeeds.
    fn send_packet(&self, packet: VsockPacket) -> Result;
}

/// A one-shot task which runs on some other thread after a delay.
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// A source of deferred work, used to bound how long a closed connection waits for its peer.
pub trait Scheduler: Send + Sync {
    /// Arranges for `task` to run once after `delay`.
    ///
    /// Implementations must not run `task` before returning, as callers hold locks the task
    /// needs.
    fn schedule(&self, delay: Duration, task: DeferredTask) -> Box<dyn TaskHandle>;
}

/// A handle to a task returned by [`Scheduler::schedule`].
pub trait TaskHandle: Send {
    /// Tries to stop the task from running.
    ///
    /// Returns true if the task was cancelled and will never run, or false if it has already
    /// started.
    fn cancel(&self) -> bool;
}
