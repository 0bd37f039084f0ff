//! The common part of virtio-vsock transports: the connection state machine, credit based flow
//! control and packet dispatch which sit between a socket layer and a raw packet transport.
//!
//! The socket layer is represented by a [`SocketRegistry`], such as [`SocketTable`]. The raw
//! transport, for example the tx virtqueue of a vsock device, implements [`PacketTransport`] and
//! hands every packet it receives to [`VirtioVsock::deliver_packet`].
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use virtio_vsock_transport::{
//!     PacketTransport, Result, SocketState, SocketTable, ThreadScheduler, VirtioVsock,
//!     VsockAddr, VsockConfig, VsockPacket, VMADDR_CID_HOST,
//! };
//!
//! /// Keeps sent packets instead of sending them anywhere.
//! struct Outbox(Mutex<Vec<VsockPacket>>);
//!
//! impl PacketTransport for Outbox {
//!     fn local_cid(&self) -> u64 {
//!         3
//!     }
//!
//!     fn send_packet(&self, packet: VsockPacket) -> Result {
//!         self.0.lock().unwrap().push(packet);
//!         Ok(())
//!     }
//! }
//!
//! let vsock = VirtioVsock::new(
//!     Outbox(Mutex::new(Vec::new())),
//!     SocketTable::new(),
//!     Arc::new(ThreadScheduler),
//!     VsockConfig::default(),
//! );
//! let connection = vsock.connect(VsockAddr::new(VMADDR_CID_HOST, 1234), 1025)?;
//! assert_eq!(connection.state(), SocketState::Connecting);
//! assert_eq!(vsock.transport().0.lock().unwrap().len(), 1);
//! # Ok::<(), virtio_vsock_transport::SocketError>(())
//! ```

#![deny(unused_must_use, missing_docs)]

extern crate alloc;

mod config;
mod connection;
mod credit;
#[cfg(feature = "embedded-io")]
mod embedded_io;
mod error;
mod hal;
mod listener;
mod packet;
mod protocol;
mod registry;
mod timer;
mod vsock;

pub use self::config::{
    BufferSizes, VsockConfig, VIRTIO_VSOCK_DEFAULT_BUF_SIZE, VIRTIO_VSOCK_DEFAULT_MAX_BUF_SIZE,
    VIRTIO_VSOCK_DEFAULT_MIN_BUF_SIZE, VIRTIO_VSOCK_DEFAULT_RX_BUF_SIZE, VIRTIO_VSOCK_MAX_BUF_SIZE,
    VSOCK_CLOSE_TIMEOUT,
};
pub use self::connection::{Connection, SocketState};
pub use self::credit::FlowControl;
#[cfg(feature = "embedded-io")]
pub use self::embedded_io::VsockStream;
pub use self::error::{Result, SocketError};
pub use self::hal::{DeferredTask, PacketTransport, Scheduler, TaskHandle};
pub use self::listener::Listener;
pub use self::packet::{PacketInfo, VsockPacket};
pub use self::protocol::{
    SocketType, StreamShutdown, VirtioVsockHdr, VirtioVsockOp, VsockAddr, VMADDR_CID_ANY,
    VMADDR_CID_HOST,
};
pub use self::registry::{Socket, SocketRegistry, SocketTable};
pub use self::timer::ThreadScheduler;
pub use self::vsock::{RecvFlags, VirtioVsock};
