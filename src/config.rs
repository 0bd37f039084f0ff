//! Tunables for the transport.

use core::time::Duration;

/// Default receive buffer size advertised to peers, in bytes.
pub const VIRTIO_VSOCK_DEFAULT_BUF_SIZE: u32 = 1024 * 256;
/// Default lower bound for the receive buffer size.
pub const VIRTIO_VSOCK_DEFAULT_MIN_BUF_SIZE: u32 = 128;
/// Default upper bound for the receive buffer size.
pub const VIRTIO_VSOCK_DEFAULT_MAX_BUF_SIZE: u32 = 1024 * 256;
/// The largest buffer size any connection may be configured with.
pub const VIRTIO_VSOCK_MAX_BUF_SIZE: u32 = 0xFFFF_FFFF;
/// Default largest payload carried by a single RW packet.
pub const VIRTIO_VSOCK_DEFAULT_RX_BUF_SIZE: u32 = 1024 * 4;
/// How long to wait for graceful shutdown of a connection.
pub const VSOCK_CLOSE_TIMEOUT: Duration = Duration::from_secs(8);

/// Receive buffer sizing of one socket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferSizes {
    /// The target receive buffer capacity.
    pub size: u32,
    /// The smallest value `size` may be lowered to.
    pub min: u32,
    /// The largest value `size` may be raised to.
    pub max: u32,
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self {
            size: VIRTIO_VSOCK_DEFAULT_BUF_SIZE,
            min: VIRTIO_VSOCK_DEFAULT_MIN_BUF_SIZE,
            max: VIRTIO_VSOCK_DEFAULT_MAX_BUF_SIZE,
        }
    }
}

/// Configuration of a [`VirtioVsock`](crate::VirtioVsock) instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VsockConfig {
    /// Buffer sizes given to sockets created by `connect` and `listen`.
    pub buffer_sizes: BufferSizes,
    /// The largest number of payload bytes put into one RW packet.
    pub max_packet_len: u32,
    /// How long a closed connection waits for the peer before it is reset.
    pub close_timeout: Duration,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            buffer_sizes: BufferSizes::default(),
            max_packet_len: VIRTIO_VSOCK_DEFAULT_RX_BUF_SIZE,
            close_timeout: VSOCK_CLOSE_TIMEOUT,
        }
    }
}
