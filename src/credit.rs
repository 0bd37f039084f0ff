//! Credit based flow control of one connection.
//!
//! Each side advertises how much receive buffer it has (`buf_alloc`) and how many bytes it has
//! handed to its local consumer so far (`fwd_cnt`). The sender may have at most
//! `peer_buf_alloc - (tx_cnt - peer_fwd_cnt)` bytes in flight. All counters are free running and
//! wrap modulo 2^32, so they are only ever compared through differences.

use crate::config::{BufferSizes, VIRTIO_VSOCK_MAX_BUF_SIZE};
use crate::protocol::VirtioVsockHdr;

/// Flow control state of a connection, guarded by the connection's credit lock.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlowControl {
    buf_size: u32,
    buf_size_min: u32,
    buf_size_max: u32,
    /// The receive buffer space we advertise to the peer.
    buf_alloc: u32,
    /// The number of bytes we have handed to the local consumer.
    fwd_cnt: u32,
    /// The number of bytes queued for the local consumer.
    rx_bytes: u32,
    /// The number of payload bytes we have sent to the peer.
    tx_cnt: u32,
    /// The last `buf_alloc` value the peer sent to us.
    peer_buf_alloc: u32,
    /// The last `fwd_cnt` value the peer sent to us.
    peer_fwd_cnt: u32,
}

impl FlowControl {
    /// Creates the flow control state for a new connection.
    pub fn new(sizes: BufferSizes) -> Self {
        Self {
            buf_size: sizes.size,
            buf_size_min: sizes.min,
            buf_size_max: sizes.max,
            buf_alloc: sizes.size,
            ..Default::default()
        }
    }

    /// The number of bytes the peer can currently accept from us, never negative.
    pub fn peer_free(&self) -> u32 {
        self.peer_buf_alloc
            .saturating_sub(self.tx_cnt.wrapping_sub(self.peer_fwd_cnt))
    }

    /// Whether we may send at least one payload byte.
    pub fn has_space(&self) -> bool {
        self.peer_free() > 0
    }

    /// Reserves up to `requested` bytes of send credit and returns the amount granted.
    pub fn get_credit(&mut self, requested: u32) -> u32 {
        let granted = requested.min(self.peer_free());
        self.tx_cnt = self.tx_cnt.wrapping_add(granted);
        granted
    }

    /// Gives back credit reserved by [`get_credit`](Self::get_credit) for a send that failed.
    pub fn put_credit(&mut self, amount: u32) {
        self.tx_cnt = self.tx_cnt.wrapping_sub(amount);
    }

    /// Records the credit fields carried by a packet from the peer.
    ///
    /// Returns true if we had no send space before and have some now.
    pub fn update_from_peer(&mut self, peer_buf_alloc: u32, peer_fwd_cnt: u32) -> bool {
        let had_space = self.has_space();
        self.peer_buf_alloc = peer_buf_alloc;
        self.peer_fwd_cnt = peer_fwd_cnt;
        !had_space && self.has_space()
    }

    /// Whether `len` more bytes fit into the receive buffer we advertised.
    pub fn can_receive(&self, len: u32) -> bool {
        self.rx_bytes
            .checked_add(len)
            .map_or(false, |total| total <= self.buf_alloc)
    }

    /// Accounts for `len` payload bytes queued for the local consumer.
    pub fn record_received(&mut self, len: u32) {
        self.rx_bytes += len;
    }

    /// Accounts for `len` bytes handed to the local consumer.
    pub fn record_consumed(&mut self, len: u32) {
        self.rx_bytes -= len;
        self.fwd_cnt = self.fwd_cnt.wrapping_add(len);
    }

    /// Writes our current `buf_alloc` and `fwd_cnt` into an outgoing header.
    pub fn stamp(&self, hdr: &mut VirtioVsockHdr) {
        hdr.buf_alloc = self.buf_alloc.into();
        hdr.fwd_cnt = self.fwd_cnt.into();
    }

    /// The number of bytes queued for the local consumer.
    pub fn rx_bytes(&self) -> u32 {
        self.rx_bytes
    }

    /// The number of bytes handed to the local consumer so far.
    pub fn fwd_cnt(&self) -> u32 {
        self.fwd_cnt
    }

    /// The receive buffer space we advertise.
    pub fn buf_alloc(&self) -> u32 {
        self.buf_alloc
    }

    /// The number of payload bytes sent to the peer so far.
    pub fn tx_cnt(&self) -> u32 {
        self.tx_cnt
    }

    /// The last receive buffer size the peer advertised.
    pub fn peer_buf_alloc(&self) -> u32 {
        self.peer_buf_alloc
    }

    /// The last forward count the peer advertised.
    pub fn peer_fwd_cnt(&self) -> u32 {
        self.peer_fwd_cnt
    }

    /// The current buffer sizing.
    pub fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes {
            size: self.buf_size,
            min: self.buf_size_min,
            max: self.buf_size_max,
        }
    }

    /// Sets the receive buffer size, widening the bounds if needed.
    pub fn set_buffer_size(&mut self, val: u64) {
        let val = clamp_buffer_size(val);
        if val < self.buf_size_min {
            self.buf_size_min = val;
        }
        if val > self.buf_size_max {
            self.buf_size_max = val;
        }
        self.buf_size = val;
        self.buf_alloc = val;
    }

    /// Sets the lower bound of the receive buffer size, raising the size if needed.
    pub fn set_min_buffer_size(&mut self, val: u64) {
        let val = clamp_buffer_size(val);
        if val > self.buf_size {
            self.buf_size = val;
        }
        self.buf_size_min = val;
    }

    /// Sets the upper bound of the receive buffer size, lowering the size if needed.
    pub fn set_max_buffer_size(&mut self, val: u64) {
        let val = clamp_buffer_size(val);
        if val < self.buf_size {
            self.buf_size = val;
        }
        self.buf_size_max = val;
    }
}

fn clamp_buffer_size(val: u64) -> u32 {
    val.min(u64::from(VIRTIO_VSOCK_MAX_BUF_SIZE)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_peer(peer_buf_alloc: u32) -> FlowControl {
        let mut credit = FlowControl::new(BufferSizes::default());
        credit.update_from_peer(peer_buf_alloc, 0);
        credit
    }

    #[test]
    fn credit_is_capped_by_peer_buffer() {
        let mut credit = with_peer(256);
        assert_eq!(credit.get_credit(300), 256);
        assert_eq!(credit.tx_cnt(), 256);
        assert!(!credit.has_space());
        assert_eq!(credit.get_credit(44), 0);

        // The peer grows its buffer.
        assert!(credit.update_from_peer(300, 0));
        assert_eq!(credit.get_credit(44), 44);
        assert_eq!(credit.peer_free(), 0);
    }

    #[test]
    fn forwarded_bytes_free_credit() {
        let mut credit = with_peer(100);
        assert_eq!(credit.get_credit(100), 100);
        assert!(credit.update_from_peer(100, 60));
        assert_eq!(credit.peer_free(), 60);
        // Space was already available, so this is not news.
        assert!(!credit.update_from_peer(100, 70));
    }

    #[test]
    fn put_credit_rolls_back() {
        let mut credit = with_peer(64);
        let granted = credit.get_credit(64);
        credit.put_credit(granted);
        assert_eq!(credit.tx_cnt(), 0);
        assert_eq!(credit.peer_free(), 64);
    }

    #[test]
    fn shrunk_peer_buffer_gives_no_credit() {
        let mut credit = with_peer(100);
        assert_eq!(credit.get_credit(100), 100);
        assert!(!credit.update_from_peer(10, 0));
        assert_eq!(credit.peer_free(), 0);
        assert_eq!(credit.get_credit(50), 0);
    }

    #[test]
    fn counters_wrap() {
        let mut credit = FlowControl::new(BufferSizes::default());
        credit.tx_cnt = u32::MAX - 10;
        credit.update_from_peer(100, u32::MAX - 30);
        assert_eq!(credit.peer_free(), 80);
        assert_eq!(credit.get_credit(50), 50);
        assert_eq!(credit.tx_cnt(), 39);
        assert_eq!(credit.peer_free(), 30);
    }

    #[test]
    fn credit_never_oversubscribes() {
        let mut credit = FlowControl::new(BufferSizes::default());
        let mut peer_fwd_cnt = 0u32;
        let mut seed = 0x2545_f491_u32;
        for round in 0..2000u32 {
            // xorshift
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 3 {
                0 => {
                    credit.get_credit(seed % 700);
                }
                1 => {
                    let in_flight = credit.tx_cnt().wrapping_sub(peer_fwd_cnt);
                    credit.put_credit(seed % (in_flight + 1));
                }
                _ => {
                    let in_flight = credit.tx_cnt().wrapping_sub(peer_fwd_cnt);
                    peer_fwd_cnt = peer_fwd_cnt.wrapping_add(seed % (in_flight + 1));
                    credit.update_from_peer(512 + round, peer_fwd_cnt);
                }
            }
            let in_flight = credit.tx_cnt().wrapping_sub(credit.peer_fwd_cnt());
            assert!(
                in_flight <= credit.peer_buf_alloc(),
                "round {round}: {in_flight} in flight, peer has {}",
                credit.peer_buf_alloc()
            );
        }
    }

    #[test]
    fn receive_accounting() {
        let mut credit = FlowControl::new(BufferSizes {
            size: 16,
            min: 8,
            max: 32,
        });
        assert!(credit.can_receive(16));
        assert!(!credit.can_receive(17));
        credit.record_received(10);
        assert!(!credit.can_receive(7));
        credit.record_consumed(4);
        assert_eq!(credit.rx_bytes(), 6);
        assert_eq!(credit.fwd_cnt(), 4);

        let mut hdr = VirtioVsockHdr::default();
        credit.stamp(&mut hdr);
        assert_eq!(hdr.buf_alloc.get(), 16);
        assert_eq!(hdr.fwd_cnt.get(), 4);
    }

    #[test]
    fn buffer_size_bounds() {
        let mut credit = FlowControl::new(BufferSizes {
            size: 1000,
            min: 100,
            max: 2000,
        });
        credit.set_buffer_size(50);
        assert_eq!(
            credit.buffer_sizes(),
            BufferSizes {
                size: 50,
                min: 50,
                max: 2000
            }
        );
        assert_eq!(credit.buf_alloc(), 50);

        credit.set_min_buffer_size(500);
        assert_eq!(credit.buffer_sizes().size, 500);
        credit.set_max_buffer_size(200);
        assert_eq!(credit.buffer_sizes().size, 200);
        assert_eq!(credit.buffer_sizes().max, 200);

        credit.set_buffer_size(u64::MAX);
        assert_eq!(credit.buffer_sizes().size, VIRTIO_VSOCK_MAX_BUF_SIZE);
        assert_eq!(credit.buffer_sizes().max, VIRTIO_VSOCK_MAX_BUF_SIZE);
    }
}
