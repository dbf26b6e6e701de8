//! Captured frames and the decode-time byte cursor.

/// A captured link-layer frame.
///
/// Packets are pool-allocated by the [`Channel`](crate::channel::Channel):
/// the producer obtains one with `retain()`, fills it, and pushes it; the
/// consumer pulls, decodes, and releases it back to the pool. The backing
/// `Vec` survives the round trip, so steady-state capture allocates nothing.
#[derive(Debug, Default)]
pub struct Packet {
    data: Vec<u8>,
    cap_len: usize,
    wire_len: usize,
    ts_us: i64,
}

impl Packet {
    /// Load a captured frame into this packet, reusing the buffer.
    ///
    /// `wire_len` is the original length on the wire, which may exceed the
    /// captured bytes when the capture was truncated. `ts_us` is the capture
    /// timestamp in microseconds since the Unix epoch.
    pub fn fill(&mut self, bytes: &[u8], wire_len: usize, ts_us: i64) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.cap_len = bytes.len();
        self.wire_len = wire_len;
        self.ts_us = ts_us;
    }

    /// The captured bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.cap_len]
    }

    /// Captured length (may be less than original).
    pub fn cap_len(&self) -> usize {
        self.cap_len
    }

    /// Original packet length on the wire.
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    /// Capture timestamp in microseconds since the Unix epoch.
    pub fn ts_us(&self) -> i64 {
        self.ts_us
    }

    /// Check if the packet was truncated during capture.
    pub fn is_truncated(&self) -> bool {
        self.cap_len < self.wire_len
    }
}

/// Cursor over a packet's remaining bytes during one decode pass.
///
/// Views handed out by [`retain`](Payload::retain) and
/// [`remaining`](Payload::remaining) borrow the packet directly, so modules
/// can stash them in [`Value`](crate::value::Value) slots without copying.
#[derive(Debug)]
pub struct Payload<'p> {
    data: &'p [u8],
    pos: usize,
}

impl<'p> Payload<'p> {
    pub fn new(pkt: &'p Packet) -> Self {
        Self {
            data: pkt.data(),
            pos: 0,
        }
    }

    /// Advance the cursor by `n` bytes and return the view, or `None` if
    /// fewer than `n` bytes remain.
    pub fn retain(&mut self, n: usize) -> Option<&'p [u8]> {
        if self.data.len() - self.pos < n {
            return None;
        }
        let view = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(view)
    }

    /// Peek at everything past the cursor without advancing.
    pub fn remaining(&self) -> &'p [u8] {
        &self.data[self.pos..]
    }

    /// Bytes left past the cursor.
    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Limit the view to the next `n` bytes.
    ///
    /// Network layers use this to drop link-layer padding: an IP module
    /// trims the payload to the datagram's total length so the transport
    /// layer never sees trailing Ethernet fill bytes.
    pub fn truncate(&mut self, n: usize) {
        let end = (self.pos + n).min(self.data.len());
        self.data = &self.data[..end];
    }
}
