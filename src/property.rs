//! Per-packet key/value record shared by modules and handlers.

use std::net::IpAddr;

use smallvec::SmallVec;

use crate::decoder::{EventId, ParamId};
use crate::packet::Packet;
use crate::value::Value;

/// Scratch record for one decode pass.
///
/// Lower layers write the directional addressing (an IP module sets the
/// addresses, a transport module the ports) and every module deposits its
/// parameter values and fired events here. Handlers receive it read-only
/// after the walk completes; the borrow ties it to the packet, so nothing
/// can outlive the decode pass.
pub struct Property<'p> {
    pkt: &'p Packet,
    src_addr: Option<IpAddr>,
    dst_addr: Option<IpAddr>,
    src_port: u16,
    dst_port: u16,
    slots: Vec<Option<Value<'p>>>,
    events: SmallVec<[EventId; 8]>,
}

impl<'p> Property<'p> {
    /// Create the record for one packet. `param_count` is the decoder's
    /// global parameter count and sizes the slot table.
    pub fn new(pkt: &'p Packet, param_count: usize) -> Self {
        Self {
            pkt,
            src_addr: None,
            dst_addr: None,
            src_port: 0,
            dst_port: 0,
            slots: vec![None; param_count],
            events: SmallVec::new(),
        }
    }

    pub fn packet(&self) -> &'p Packet {
        self.pkt
    }

    /// Capture timestamp in microseconds since the Unix epoch.
    pub fn ts_us(&self) -> i64 {
        self.pkt.ts_us()
    }

    /// Mutable slot for a parameter, materialized on first touch.
    pub fn retain_value(&mut self, id: ParamId) -> &mut Value<'p> {
        self.slots[id.index()].get_or_insert_with(Value::default)
    }

    /// Read a parameter value; `None` when no module touched the slot.
    pub fn value(&self, id: ParamId) -> Option<&Value<'p>> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Append a fired event.
    pub fn push_event(&mut self, id: EventId) {
        self.events.push(id);
    }

    /// Number of events fired so far.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// The `i`-th fired event, in push order.
    ///
    /// # Panics
    ///
    /// Panics when `i >= event_count()`.
    pub fn event(&self, i: usize) -> EventId {
        self.events[i]
    }

    pub fn set_src_addr(&mut self, addr: IpAddr) {
        self.src_addr = Some(addr);
    }

    pub fn set_dst_addr(&mut self, addr: IpAddr) {
        self.dst_addr = Some(addr);
    }

    pub fn src_addr(&self) -> Option<IpAddr> {
        self.src_addr
    }

    pub fn dst_addr(&self) -> Option<IpAddr> {
        self.dst_addr
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.src_port = port;
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.dst_port = port;
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }
}
