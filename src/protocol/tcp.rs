//! TCP module: header dissection, session tracking, segment reassembly.
//!
//! Beyond lifting header fields, this module keys every packet into a
//! bidirectional session (canonicalized 4-tuple), runs the 3-way-handshake
//! state machine, validates sequence continuity per direction, buffers
//! out-of-order segments, and re-stitches them once the gap fills. Sessions
//! live in a TTL table stepped by packet timestamps; idle flows expire
//! after [`SESSION_TTL`] seconds.

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;

use bytes::BytesMut;
use etherparse::TcpHeaderSlice;
use tracing::{debug, trace};

use crate::cache::TtlMap;
use crate::decoder::{EventId, Module, ModuleId, ParamId, Registrar};
use crate::packet::Payload;
use crate::property::Property;
use crate::value::Endian;

/// TCP flag bits.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// Seconds of inactivity before a session is reclaimed.
pub const SESSION_TTL: u32 = 300;

const TABLE_WHEEL_SECS: usize = 3600;
const TABLE_CAPACITY: usize = 0x10000;

const FIXED_HEADER_LEN: usize = 20;

/// Direction-independent session key: the lesser `(addr, port)` endpoint
/// leads, so both directions of a flow map to the same entry.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct SessionKey {
    addr_a: IpAddr,
    port_a: u16,
    addr_b: IpAddr,
    port_b: u16,
}

impl SessionKey {
    fn new(src_addr: IpAddr, src_port: u16, dst_addr: IpAddr, dst_port: u16) -> Self {
        if (src_addr, src_port) <= (dst_addr, dst_port) {
            Self {
                addr_a: src_addr,
                port_a: src_port,
                addr_b: dst_addr,
                port_b: dst_port,
            }
        } else {
            Self {
                addr_a: dst_addr,
                port_a: dst_port,
                addr_b: src_addr,
                port_b: src_port,
            }
        }
    }
}

/// Which endpoint of a session sent the packet. The client is whoever
/// sourced the first packet of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Session lifecycle, driven by the flag/direction rules of the
/// 3-way handshake and the FIN exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    None,
    SynSent,
    SynAckSent,
    Established,
    Closing,
    Closed,
}

/// One direction of a TCP flow.
#[derive(Debug)]
struct Stream {
    addr: IpAddr,
    port: u16,
    has_base_seq: bool,
    base_seq: u32,
    /// Next expected sequence, relative to `base_seq`.
    next_seq: u32,
    ack: u32,
    win_size: u16,
    /// Bytes this direction has sent in order.
    tx_size: u64,
}

impl Stream {
    fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            has_base_seq: false,
            base_seq: 0,
            next_seq: 0,
            ack: 0,
            win_size: 0,
            tx_size: 0,
        }
    }

    fn matches(&self, addr: IpAddr, port: u16) -> bool {
        self.addr == addr && self.port == port
    }

    fn set_base_seq(&mut self, seq: u32, seg_len: usize) {
        self.has_base_seq = true;
        self.base_seq = seq;
        // SYN consumes one sequence number.
        self.next_seq = 1u32.wrapping_add(seg_len as u32);
    }

    fn inc_seq(&mut self) {
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    fn rel_seq(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.base_seq)
    }

    fn in_window(&self, seq: u32) -> bool {
        let rel_seq = seq.wrapping_sub(self.base_seq);
        let rel_ack = self.ack.wrapping_sub(self.base_seq);
        trace!(
            rel_seq,
            next = self.next_seq,
            win = self.win_size,
            rel_ack,
            "window check"
        );
        // Proper validation needs window-scale option tracking, which is
        // out of scope; everything is treated as in-window.
        true
    }

    /// Validate a segment leaving this direction. Before the base sequence
    /// is known (SYN / SYN-ACK) everything is accepted; afterward only the
    /// exact next expected relative sequence advances the stream.
    fn send(&mut self, seq: u32, seg_len: usize) -> bool {
        if !self.has_base_seq {
            return true;
        }
        if self.rel_seq(seq) == self.next_seq {
            self.next_seq = self.next_seq.wrapping_add(seg_len as u32);
            self.tx_size += seg_len as u64;
            true
        } else {
            false
        }
    }

    /// Record what the peer acknowledged toward this direction.
    fn recv(&mut self, ack: u32, win_size: u16) {
        self.ack = ack;
        self.win_size = win_size;
    }
}

/// An out-of-order segment parked until its gap fills.
#[derive(Debug)]
struct Segment {
    seq: u32,
    flags: u8,
    data: Vec<u8>,
}

/// Parameter and event ids the session logic needs; copied out of the
/// module before the session table is borrowed.
#[derive(Debug, Clone, Copy, Default)]
struct SessionIds {
    p_data: ParamId,
    p_rtt_3wh: ParamId,
    p_tx_server: ParamId,
    p_tx_client: ParamId,
    p_id: ParamId,
    ev_estb: EventId,
    ev_close: EventId,
}

/// A tracked bidirectional TCP session.
struct Session {
    id: u64,
    status: Status,
    client: Stream,
    server: Stream,
    /// Which side sent the first FIN.
    closing: Option<Side>,
    ts_init_us: i64,
    ts_estb_us: i64,
    rtt_us: u32,
    /// Out-of-order segments by relative sequence; same-key arrivals
    /// chain in arrival order.
    seg_map: BTreeMap<u32, Vec<Segment>>,
}

impl Session {
    fn new(id: u64, src_addr: IpAddr, src_port: u16, dst_addr: IpAddr, dst_port: u16) -> Self {
        Self {
            id,
            status: Status::None,
            client: Stream::new(src_addr, src_port),
            server: Stream::new(dst_addr, dst_port),
            closing: None,
            ts_init_us: 0,
            ts_estb_us: 0,
            rtt_us: 0,
            seg_map: BTreeMap::new(),
        }
    }

    fn stream(&self, side: Side) -> &Stream {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn stream_mut(&mut self, side: Side) -> &mut Stream {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Run one packet of this session through validation, state tracking
    /// and reassembly, annotating the property as it goes.
    #[allow(clippy::too_many_arguments)]
    fn process<'p>(
        &mut self,
        prop: &mut Property<'p>,
        ids: SessionIds,
        fl: u8,
        seq: u32,
        ack: u32,
        seg: &'p [u8],
        win: u16,
        ts_us: i64,
    ) {
        let side = match prop.src_addr() {
            Some(addr) if self.client.matches(addr, prop.src_port()) => Side::Client,
            _ => Side::Server,
        };

        let mut reass: Option<BytesMut> = None;
        let ok = self.apply_segment(prop, ids, side, fl, seq, ack, seg, win, ts_us, &mut reass);

        if ok {
            self.walk_stored(prop, ids, side, ack, seg, win, ts_us, &mut reass);
            match reass {
                Some(buf) => prop.retain_value(ids.p_data).share(buf.freeze()),
                None => prop.retain_value(ids.p_data).set(seg),
            }
        }

        let tx_server = self.client.tx_size;
        let tx_client = self.server.tx_size;
        prop.retain_value(ids.p_tx_server)
            .cpy(&tx_server.to_le_bytes(), Endian::Little);
        prop.retain_value(ids.p_tx_client)
            .cpy(&tx_client.to_le_bytes(), Endian::Little);
    }

    /// Validate one segment and, on success, feed the state machine and
    /// append to the reassembly buffer when one is live. On failure the
    /// segment is parked in the out-of-order map.
    #[allow(clippy::too_many_arguments)]
    fn apply_segment(
        &mut self,
        prop: &mut Property<'_>,
        ids: SessionIds,
        side: Side,
        fl: u8,
        seq: u32,
        ack: u32,
        data: &[u8],
        win: u16,
        ts_us: i64,
        reass: &mut Option<BytesMut>,
    ) -> bool {
        let seg_len = data.len();
        let sender = self.stream_mut(side);
        if !sender.send(seq, seg_len) {
            if sender.in_window(seq) {
                let rel = sender.rel_seq(seq);
                debug!(session = self.id, rel_seq = rel, len = seg_len, "out-of-order segment stored");
                self.seg_map.entry(rel).or_default().push(Segment {
                    seq,
                    flags: fl,
                    data: data.to_vec(),
                });
            }
            return false;
        }
        self.stream_mut(side.other()).recv(ack, win);

        match self.transition(fl, side, seq, seg_len, ts_us) {
            Some(Status::Established) => {
                prop.push_event(ids.ev_estb);
                prop.retain_value(ids.p_rtt_3wh)
                    .cpy(&self.rtt_us.to_le_bytes(), Endian::Little);
            }
            Some(Status::Closed) => prop.push_event(ids.ev_close),
            _ => {}
        }

        if let Some(buf) = reass.as_mut() {
            buf.extend_from_slice(data);
        }
        true
    }

    /// Replay parked segments that the advancing stream has uncovered,
    /// in stored order, materializing the reassembly buffer on first hit.
    #[allow(clippy::too_many_arguments)]
    fn walk_stored(
        &mut self,
        prop: &mut Property<'_>,
        ids: SessionIds,
        side: Side,
        ack: u32,
        live_seg: &[u8],
        win: u16,
        ts_us: i64,
        reass: &mut Option<BytesMut>,
    ) {
        let mut queue: VecDeque<Segment> = VecDeque::new();
        let next = self.stream(side).next_seq;
        if let Some(chain) = self.seg_map.remove(&next) {
            debug!(session = self.id, "stored segment chain matched");
            let mut buf = BytesMut::new();
            buf.extend_from_slice(live_seg);
            *reass = Some(buf);
            queue.extend(chain);
        }

        while let Some(stored) = queue.pop_front() {
            let ok = self.apply_segment(
                prop,
                ids,
                side,
                stored.flags,
                stored.seq,
                ack,
                &stored.data,
                win,
                ts_us,
                reass,
            );
            if ok {
                // A consumed segment may uncover the next chain; it runs
                // before whatever is still queued.
                let next = self.stream(side).next_seq;
                if let Some(more) = self.seg_map.remove(&next) {
                    for seg in more.into_iter().rev() {
                        queue.push_front(seg);
                    }
                }
            }
        }
    }

    /// State machine. Returns the new status when a rule matched; a
    /// flags/status combination with no rule leaves the session unchanged.
    fn transition(
        &mut self,
        fl: u8,
        side: Side,
        seq: u32,
        seg_len: usize,
        ts_us: i64,
    ) -> Option<Status> {
        match self.status {
            Status::None if fl == flags::SYN && side == Side::Client => {
                debug!(session = self.id, "SYN");
                self.status = Status::SynSent;
                self.ts_init_us = ts_us;
                self.client.set_base_seq(seq, seg_len);
                Some(Status::SynSent)
            }
            Status::SynSent if fl == flags::SYN | flags::ACK && side == Side::Server => {
                debug!(session = self.id, "SYN-ACK");
                self.status = Status::SynAckSent;
                self.server.set_base_seq(seq, seg_len);
                Some(Status::SynAckSent)
            }
            Status::SynAckSent if fl == flags::ACK && side == Side::Client => {
                debug!(session = self.id, "established");
                self.status = Status::Established;
                self.ts_estb_us = ts_us;
                self.rtt_us =
                    u32::try_from(self.ts_estb_us - self.ts_init_us).unwrap_or(u32::MAX);
                Some(Status::Established)
            }
            Status::Established if fl & flags::FIN != 0 => {
                debug!(session = self.id, "FIN");
                self.status = Status::Closing;
                self.closing = Some(side);
                // FIN consumes one sequence number.
                self.stream_mut(side).inc_seq();
                Some(Status::Closing)
            }
            Status::Closing if fl & flags::FIN != 0 && self.closing != Some(side) => {
                debug!(session = self.id, "closed");
                self.status = Status::Closed;
                self.stream_mut(side).inc_seq();
                Some(Status::Closed)
            }
            _ => None,
        }
    }
}

/// TCP transport module. Terminal in the default chain.
pub struct TcpModule {
    p_src_port: ParamId,
    p_dst_port: ParamId,
    p_seq: ParamId,
    p_ack: ParamId,
    p_offset: ParamId,
    p_flags: ParamId,
    p_window: ParamId,
    p_chksum: ParamId,
    p_urgptr: ParamId,
    p_flag_fin: ParamId,
    p_flag_syn: ParamId,
    p_flag_rst: ParamId,
    p_flag_push: ParamId,
    p_flag_ack: ParamId,
    p_flag_urg: ParamId,
    p_flag_ece: ParamId,
    p_flag_cwr: ParamId,
    p_optdata: ParamId,
    p_segment: ParamId,
    ids: SessionIds,
    ev_new: EventId,
    table: TtlMap<SessionKey, Session>,
    ssn_count: u64,
    curr_ts: i64,
    ts_seen: bool,
}

impl TcpModule {
    pub fn new() -> Self {
        Self {
            p_src_port: ParamId::default(),
            p_dst_port: ParamId::default(),
            p_seq: ParamId::default(),
            p_ack: ParamId::default(),
            p_offset: ParamId::default(),
            p_flags: ParamId::default(),
            p_window: ParamId::default(),
            p_chksum: ParamId::default(),
            p_urgptr: ParamId::default(),
            p_flag_fin: ParamId::default(),
            p_flag_syn: ParamId::default(),
            p_flag_rst: ParamId::default(),
            p_flag_push: ParamId::default(),
            p_flag_ack: ParamId::default(),
            p_flag_urg: ParamId::default(),
            p_flag_ece: ParamId::default(),
            p_flag_cwr: ParamId::default(),
            p_optdata: ParamId::default(),
            p_segment: ParamId::default(),
            ids: SessionIds::default(),
            ev_new: EventId::default(),
            table: TtlMap::new(TABLE_WHEEL_SECS, TABLE_CAPACITY),
            ssn_count: 0,
            curr_ts: 0,
            ts_seen: false,
        }
    }

    /// Step the session table along the capture clock. Time never moves
    /// backward; the first packet only anchors the clock.
    fn advance_clock(&mut self, ts_us: i64) {
        let ts = ts_us / 1_000_000;
        if !self.ts_seen {
            self.ts_seen = true;
            self.curr_ts = ts;
            return;
        }
        if ts > self.curr_ts {
            self.table.step((ts - self.curr_ts) as u64);
            self.curr_ts = ts;
        }
    }
}

impl Default for TcpModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for TcpModule {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn declare(&mut self, reg: &mut Registrar<'_>) {
        self.p_src_port = reg.define_param("src_port");
        self.p_dst_port = reg.define_param("dst_port");
        self.p_seq = reg.define_param("seq");
        self.p_ack = reg.define_param("ack");
        self.p_offset = reg.define_param("offset");
        self.p_flags = reg.define_param("flags");
        self.p_window = reg.define_param("window");
        self.p_chksum = reg.define_param("chksum");
        self.p_urgptr = reg.define_param("urgptr");

        self.p_flag_fin = reg.define_param("flag_fin");
        self.p_flag_syn = reg.define_param("flag_syn");
        self.p_flag_rst = reg.define_param("flag_rst");
        self.p_flag_push = reg.define_param("flag_push");
        self.p_flag_ack = reg.define_param("flag_ack");
        self.p_flag_urg = reg.define_param("flag_urg");
        self.p_flag_ece = reg.define_param("flag_ece");
        self.p_flag_cwr = reg.define_param("flag_cwr");

        self.p_optdata = reg.define_param("optdata");
        self.p_segment = reg.define_param("segment");

        self.ids = SessionIds {
            p_data: reg.define_param("data"),
            p_rtt_3wh: reg.define_param("rtt_3wh"),
            p_tx_server: reg.define_param("tx_server"),
            p_tx_client: reg.define_param("tx_client"),
            p_id: reg.define_param("id"),
            ev_estb: reg.define_event("established"),
            ev_close: reg.define_event("closed"),
        };
        self.ev_new = reg.define_event("new_session");
    }

    fn decode<'p>(
        &mut self,
        payload: &mut Payload<'p>,
        prop: &mut Property<'p>,
    ) -> Option<ModuleId> {
        let tcp = TcpHeaderSlice::from_slice(payload.remaining()).ok()?;
        let header = payload.retain(FIXED_HEADER_LEN)?;

        prop.set_src_port(tcp.source_port());
        prop.set_dst_port(tcp.destination_port());

        prop.retain_value(self.p_src_port).set(&header[0..2]);
        prop.retain_value(self.p_dst_port).set(&header[2..4]);
        prop.retain_value(self.p_seq).set(&header[4..8]);
        prop.retain_value(self.p_ack).set(&header[8..12]);
        prop.retain_value(self.p_flags).set(&header[13..14]);
        prop.retain_value(self.p_window).set(&header[14..16]);
        prop.retain_value(self.p_chksum).set(&header[16..18]);
        prop.retain_value(self.p_urgptr).set(&header[18..20]);

        let header_len = tcp.slice().len();
        prop.retain_value(self.p_offset)
            .cpy(&[header_len as u8], Endian::Little);

        let raw_flags = header[13];
        for (param, bit) in [
            (self.p_flag_fin, flags::FIN),
            (self.p_flag_syn, flags::SYN),
            (self.p_flag_rst, flags::RST),
            (self.p_flag_push, flags::PSH),
            (self.p_flag_ack, flags::ACK),
            (self.p_flag_urg, flags::URG),
            (self.p_flag_ece, flags::ECE),
            (self.p_flag_cwr, flags::CWR),
        ] {
            prop.retain_value(param)
                .cpy(&[(raw_flags & bit != 0) as u8], Endian::Little);
        }

        let optlen = header_len - FIXED_HEADER_LEN;
        if optlen > 0 {
            let opt = payload.retain(optlen)?;
            prop.retain_value(self.p_optdata).set(opt);
        }

        let seg_len = payload.len();
        let seg = payload.retain(seg_len)?;
        if seg_len > 0 {
            prop.retain_value(self.p_segment).set(seg);
        }

        self.advance_clock(prop.ts_us());
        while self.table.has_expired() {
            if let Some(old) = self.table.pop_expired() {
                debug!(session = old.id, "session expired");
            }
        }

        // TCP under a chain that never set the addresses is a
        // configuration accident; there is no flow to track.
        let src_addr = prop.src_addr()?;
        let dst_addr = prop.dst_addr()?;
        let key = SessionKey::new(src_addr, prop.src_port(), dst_addr, prop.dst_port());

        let fl = raw_flags & (flags::FIN | flags::SYN | flags::RST | flags::ACK);
        let seq = tcp.sequence_number();
        let ack = tcp.acknowledgment_number();
        let win = tcp.window_size();

        if self.table.get(&key).is_none() {
            self.ssn_count += 1;
            debug!(session = self.ssn_count, "new session");
            let ssn = Session::new(
                self.ssn_count,
                src_addr,
                prop.src_port(),
                dst_addr,
                prop.dst_port(),
            );
            self.table.put(SESSION_TTL, key.clone(), ssn);
            prop.push_event(self.ev_new);
        }

        let ids = self.ids;
        let ts_us = prop.ts_us();
        if let Some(ssn) = self.table.get_mut(&key) {
            prop.retain_value(ids.p_id)
                .cpy(&ssn.id.to_le_bytes(), Endian::Little);
            ssn.process(prop, ids, fl, seq, ack, seg, win, ts_us);
        }
        // Activity pushes expiry forward.
        self.table.touch(SESSION_TTL, &key);

        None
    }
}
