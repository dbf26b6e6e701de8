//! End-to-end TCP session scenarios over full Ethernet/IPv4 frames.

use std::sync::{Arc, Mutex};

use dissect::{Decoder, EthernetModule, Ipv4Module, Kernel, Packet, Payload, Property, TcpModule, UdpModule};

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const ACK: u8 = 0x10;

/// Hand-built Ethernet + IPv4 + TCP frame. Checksums are left zero; the
/// slice parsers do not validate them.
#[allow(clippy::too_many_arguments)]
fn frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    fl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut f = Vec::with_capacity(54 + payload.len());
    // Ethernet II
    f.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // dst mac
    f.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]); // src mac
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    // IPv4, 20-byte header
    let total_len = (20 + 20 + payload.len()) as u16;
    f.push(0x45);
    f.push(0x00);
    f.extend_from_slice(&total_len.to_be_bytes());
    f.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // id, flags/frag
    f.push(64); // ttl
    f.push(6); // protocol: tcp
    f.extend_from_slice(&[0x00, 0x00]); // checksum
    f.extend_from_slice(&src);
    f.extend_from_slice(&dst);
    // TCP, 20-byte header
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&ack.to_be_bytes());
    f.push(0x50); // data offset: 5 words
    f.push(fl);
    f.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    f.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // checksum, urgptr
    f.extend_from_slice(payload);
    f
}

const CLIENT: [u8; 4] = [192, 168, 0, 10];
const SERVER: [u8; 4] = [10, 0, 0, 80];

fn client_frame(seq: u32, ack: u32, fl: u8, payload: &[u8]) -> Vec<u8> {
    frame(CLIENT, SERVER, 40000, 80, seq, ack, fl, payload)
}

fn server_frame(seq: u32, ack: u32, fl: u8, payload: &[u8]) -> Vec<u8> {
    frame(SERVER, CLIENT, 80, 40000, seq, ack, fl, payload)
}

/// Decoder-level harness: decode frames one by one and look at what each
/// packet exposed.
struct Bench {
    dec: Decoder,
}

impl Bench {
    fn new() -> Self {
        let mut dec = Decoder::new();
        dec.register(EthernetModule::default()).unwrap();
        dec.register(Ipv4Module::default()).unwrap();
        dec.register(UdpModule::default()).unwrap();
        dec.register(TcpModule::new()).unwrap();
        dec.setup().unwrap();
        Self { dec }
    }

    /// Returns (event names, tcp.data bytes if set).
    fn decode(&mut self, bytes: &[u8], ts_us: i64) -> (Vec<String>, Option<Vec<u8>>) {
        let mut pkt = Packet::default();
        pkt.fill(bytes, bytes.len(), ts_us);
        let mut pd = Payload::new(&pkt);
        let mut prop = Property::new(&pkt, self.dec.param_count());
        self.dec.decode(&mut pd, &mut prop);

        let events = (0..prop.event_count())
            .map(|i| self.dec.event_def(prop.event(i)).unwrap().name().to_string())
            .collect();
        let data = prop
            .value(self.dec.param_id("tcp.data").unwrap())
            .map(|v| v.bytes().to_vec());
        (events, data)
    }
}

#[test]
fn test_clean_handshake_through_kernel() {
    let mut kernel = Kernel::new().unwrap();
    let p_rtt = kernel.decoder().param_id("tcp.rtt_3wh").unwrap();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let log = Arc::clone(&log);
        kernel.on("new_session", move |_| log.lock().unwrap().push("new_session".into()));
    }
    {
        let log = Arc::clone(&log);
        kernel.on("established", move |prop| {
            let rtt = prop.value(p_rtt).and_then(|v| v.u32()).unwrap();
            log.lock().unwrap().push(format!("established rtt={rtt}"));
        });
    }

    let running = kernel.start();
    let ch = running.channel();

    let frames = [
        (client_frame(1000, 0, SYN, &[]), 1_000_000i64),
        (server_frame(5000, 1001, SYN | ACK, &[]), 1_000_250),
        (client_frame(1001, 5001, ACK, &[]), 1_000_500),
    ];
    let mut total_bytes = 0u64;
    for (bytes, ts) in &frames {
        let mut pkt = ch.retain();
        pkt.fill(bytes, bytes.len(), *ts);
        total_bytes += bytes.len() as u64;
        ch.push(pkt);
    }
    ch.close();

    let kernel = running.join();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["new_session".to_string(), "established rtt=500".to_string()]
    );
    assert_eq!(kernel.recv_pkt(), 3);
    assert_eq!(kernel.recv_size(), total_bytes);
}

#[test]
fn test_out_of_order_stream_fills_gap() {
    let mut bench = Bench::new();

    bench.decode(&client_frame(1000, 0, SYN, &[]), 1_000_000);
    bench.decode(&server_frame(5000, 1001, SYN | ACK, &[]), 1_001_000);
    bench.decode(&client_frame(1001, 5001, ACK, &[]), 1_002_000);

    let block_a: Vec<u8> = (0u32..100).map(|i| i as u8).collect();
    let block_b: Vec<u8> = (100u32..200).map(|i| i as u8).collect();
    let block_c: Vec<u8> = (200u32..300).map(|i| (i % 256) as u8).collect();

    let mut established = 0usize;
    let mut stream: Vec<u8> = Vec::new();

    // seq 1001..1100, then 1201..1300, then the 1101..1200 gap filler.
    for (f, ts) in [
        (client_frame(1001, 5001, ACK, &block_a), 1_003_000),
        (client_frame(1201, 5001, ACK, &block_c), 1_004_000),
        (client_frame(1101, 5001, ACK, &block_b), 1_005_000),
    ] {
        let (events, data) = bench.decode(&f, ts);
        established += events.iter().filter(|e| *e == "established").count();
        if let Some(d) = data {
            stream.extend_from_slice(&d);
        }
    }

    let mut expect = block_a.clone();
    expect.extend_from_slice(&block_b);
    expect.extend_from_slice(&block_c);
    assert_eq!(stream, expect, "handlers must observe a contiguous stream");
    assert_eq!(established, 0, "established must not fire again");
}

#[test]
fn test_orderly_close_fires_once() {
    let mut bench = Bench::new();

    bench.decode(&client_frame(1000, 0, SYN, &[]), 1_000_000);
    bench.decode(&server_frame(5000, 1001, SYN | ACK, &[]), 1_001_000);
    bench.decode(&client_frame(1001, 5001, ACK, &[]), 1_002_000);

    let (events, _) = bench.decode(&client_frame(1001, 5001, FIN | ACK, &[]), 1_003_000);
    assert!(events.is_empty());

    let (events, _) = bench.decode(&server_frame(5001, 1002, FIN | ACK, &[]), 1_004_000);
    assert_eq!(events, vec!["closed".to_string()]);

    // Nothing more after CLOSED.
    let (events, _) = bench.decode(&client_frame(1002, 5002, ACK, &[]), 1_005_000);
    assert!(events.is_empty());
}

#[test]
fn test_idle_session_expires() {
    let mut bench = Bench::new();

    let (events, _) = bench.decode(&client_frame(1000, 0, SYN, &[]), 1_000_000);
    assert_eq!(events, vec!["new_session".to_string()]);

    // A packet on an unrelated flow 301 seconds later reclaims the idle
    // session before its own lookup.
    let other = frame([172, 16, 0, 1], [172, 16, 0, 2], 1234, 80, 9000, 0, SYN, &[]);
    let (events, _) = bench.decode(&other, 302_000_000);
    assert_eq!(events, vec!["new_session".to_string()]);

    // The original 4-tuple is a brand-new session again.
    let (events, _) = bench.decode(&client_frame(1000, 0, SYN, &[]), 303_000_000);
    assert_eq!(events, vec!["new_session".to_string()]);
}

#[test]
fn test_udp_and_tcp_share_the_chain() {
    let mut bench = Bench::new();

    // A UDP datagram takes the other branch and exposes udp params.
    let mut udp_frame = Vec::new();
    udp_frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    udp_frame.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    udp_frame.extend_from_slice(&0x0800u16.to_be_bytes());
    udp_frame.push(0x45);
    udp_frame.push(0x00);
    udp_frame.extend_from_slice(&32u16.to_be_bytes()); // 20 ip + 8 udp + 4 data
    udp_frame.extend_from_slice(&[0, 0, 0, 0]);
    udp_frame.push(64);
    udp_frame.push(17); // udp
    udp_frame.extend_from_slice(&[0, 0]);
    udp_frame.extend_from_slice(&CLIENT);
    udp_frame.extend_from_slice(&SERVER);
    udp_frame.extend_from_slice(&53u16.to_be_bytes());
    udp_frame.extend_from_slice(&5353u16.to_be_bytes());
    udp_frame.extend_from_slice(&12u16.to_be_bytes());
    udp_frame.extend_from_slice(&[0, 0]);
    udp_frame.extend_from_slice(&[1, 2, 3, 4]);

    let mut pkt = Packet::default();
    pkt.fill(&udp_frame, udp_frame.len(), 0);
    let mut pd = Payload::new(&pkt);
    let mut prop = Property::new(&pkt, bench.dec.param_count());
    bench.dec.decode(&mut pd, &mut prop);

    assert_eq!(prop.src_port(), 53);
    let data = prop.value(bench.dec.param_id("udp.data").unwrap()).unwrap();
    assert_eq!(data.bytes(), &[1, 2, 3, 4]);

    // And a TCP SYN still opens a session afterward.
    let (events, _) = bench.decode(&client_frame(1, 0, SYN, &[]), 0);
    assert_eq!(events, vec!["new_session".to_string()]);
}
