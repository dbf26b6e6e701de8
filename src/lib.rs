//! # dissect
//!
//! Streaming network-packet dissection engine.
//!
//! A capture producer feeds raw link-layer frames into a bounded channel;
//! a single decoder thread walks each packet through a chain of protocol
//! modules, populating a per-packet property record, tracking TCP session
//! state, and firing named events to user-registered handlers.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dissect::{Kernel, PcapFileSource};
//!
//! let mut kernel = Kernel::new().unwrap();
//! kernel.on("established", |prop| {
//!     println!("3-way handshake done, ports {} -> {}", prop.src_port(), prop.dst_port());
//! });
//!
//! let running = kernel.start();
//! let channel = running.channel();
//!
//! let mut source = PcapFileSource::open("capture.pcap").unwrap();
//! source.feed(&channel).unwrap(); // closes the channel at EOF
//!
//! let kernel = running.join();
//! println!("{} packets, {} bytes", kernel.recv_pkt(), kernel.recv_size());
//! ```
//!
//! Any producer works the same way: `channel.retain()` a packet, `fill` it
//! with frame bytes and a timestamp, `push` it, and `close()` when done.
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                            dissect                               |
//! +------------------------------------------------------------------+
//! |  channel/   - bounded SPSC hand-off with packet pool             |
//! |  packet/    - captured frames, decode-time byte cursor           |
//! |  decoder/   - module registry, param/event tables, decode walk   |
//! |  property/  - per-packet key/value record, fired events          |
//! |  value/     - zero-copy / owned / shared parameter values        |
//! |  kernel/    - consumer loop, event-to-handler fan-out, counters  |
//! |  protocol/  - Ethernet, IPv4, UDP, TCP (sessions + reassembly)   |
//! |  cache/     - TTL-wheel keyed table backing session expiry       |
//! |  pcap/      - classic pcap file producer                         |
//! |  error/     - error types                                        |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Events
//!
//! | Event         | Fired by | Meaning                                 |
//! |---------------|----------|-----------------------------------------|
//! | `new_session` | tcp      | first packet of a 4-tuple               |
//! | `established` | tcp      | 3-way handshake completed               |
//! | `closed`      | tcp      | both sides sent FIN                     |
//!
//! Custom modules can declare their own parameters and events; see
//! [`Module`].

pub mod cache;
pub mod channel;
pub mod decoder;
pub mod error;
pub mod kernel;
pub mod packet;
pub mod pcap;
pub mod property;
pub mod protocol;
pub mod value;

pub use cache::TtlMap;
pub use channel::Channel;
pub use decoder::{Decoder, EventId, Module, ModuleId, ParamId, Registrar, Resolver};
pub use error::{Error, PcapError, RegistrationError, Result};
pub use kernel::{HandlerId, Kernel, KernelControl, RunningKernel};
pub use packet::{Packet, Payload};
pub use pcap::{PcapFileSource, PcapSource};
pub use property::Property;
pub use protocol::{EthernetModule, Ipv4Module, TcpModule, UdpModule};
pub use value::{Endian, Value};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
