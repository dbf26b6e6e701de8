//! Protocol modules.
//!
//! Each module dissects one layer: it lifts header fields into the
//! property record as named parameters and tells the decoder where the
//! payload goes next. The default chain is Ethernet → IPv4 → {TCP, UDP},
//! with TCP carrying the session tracker and segment reassembler.

mod ethernet;
mod ipv4;
mod tcp;
mod udp;

pub use ethernet::EthernetModule;
pub use ipv4::Ipv4Module;
pub use tcp::TcpModule;
pub use udp::UdpModule;
