//! IPv4 module.

use std::net::{IpAddr, Ipv4Addr};

use etherparse::Ipv4HeaderSlice;

use crate::decoder::{Module, ModuleId, ParamId, Registrar, Resolver};
use crate::error::RegistrationError;
use crate::packet::Payload;
use crate::property::Property;
use crate::value::Endian;

/// IP protocol numbers carried in the IPv4 header.
pub mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 network-layer module. Sets the directional addresses upper layers
/// key their flows on, and trims link-layer padding off the payload.
#[derive(Default)]
pub struct Ipv4Module {
    p_src: ParamId,
    p_dst: ParamId,
    p_proto: ParamId,
    p_ttl: ParamId,
    p_tlen: ParamId,
    p_id: ParamId,
    tcp: Option<ModuleId>,
    udp: Option<ModuleId>,
}

impl Module for Ipv4Module {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn declare(&mut self, reg: &mut Registrar<'_>) {
        self.p_src = reg.define_param("src");
        self.p_dst = reg.define_param("dst");
        self.p_proto = reg.define_param("proto");
        self.p_ttl = reg.define_param("ttl");
        self.p_tlen = reg.define_param("total_len");
        self.p_id = reg.define_param("id");
    }

    fn setup(&mut self, res: &Resolver<'_>) -> Result<(), RegistrationError> {
        self.tcp = res.lookup("tcp");
        self.udp = res.lookup("udp");
        Ok(())
    }

    fn children(&self) -> &[&'static str] {
        &["tcp", "udp"]
    }

    fn decode<'p>(
        &mut self,
        payload: &mut Payload<'p>,
        prop: &mut Property<'p>,
    ) -> Option<ModuleId> {
        let ip = Ipv4HeaderSlice::from_slice(payload.remaining()).ok()?;
        let header = payload.retain(ip.slice().len())?;

        prop.retain_value(self.p_tlen).set(&header[2..4]);
        prop.retain_value(self.p_id).set(&header[4..6]);
        prop.retain_value(self.p_ttl).set(&header[8..9]);
        prop.retain_value(self.p_proto)
            .cpy(&[ip.protocol().0], Endian::Little);
        prop.retain_value(self.p_src).set(&header[12..16]);
        prop.retain_value(self.p_dst).set(&header[16..20]);

        prop.set_src_addr(IpAddr::V4(Ipv4Addr::from(ip.source())));
        prop.set_dst_addr(IpAddr::V4(Ipv4Addr::from(ip.destination())));

        // Trailing Ethernet fill bytes must not reach the transport layer.
        let datagram_len = (ip.total_len() as usize).saturating_sub(ip.slice().len());
        payload.truncate(datagram_len);

        // Fragment reassembly is not supported; later fragments carry no
        // parseable transport header.
        if ip.fragments_offset().value() != 0 {
            return None;
        }

        match ip.protocol().0 {
            ip_proto::TCP => self.tcp,
            ip_proto::UDP => self.udp,
            _ => None,
        }
    }
}
