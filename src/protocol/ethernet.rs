//! Ethernet II module.

use etherparse::Ethernet2HeaderSlice;

use crate::decoder::{Module, ModuleId, ParamId, Registrar, Resolver};
use crate::error::RegistrationError;
use crate::packet::Payload;
use crate::property::Property;

/// Well-known EtherType values.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86DD;
}

/// Ethernet II link-layer module. Root of the default chain.
#[derive(Default)]
pub struct EthernetModule {
    p_src_mac: ParamId,
    p_dst_mac: ParamId,
    p_ethertype: ParamId,
    ipv4: Option<ModuleId>,
}

impl Module for EthernetModule {
    fn name(&self) -> &'static str {
        "eth"
    }

    fn declare(&mut self, reg: &mut Registrar<'_>) {
        self.p_src_mac = reg.define_param("src_mac");
        self.p_dst_mac = reg.define_param("dst_mac");
        self.p_ethertype = reg.define_param("type");
    }

    fn setup(&mut self, res: &Resolver<'_>) -> Result<(), RegistrationError> {
        self.ipv4 = res.lookup("ipv4");
        Ok(())
    }

    fn children(&self) -> &[&'static str] {
        &["ipv4"]
    }

    fn decode<'p>(
        &mut self,
        payload: &mut Payload<'p>,
        prop: &mut Property<'p>,
    ) -> Option<ModuleId> {
        let eth = Ethernet2HeaderSlice::from_slice(payload.remaining()).ok()?;
        let header = payload.retain(eth.slice().len())?;

        prop.retain_value(self.p_dst_mac).set(&header[0..6]);
        prop.retain_value(self.p_src_mac).set(&header[6..12]);
        prop.retain_value(self.p_ethertype).set(&header[12..14]);

        match eth.ether_type().0 {
            ethertype::IPV4 => self.ipv4,
            _ => None,
        }
    }
}
