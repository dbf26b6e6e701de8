//! UDP module.

use etherparse::UdpHeaderSlice;

use crate::decoder::{Module, ModuleId, ParamId, Registrar};
use crate::packet::Payload;
use crate::property::Property;

/// UDP transport module. Terminal in the default chain.
#[derive(Default)]
pub struct UdpModule {
    p_src_port: ParamId,
    p_dst_port: ParamId,
    p_len: ParamId,
    p_chksum: ParamId,
    p_data: ParamId,
}

impl Module for UdpModule {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn declare(&mut self, reg: &mut Registrar<'_>) {
        self.p_src_port = reg.define_param("src_port");
        self.p_dst_port = reg.define_param("dst_port");
        self.p_len = reg.define_param("len");
        self.p_chksum = reg.define_param("chksum");
        self.p_data = reg.define_param("data");
    }

    fn decode<'p>(
        &mut self,
        payload: &mut Payload<'p>,
        prop: &mut Property<'p>,
    ) -> Option<ModuleId> {
        let udp = UdpHeaderSlice::from_slice(payload.remaining()).ok()?;
        let header = payload.retain(8)?;

        prop.set_src_port(udp.source_port());
        prop.set_dst_port(udp.destination_port());

        prop.retain_value(self.p_src_port).set(&header[0..2]);
        prop.retain_value(self.p_dst_port).set(&header[2..4]);
        prop.retain_value(self.p_len).set(&header[4..6]);
        prop.retain_value(self.p_chksum).set(&header[6..8]);

        let data_len = payload.len();
        let data = payload.retain(data_len)?;
        prop.retain_value(self.p_data).set(data);

        None
    }
}
