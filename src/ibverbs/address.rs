//! Address vector of the remote end of a reliable connection, set on the QP during the
//! Init to Ready-to-Receive transition.
use std::mem::MaybeUninit;

use rdma_mummy_sys::ibv_ah_attr;

/// The path to the remote [`QueuePair`] on a local (non-routed) InfiniBand subnet.
///
/// [`QueuePair`]: crate::ibverbs::queue_pair::QueuePair
pub struct AddressHandleAttribute {
    pub(crate) attr: ibv_ah_attr,
}

impl Default for AddressHandleAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressHandleAttribute {
    pub fn new() -> Self {
        AddressHandleAttribute {
            attr: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    pub fn setup_dest_lid(&mut self, dest_lid: u16) -> &mut Self {
        self.attr.dlid = dest_lid;
        self
    }

    pub fn setup_service_level(&mut self, sl: u8) -> &mut Self {
        self.attr.sl = sl;
        self
    }

    pub fn setup_src_path_bits(&mut self, src_path_bits: u8) -> &mut Self {
        self.attr.src_path_bits = src_path_bits;
        self
    }

    pub fn setup_port(&mut self, port_num: u8) -> &mut Self {
        self.attr.port_num = port_num;
        self
    }

    pub fn dest_lid(&self) -> u16 {
        self.attr.dlid
    }

    pub fn port(&self) -> u8 {
        self.attr.port_num
    }

    /// Whether a global routing header is attached; LID-routed paths never set one.
    pub fn is_global(&self) -> bool {
        self.attr.is_global != 0
    }
}
