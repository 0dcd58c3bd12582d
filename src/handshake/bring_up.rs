//! Driving a reliable-connected QP from Reset to Ready-to-Send with the peer's identifiers.
use tracing::debug;

use super::qp_info::QpInfo;
use crate::ibverbs::address::AddressHandleAttribute;
use crate::ibverbs::device_context::Mtu;
use crate::ibverbs::queue_pair::{ModifyQueuePairError, QueuePairAttribute, QueuePairState};
use crate::ibverbs::AccessFlags;

const PKEY_INDEX: u16 = 0;
const START_PSN: u32 = 0;
const MAX_RD_ATOMIC: u8 = 1;
const MIN_RNR_TIMER: u8 = 12;
const TIMEOUT: u8 = 14;
const RETRY_CNT: u8 = 7;
const RNR_RETRY: u8 = 7;

/// Port and path parameters shared by every QP of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    pub ib_port: u8,
    pub mtu: Mtu,
    pub service_level: u8,
}

/// A local QP as seen by the handshake.
pub trait Endpoint {
    /// The record sent to the peer for this QP.
    fn local_info(&self) -> QpInfo;

    fn state(&self) -> QueuePairState;

    fn modify(&mut self, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError>;
}

/// Access rights granted to incoming operations once the QP is initialized.
pub fn qp_access() -> AccessFlags {
    AccessFlags::LocalWrite | AccessFlags::RemoteRead | AccessFlags::RemoteAtomic | AccessFlags::RemoteWrite
}

pub fn init_attr(link: &LinkParams) -> QueuePairAttribute {
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::Init)
        .setup_pkey_index(PKEY_INDEX)
        .setup_port(link.ib_port)
        .setup_access_flags(qp_access());
    attr
}

pub fn rtr_attr(remote: &QpInfo, link: &LinkParams) -> QueuePairAttribute {
    let mut ah_attr = AddressHandleAttribute::new();
    ah_attr
        .setup_dest_lid(remote.lid)
        .setup_service_level(link.service_level)
        .setup_src_path_bits(0)
        .setup_port(link.ib_port);

    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToReceive)
        .setup_path_mtu(link.mtu)
        .setup_dest_qp_num(remote.qp_num)
        .setup_rq_psn(START_PSN)
        .setup_max_dest_read_atomic(MAX_RD_ATOMIC)
        .setup_min_rnr_timer(MIN_RNR_TIMER)
        .setup_address_vector(&ah_attr);
    attr
}

pub fn rts_attr() -> QueuePairAttribute {
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToSend)
        .setup_timeout(TIMEOUT)
        .setup_retry_cnt(RETRY_CNT)
        .setup_rnr_retry(RNR_RETRY)
        .setup_sq_psn(START_PSN)
        .setup_max_read_atomic(MAX_RD_ATOMIC);
    attr
}

/// Move `endpoint` through Init, RTR and RTS, in that order and exactly once each. The first
/// failing step aborts; states already reached are not rolled back.
pub fn bring_up<E: Endpoint>(endpoint: &mut E, remote: &QpInfo, link: &LinkParams) -> Result<(), ModifyQueuePairError> {
    let local = endpoint.local_info();

    endpoint.modify(&init_attr(link))?;
    endpoint.modify(&rtr_attr(remote, link))?;
    endpoint.modify(&rts_attr())?;

    debug!(
        qp_num = local.qp_num,
        remote_qp_num = remote.qp_num,
        remote_lid = remote.lid,
        state = ?endpoint.state(),
        "queue pair connected"
    );
    Ok(())
}
