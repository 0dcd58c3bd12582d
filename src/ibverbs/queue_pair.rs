//! A [`QueuePair`] is a pair of send queue and recv queue, considered as the basic transport
//! interface for RDMA communication.
use bitmask_enum::bitmask;
use rdma_mummy_sys::{
    ibv_create_qp, ibv_destroy_qp, ibv_modify_qp, ibv_post_recv, ibv_post_send, ibv_post_srq_recv, ibv_qp,
    ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_cap, ibv_qp_init_attr, ibv_qp_state, ibv_qp_type, ibv_recv_wr,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_srq, ibv_wr_opcode,
};
use std::sync::Arc;
use std::{
    fmt, io,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::{null_mut, NonNull},
};

use super::{
    address::AddressHandleAttribute, completion::CompletionQueue, device_context::Mtu,
    protection_domain::ProtectionDomain, shared_receive_queue::SharedReceiveQueue, AccessFlags,
};

/// Error returned by [`QueuePairBuilder::build`] for creating a new RDMA QP.
#[derive(Debug, thiserror::Error)]
#[error("failed to create queue pair")]
#[non_exhaustive]
pub struct CreateQueuePairError(#[from] pub CreateQueuePairErrorKind);

/// The enum type for [`CreateQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateQueuePairErrorKind {
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
    #[error("{0} completion queue must be configured before building a queue pair")]
    MissingCompletionQueue(&'static str),
}

/// Error returned by [`QueuePair::modify`] for modifying a RDMA QP's attributes.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub struct ModifyQueuePairError(#[from] pub ModifyQueuePairErrorKind);

/// The enum type for [`ModifyQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModifyQueuePairErrorKind {
    #[error("modify queue pair failed")]
    Ibverbs(#[from] io::Error),
    #[error("invalid transition from {cur_state:?} to {next_state:?}")]
    InvalidTransition {
        cur_state: QueuePairState,
        next_state: QueuePairState,
    },
    #[error("transition from {cur_state:?} to {next_state:?} misses attribute masks {needed:?}")]
    InvalidAttributeMask {
        cur_state: QueuePairState,
        next_state: QueuePairState,
        needed: QueuePairAttributeMask,
    },
}

/// Error returned by [`PostSendGuard::post`] for posting Work Requests to QP's send queue.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostSendError {
    #[error("post send failed")]
    Ibverbs(#[from] io::Error),
    #[error("invalid value provided in work request")]
    InvalidWorkRequest(#[source] io::Error),
    #[error("invalid value provided in queue pair")]
    InvalidQueuePair(#[source] io::Error),
    #[error("send queue is full or not enough resources to complete this operation")]
    NotEnoughResources(#[source] io::Error),
}

/// Error returned by [`PostRecvGuard::post`] for posting Work Requests to a receive queue.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostRecvError {
    #[error("post receive failed")]
    Ibverbs(#[from] io::Error),
    #[error("invalid value provided in work request")]
    InvalidWorkRequest(#[source] io::Error),
    #[error("invalid value provided in queue pair")]
    InvalidQueuePair(#[source] io::Error),
    #[error("receive queue is full or not enough resources to complete this operation")]
    NotEnoughResources(#[source] io::Error),
}

/// The requested transport service type of a QP.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairType {
    /// A reliable connection is a connection created between a single local QP and a single remote
    /// QP, delivery is acknowledged and in order.
    ReliableConnection = ibv_qp_type::IBV_QPT_RC,
}

/// QP's state, which controls the behavior of a QP. For detailed information, take
/// [qp state machine] for reference.
///
/// [qp state machine]: https://www.rdmamojo.com/2012/05/05/qp-state-machine/
///
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePairState {
    Reset = ibv_qp_state::IBV_QPS_RESET,
    Init = ibv_qp_state::IBV_QPS_INIT,
    ReadyToReceive = ibv_qp_state::IBV_QPS_RTR,
    ReadyToSend = ibv_qp_state::IBV_QPS_RTS,
    SendQueueDrain = ibv_qp_state::IBV_QPS_SQD,
    SendQueueError = ibv_qp_state::IBV_QPS_SQE,
    Error = ibv_qp_state::IBV_QPS_ERR,
    Unknown = ibv_qp_state::IBV_QPS_UNKNOWN,
}

impl From<u32> for QueuePairState {
    fn from(state: u32) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QueuePairState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QueuePairState::Init,
            ibv_qp_state::IBV_QPS_RTR => QueuePairState::ReadyToReceive,
            ibv_qp_state::IBV_QPS_RTS => QueuePairState::ReadyToSend,
            ibv_qp_state::IBV_QPS_SQD => QueuePairState::SendQueueDrain,
            ibv_qp_state::IBV_QPS_SQE => QueuePairState::SendQueueError,
            ibv_qp_state::IBV_QPS_ERR => QueuePairState::Error,
            _ => QueuePairState::Unknown,
        }
    }
}

impl QueuePairState {
    /// The next state on the connection bring-up path Reset, Init, RTR, RTS. No other state has
    /// a successor.
    pub fn successor(&self) -> Option<QueuePairState> {
        match self {
            QueuePairState::Reset => Some(QueuePairState::Init),
            QueuePairState::Init => Some(QueuePairState::ReadyToReceive),
            QueuePairState::ReadyToReceive => Some(QueuePairState::ReadyToSend),
            _ => None,
        }
    }
}

/// Operation type of the Work Request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkRequestOperationType {
    SendWithImmediate = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
    Write = ibv_wr_opcode::IBV_WR_RDMA_WRITE,
}

/// Flags of the Work Request properties.
#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum WorkRequestFlags {
    Signaled = ibv_send_flags::IBV_SEND_SIGNALED.0,
}

// According to C standard, enums should be int, but Rust just uses whatever
// type returned by Clang, which is uint on Linux platforms, so just cast it
// into int.
//
// https://github.com/rust-lang/rust-bindgen/issues/1966
//
/// Mask of the [`QueuePairAttribute`], used for specifying the fields to be modified in
/// attributes of the [`QueuePair`].
#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum QueuePairAttributeMask {
    State = ibv_qp_attr_mask::IBV_QP_STATE.0 as _,
    AccessFlags = ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS.0 as _,
    PartitionKeyIndex = ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0 as _,
    Port = ibv_qp_attr_mask::IBV_QP_PORT.0 as _,
    AddressVector = ibv_qp_attr_mask::IBV_QP_AV.0 as _,
    PathMtu = ibv_qp_attr_mask::IBV_QP_PATH_MTU.0 as _,
    Timeout = ibv_qp_attr_mask::IBV_QP_TIMEOUT.0 as _,
    RetryCount = ibv_qp_attr_mask::IBV_QP_RETRY_CNT.0 as _,
    ResponderNotReadyRetryCount = ibv_qp_attr_mask::IBV_QP_RNR_RETRY.0 as _,
    ReceiveQueuePacketSequenceNumber = ibv_qp_attr_mask::IBV_QP_RQ_PSN.0 as _,
    MaxReadAtomic = ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC.0 as _,
    MinResponderNotReadyTimer = ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0 as _,
    SendQueuePacketSequenceNumber = ibv_qp_attr_mask::IBV_QP_SQ_PSN.0 as _,
    MaxDestinationReadAtomic = ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC.0 as _,
    DestinationQueuePairNumber = ibv_qp_attr_mask::IBV_QP_DEST_QPN.0 as _,
}

// Required masks of the RC bring-up transitions, taken from the qp_state_table of the Linux
// kernel.
//
// Ref: https://elixir.bootlin.com/linux/v6.10.9/source/drivers/infiniband/core/verbs.c#L1385
//
fn required_mask(next_state: QueuePairState) -> QueuePairAttributeMask {
    use QueuePairAttributeMask as M;

    match next_state {
        QueuePairState::Init => M::State | M::PartitionKeyIndex | M::Port | M::AccessFlags,
        QueuePairState::ReadyToReceive => {
            M::State
                | M::AddressVector
                | M::PathMtu
                | M::DestinationQueuePairNumber
                | M::ReceiveQueuePacketSequenceNumber
                | M::MaxDestinationReadAtomic
                | M::MinResponderNotReadyTimer
        },
        QueuePairState::ReadyToSend => {
            M::State
                | M::SendQueuePacketSequenceNumber
                | M::Timeout
                | M::RetryCount
                | M::ResponderNotReadyRetryCount
                | M::MaxReadAtomic
        },
        _ => M::State,
    }
}

/// Check that `attr` describes exactly the next step of the bring-up path from `cur_state`.
pub(crate) fn transition_check(cur_state: QueuePairState, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError> {
    let next_state = attr.state();
    if !attr.attr_mask.contains(QueuePairAttributeMask::State) || cur_state.successor() != Some(next_state) {
        return Err(ModifyQueuePairErrorKind::InvalidTransition { cur_state, next_state }.into());
    }

    let required = required_mask(next_state);
    let needed = required.and(attr.attr_mask.not());
    if needed.is_none() {
        Ok(())
    } else {
        Err(ModifyQueuePairErrorKind::InvalidAttributeMask {
            cur_state,
            next_state,
            needed,
        }
        .into())
    }
}

/// A basic [`QueuePair`] created with [`ibv_create_qp`], bound to one send CQ, one recv CQ and
/// optionally a [`SharedReceiveQueue`].
///
/// [`ibv_create_qp`]: https://man7.org/linux/man-pages/man3/ibv_create_qp.3.html
///
pub struct QueuePair {
    pub(crate) qp: NonNull<ibv_qp>,
    _pd: Arc<ProtectionDomain>,
    _send_cq: Arc<CompletionQueue>,
    _recv_cq: Arc<CompletionQueue>,
    _srq: Option<Arc<SharedReceiveQueue>>,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_qp(self.qp.as_ptr());
        }
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_number())
            .field("state", &self.state())
            .finish()
    }
}

impl QueuePair {
    /// The QP number other side needs to address this QP.
    pub fn qp_number(&self) -> u32 {
        unsafe { self.qp.as_ref().qp_num }
    }

    /// The state this QP was last moved to.
    pub fn state(&self) -> QueuePairState {
        unsafe { self.qp.as_ref().state.into() }
    }

    /// Modify the [`QueuePair`]'s attributes. The only accepted transitions are the next step of
    /// Reset, Init, RTR, RTS; anything else is refused before reaching the hardware.
    pub fn modify(&mut self, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError> {
        transition_check(self.state(), attr)?;

        // ibv_qp_attr does not impl Clone trait, so we use struct update syntax here
        let mut qp_attr = ibv_qp_attr { ..attr.attr };
        let ret = unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut qp_attr as *mut _, attr.attr_mask.bits()) };
        match ret {
            0 => Ok(()),
            err => Err(ModifyQueuePairErrorKind::Ibverbs(io::Error::from_raw_os_error(err)).into()),
        }
    }

    pub fn start_post_send(&mut self) -> PostSendGuard<'_> {
        PostSendGuard {
            qp: self.qp,
            wrs: Vec::new(),
            sges: Vec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn start_post_recv(&mut self) -> PostRecvGuard<'_> {
        PostRecvGuard::new(RecvTarget::QueuePair(self.qp))
    }
}

/// A factory for creating [`QueuePair`] with the specified parameters.
pub struct QueuePairBuilder {
    init_attr: ibv_qp_init_attr,
    pd: Arc<ProtectionDomain>,
    send_cq: Option<Arc<CompletionQueue>>,
    recv_cq: Option<Arc<CompletionQueue>>,
    srq: Option<Arc<SharedReceiveQueue>>,
}

impl QueuePairBuilder {
    pub fn new(pd: &Arc<ProtectionDomain>) -> QueuePairBuilder {
        QueuePairBuilder {
            init_attr: ibv_qp_init_attr {
                qp_context: null_mut(),
                send_cq: null_mut(),
                recv_cq: null_mut(),
                srq: null_mut(),
                cap: ibv_qp_cap {
                    max_send_wr: 16,
                    max_recv_wr: 16,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    max_inline_data: 0,
                },
                qp_type: QueuePairType::ReliableConnection as _,
                sq_sig_all: 0,
            },
            pd: Arc::clone(pd),
            send_cq: None,
            recv_cq: None,
            srq: None,
        }
    }

    /// Setup the requested QP type.
    pub fn setup_qp_type(&mut self, qp_type: QueuePairType) -> &mut Self {
        self.init_attr.qp_type = qp_type as u32;
        self
    }

    /// Setup the maximum number of outstanding RDMA Work Requests that can be posted to the
    /// **send queue** in the QP.
    pub fn setup_max_send_wr(&mut self, max_send_wr: u32) -> &mut Self {
        self.init_attr.cap.max_send_wr = max_send_wr;
        self
    }

    /// Setup the maximum number of outstanding RDMA Work Requests that can be posted to the
    /// **recv queue** in the QP. Ignored when a [`SharedReceiveQueue`] is attached.
    pub fn setup_max_recv_wr(&mut self, max_recv_wr: u32) -> &mut Self {
        self.init_attr.cap.max_recv_wr = max_recv_wr;
        self
    }

    pub fn setup_max_send_sge(&mut self, max_send_sge: u32) -> &mut Self {
        self.init_attr.cap.max_send_sge = max_send_sge;
        self
    }

    pub fn setup_max_recv_sge(&mut self, max_recv_sge: u32) -> &mut Self {
        self.init_attr.cap.max_recv_sge = max_recv_sge;
        self
    }

    /// Setup the [`CompletionQueue`] to be associated with the QP's send queue, could be the same
    /// one for [`setup_recv_cq`].
    ///
    /// [`setup_recv_cq`]: QueuePairBuilder::setup_recv_cq
    ///
    pub fn setup_send_cq(&mut self, send_cq: &Arc<CompletionQueue>) -> &mut Self {
        self.init_attr.send_cq = send_cq.cq.as_ptr();
        self.send_cq = Some(Arc::clone(send_cq));
        self
    }

    /// Setup the [`CompletionQueue`] to be associated with the QP's recv queue, could be the same
    /// one for [`setup_send_cq`].
    ///
    /// [`setup_send_cq`]: QueuePairBuilder::setup_send_cq
    ///
    pub fn setup_recv_cq(&mut self, recv_cq: &Arc<CompletionQueue>) -> &mut Self {
        self.init_attr.recv_cq = recv_cq.cq.as_ptr();
        self.recv_cq = Some(Arc::clone(recv_cq));
        self
    }

    /// Let the QP consume receive requests from `srq` instead of its own receive queue.
    pub fn setup_srq(&mut self, srq: &Arc<SharedReceiveQueue>) -> &mut Self {
        self.init_attr.srq = srq.srq.as_ptr();
        self.srq = Some(Arc::clone(srq));
        self
    }

    /// Create a [`QueuePair`] with [`ibv_create_qp`].
    ///
    /// [`ibv_create_qp`]: https://man7.org/linux/man-pages/man3/ibv_create_qp.3.html
    ///
    pub fn build(&self) -> Result<QueuePair, CreateQueuePairError> {
        let send_cq = self
            .send_cq
            .clone()
            .ok_or(CreateQueuePairErrorKind::MissingCompletionQueue("send"))?;
        let recv_cq = self
            .recv_cq
            .clone()
            .ok_or(CreateQueuePairErrorKind::MissingCompletionQueue("receive"))?;

        let mut init_attr = ibv_qp_init_attr { ..self.init_attr };
        let qp = unsafe { ibv_create_qp(self.pd.pd.as_ptr(), &mut init_attr) };

        Ok(QueuePair {
            qp: NonNull::new(qp)
                .ok_or::<CreateQueuePairError>(CreateQueuePairErrorKind::Ibverbs(io::Error::last_os_error()).into())?,
            _pd: Arc::clone(&self.pd),
            _send_cq: send_cq,
            _recv_cq: recv_cq,
            _srq: self.srq.clone(),
        })
    }
}

/// Describe the attributes of a [`QueuePair`] to be applied with [`QueuePair::modify`].
pub struct QueuePairAttribute {
    attr: ibv_qp_attr,
    attr_mask: QueuePairAttributeMask,
}

impl Default for QueuePairAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuePairAttribute {
    pub fn new() -> Self {
        QueuePairAttribute {
            attr: unsafe { MaybeUninit::zeroed().assume_init() },
            attr_mask: QueuePairAttributeMask::none(),
        }
    }

    /// Setup the next [`QueuePair`] state.
    pub fn setup_state(&mut self, state: QueuePairState) -> &mut Self {
        self.attr.qp_state = state as _;
        self.attr_mask |= QueuePairAttributeMask::State;
        self
    }

    pub fn state(&self) -> QueuePairState {
        self.attr.qp_state.into()
    }

    /// The attribute fields that will be applied.
    pub fn mask(&self) -> QueuePairAttributeMask {
        self.attr_mask
    }

    /// Setup the primary `p_key` index.
    pub fn setup_pkey_index(&mut self, pkey_index: u16) -> &mut Self {
        self.attr.pkey_index = pkey_index;
        self.attr_mask |= QueuePairAttributeMask::PartitionKeyIndex;
        self
    }

    /// Setup the primary physical port number associated with this [`QueuePair`].
    ///
    /// # Notice
    ///
    /// RDMA port number starts with `1`.
    ///
    pub fn setup_port(&mut self, port_num: u8) -> &mut Self {
        self.attr.port_num = port_num;
        self.attr_mask |= QueuePairAttributeMask::Port;
        self
    }

    /// Setup allowed remote operations for incoming packets.
    pub fn setup_access_flags(&mut self, access_flags: AccessFlags) -> &mut Self {
        self.attr.qp_access_flags = access_flags.bits() as _;
        self.attr_mask |= QueuePairAttributeMask::AccessFlags;
        self
    }

    /// Setup the path MTU, which is the maximum payload size of a packet that can be transferred in
    /// the path.
    pub fn setup_path_mtu(&mut self, path_mtu: Mtu) -> &mut Self {
        self.attr.path_mtu = path_mtu as _;
        self.attr_mask |= QueuePairAttributeMask::PathMtu;
        self
    }

    /// Setup the destination [`QueuePair`] number, 24 bits only.
    pub fn setup_dest_qp_num(&mut self, dest_qp_num: u32) -> &mut Self {
        self.attr.dest_qp_num = dest_qp_num;
        self.attr_mask |= QueuePairAttributeMask::DestinationQueuePairNumber;
        self
    }

    pub fn dest_qp_num(&self) -> u32 {
        self.attr.dest_qp_num
    }

    /// Setup the initial Packet Sequence Number (PSN) of received packets; it has to match the
    /// remote side's sq psn.
    pub fn setup_rq_psn(&mut self, rq_psn: u32) -> &mut Self {
        self.attr.rq_psn = rq_psn;
        self.attr_mask |= QueuePairAttributeMask::ReceiveQueuePacketSequenceNumber;
        self
    }

    /// Setup the initial Packet Sequence Number (PSN) of sent packets, 24 bits only.
    pub fn setup_sq_psn(&mut self, sq_psn: u32) -> &mut Self {
        self.attr.sq_psn = sq_psn;
        self.attr_mask |= QueuePairAttributeMask::SendQueuePacketSequenceNumber;
        self
    }

    /// Setup the number of RDMA Read & atomic operations outstanding at any time that can be
    /// handled by this [`QueuePair`] as an **initiator**.
    pub fn setup_max_read_atomic(&mut self, max_read_atomic: u8) -> &mut Self {
        self.attr.max_rd_atomic = max_read_atomic;
        self.attr_mask |= QueuePairAttributeMask::MaxReadAtomic;
        self
    }

    /// Setup the number of RDMA Read & atomic operations outstanding at any time that can be
    /// handled by this [`QueuePair`] as a **destination**.
    pub fn setup_max_dest_read_atomic(&mut self, max_dest_read_atomic: u8) -> &mut Self {
        self.attr.max_dest_rd_atomic = max_dest_read_atomic;
        self.attr_mask |= QueuePairAttributeMask::MaxDestinationReadAtomic;
        self
    }

    /// Setup the minimum Receiver Not Ready (RNR) NACK timeout.
    pub fn setup_min_rnr_timer(&mut self, min_rnr_timer: u8) -> &mut Self {
        self.attr.min_rnr_timer = min_rnr_timer;
        self.attr_mask |= QueuePairAttributeMask::MinResponderNotReadyTimer;
        self
    }

    /// Setup the minimum ACK / NACK timeout before retransmitting, 4.096 * 2 ^ timeout usec;
    /// `0` waits forever.
    pub fn setup_timeout(&mut self, timeout: u8) -> &mut Self {
        self.attr.timeout = timeout;
        self.attr_mask |= QueuePairAttributeMask::Timeout;
        self
    }

    /// Setup how many times a packet is resent when the remote side does not answer.
    pub fn setup_retry_cnt(&mut self, retry_cnt: u8) -> &mut Self {
        self.attr.retry_cnt = retry_cnt;
        self.attr_mask |= QueuePairAttributeMask::RetryCount;
        self
    }

    /// Setup how many times a packet is resent after an RNR NACK, `7` means infinite.
    pub fn setup_rnr_retry(&mut self, rnr_retry: u8) -> &mut Self {
        self.attr.rnr_retry = rnr_retry;
        self.attr_mask |= QueuePairAttributeMask::ResponderNotReadyRetryCount;
        self
    }

    /// Setup the address vector of the primary path to the remote [`QueuePair`].
    pub fn setup_address_vector(&mut self, ah_attr: &AddressHandleAttribute) -> &mut Self {
        self.attr.ah_attr = ah_attr.attr;
        self.attr_mask |= QueuePairAttributeMask::AddressVector;
        self
    }
}

/// Setup scatter gather entry (sge) for a Work Request.
pub trait SetScatterGatherEntry {
    /// # Safety
    ///
    /// Set a local buffer to the request; note that the lifetime of the buffer associated with the
    /// sge is managed by the caller.
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32);
}

/// Collects send Work Requests and posts them as one linked chain with [`ibv_post_send`].
///
/// [`ibv_post_send`]: https://man7.org/linux/man-pages/man3/ibv_post_send.3.html
///
pub struct PostSendGuard<'qp> {
    qp: NonNull<ibv_qp>,
    wrs: Vec<ibv_send_wr>,
    sges: Vec<ibv_sge>,
    _phantom: PhantomData<&'qp ()>,
}

/// A handle that user would use to fill the concrete information of the RDMA Work Request.
pub struct WorkRequestHandle<'g, 'qp> {
    guard: &'g mut PostSendGuard<'qp>,
}

/// A handle to set local buffer for RDMA Send & RDMA Write request.
pub struct LocalBufferHandle<'g, 'qp> {
    guard: &'g mut PostSendGuard<'qp>,
}

impl<'qp> PostSendGuard<'qp> {
    /// Construct a new [`WorkRequestHandle`] for setting up a new RDMA Work Request.
    pub fn construct_wr<'g>(&'g mut self, wr_id: u64, wr_flags: WorkRequestFlags) -> WorkRequestHandle<'g, 'qp> {
        self.wrs.push(ibv_send_wr {
            wr_id,
            next: null_mut(),
            sg_list: null_mut(),
            num_sge: 0,
            opcode: 0,
            send_flags: wr_flags.bits(),
            ..unsafe { MaybeUninit::zeroed().assume_init() }
        });

        WorkRequestHandle { guard: self }
    }

    /// Post all previously setuped RDMA Work Requests into the [`QueuePair`]'s send queue.
    pub fn post(mut self) -> Result<(), PostSendError> {
        if self.wrs.is_empty() {
            return Ok(());
        }

        let mut sge_index = 0;
        let len = self.wrs.len();
        for i in 0..len {
            // Set up the linked list
            self.wrs[i].next = if i + 1 < len {
                &mut self.wrs[i + 1] as *mut _
            } else {
                null_mut()
            };

            // Set up the sg_list
            if self.wrs[i].num_sge > 0 {
                self.wrs[i].sg_list = &mut self.sges[sge_index] as *mut _;
                sge_index += self.wrs[i].num_sge as usize;
            }
        }

        let mut bad_wr: *mut ibv_send_wr = null_mut();
        let ret = unsafe { ibv_post_send(self.qp.as_ptr(), self.wrs.as_mut_ptr(), &mut bad_wr) };
        match ret {
            0 => Ok(()),
            libc::EINVAL => Err(PostSendError::InvalidWorkRequest(io::Error::from_raw_os_error(
                libc::EINVAL,
            ))),
            libc::ENOMEM => Err(PostSendError::NotEnoughResources(io::Error::from_raw_os_error(
                libc::ENOMEM,
            ))),
            libc::EFAULT => Err(PostSendError::InvalidQueuePair(io::Error::from_raw_os_error(
                libc::EFAULT,
            ))),
            err => Err(PostSendError::Ibverbs(io::Error::from_raw_os_error(err))),
        }
    }

    fn last_wr(&mut self) -> &mut ibv_send_wr {
        let last = self.wrs.len() - 1;
        &mut self.wrs[last]
    }
}

impl<'g, 'qp> WorkRequestHandle<'g, 'qp> {
    /// Send with 32 bits of immediate data, given in host byte order.
    pub fn setup_send_imm(self, imm_data: u32) -> LocalBufferHandle<'g, 'qp> {
        let wr = self.guard.last_wr();
        wr.opcode = WorkRequestOperationType::SendWithImmediate as _;
        wr.imm_data_invalidated_rkey_union.imm_data = imm_data.to_be();
        LocalBufferHandle { guard: self.guard }
    }

    pub fn setup_write(self, rkey: u32, remote_addr: u64) -> LocalBufferHandle<'g, 'qp> {
        let wr = self.guard.last_wr();
        wr.opcode = WorkRequestOperationType::Write as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        LocalBufferHandle { guard: self.guard }
    }
}

impl SetScatterGatherEntry for LocalBufferHandle<'_, '_> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        self.guard.sges.push(ibv_sge { addr, length, lkey });
        self.guard.last_wr().num_sge = 1;
    }
}

#[derive(Clone, Copy)]
pub(crate) enum RecvTarget {
    QueuePair(NonNull<ibv_qp>),
    SharedReceiveQueue(NonNull<ibv_srq>),
}

/// A [`PostRecvGuard`] that can be used to construct and post recv RDMA Work Requests, either to a
/// [`QueuePair`]'s own receive queue or to a [`SharedReceiveQueue`].
pub struct PostRecvGuard<'q> {
    target: RecvTarget,
    wrs: Vec<ibv_recv_wr>,
    sges: Vec<ibv_sge>,
    _phantom: PhantomData<&'q ()>,
}

impl<'q> PostRecvGuard<'q> {
    pub(crate) fn new(target: RecvTarget) -> Self {
        PostRecvGuard {
            target,
            wrs: Vec::new(),
            sges: Vec::new(),
            _phantom: PhantomData,
        }
    }

    /// Construct a new [`RecvWorkRequestHandle`] for setting up a new RDMA Work Request.
    pub fn construct_wr<'g>(&'g mut self, wr_id: u64) -> RecvWorkRequestHandle<'g, 'q> {
        self.wrs.push(ibv_recv_wr {
            wr_id,
            next: null_mut(),
            sg_list: null_mut(),
            num_sge: 0,
        });

        RecvWorkRequestHandle { guard: self }
    }

    pub fn post(mut self) -> Result<(), PostRecvError> {
        if self.wrs.is_empty() {
            return Ok(());
        }

        let mut sge_index = 0;
        let len = self.wrs.len();
        for i in 0..len {
            // Set up the linked list
            self.wrs[i].next = if i + 1 < len {
                &mut self.wrs[i + 1] as *mut _
            } else {
                null_mut()
            };

            // Set up the sg_list
            if self.wrs[i].num_sge > 0 {
                self.wrs[i].sg_list = &mut self.sges[sge_index] as *mut _;
                sge_index += self.wrs[i].num_sge as usize;
            }
        }

        let mut bad_wr: *mut ibv_recv_wr = null_mut();
        let ret = unsafe {
            match self.target {
                RecvTarget::QueuePair(qp) => ibv_post_recv(qp.as_ptr(), self.wrs.as_mut_ptr(), &mut bad_wr),
                RecvTarget::SharedReceiveQueue(srq) => {
                    ibv_post_srq_recv(srq.as_ptr(), self.wrs.as_mut_ptr(), &mut bad_wr)
                },
            }
        };
        match ret {
            0 => Ok(()),
            libc::EINVAL => Err(PostRecvError::InvalidWorkRequest(io::Error::from_raw_os_error(
                libc::EINVAL,
            ))),
            libc::ENOMEM => Err(PostRecvError::NotEnoughResources(io::Error::from_raw_os_error(
                libc::ENOMEM,
            ))),
            libc::EFAULT => Err(PostRecvError::InvalidQueuePair(io::Error::from_raw_os_error(
                libc::EFAULT,
            ))),
            err => Err(PostRecvError::Ibverbs(io::Error::from_raw_os_error(err))),
        }
    }
}

/// A handle that user would use to fill the concrete information of the **recv** RDMA Work Request.
pub struct RecvWorkRequestHandle<'g, 'q> {
    guard: &'g mut PostRecvGuard<'q>,
}

impl SetScatterGatherEntry for RecvWorkRequestHandle<'_, '_> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        let last = self.guard.wrs.len() - 1;
        self.guard.wrs[last].num_sge = 1;
        self.guard.sges.push(ibv_sge { addr, length, lkey });
    }
}
