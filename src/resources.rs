//! Every hardware resource of a node, acquired in dependency order and released in reverse.
//!
//! The registered buffer is allocated first and freed last; in between sit the device context,
//! the protection domain, the memory region and one lane per worker thread (CQ, optional SRQ and
//! the RC QPs of the lane's peers). Field declaration order of [`Resources`] is the teardown
//! order, and a failure halfway through [`Resources::open`] unwinds the locals the same way.
use std::ops::Range;
use std::ptr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::handshake::bring_up::{Endpoint, LinkParams};
use crate::handshake::qp_info::QpInfo;
use crate::ibverbs::completion::{CompletionQueue, CreateCompletionQueueError};
use crate::ibverbs::device::{DeviceList, GetDeviceListError, OpenDeviceError};
use crate::ibverbs::device_context::{
    AllocateProtectionDomainError, DeviceContext, PortState, QueryDeviceError, QueryPortError,
};
use crate::ibverbs::memory_region::{AlignedBuffer, AllocateBufferError, MemoryRegion, RegisterMemoryRegionError};
use crate::ibverbs::protection_domain::ProtectionDomain;
use crate::ibverbs::queue_pair::{
    CreateQueuePairError, ModifyQueuePairError, QueuePair, QueuePairAttribute, QueuePairState, QueuePairType,
};
use crate::ibverbs::shared_receive_queue::{CreateSharedReceiveQueueError, SharedReceiveQueue};
use crate::ibverbs::AccessFlags;
use crate::ring::{MemoryLayout, RecvRing, StagingArea, SENTINEL};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResourceError {
    #[error(transparent)]
    AllocateBuffer(#[from] AllocateBufferError),
    #[error(transparent)]
    GetDeviceList(#[from] GetDeviceListError),
    #[error("no RDMA device found")]
    NoDevice,
    #[error("RDMA device {0} not found")]
    DeviceNotFound(String),
    #[error(transparent)]
    OpenDevice(#[from] OpenDeviceError),
    #[error(transparent)]
    AllocateProtectionDomain(#[from] AllocateProtectionDomainError),
    #[error(transparent)]
    RegisterMemoryRegion(#[from] RegisterMemoryRegionError),
    #[error(transparent)]
    QueryDevice(#[from] QueryDeviceError),
    #[error(transparent)]
    QueryPort(#[from] QueryPortError),
    #[error(transparent)]
    CreateCompletionQueue(#[from] CreateCompletionQueueError),
    #[error(transparent)]
    CreateSharedReceiveQueue(#[from] CreateSharedReceiveQueueError),
    #[error("{queue} needs room for {needed} work requests, the device allows {max}")]
    QueueTooShallow { queue: &'static str, needed: u64, max: u32 },
    #[error("failed to create the queue pair of peer {peer}")]
    CreateQueuePair {
        peer: usize,
        #[source]
        source: CreateQueuePairError,
    },
}

/// What [`Resources::open`] has to build.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    /// Device to open, the first one of the list when `None`.
    pub device: Option<String>,
    pub link: LinkParams,
    /// Our own rank, advertised in every QP record.
    pub rank: u32,
    pub layout: MemoryLayout,
    /// Number of worker threads; clamped to the number of peers.
    pub lanes: usize,
    pub shared_receive_queue: bool,
    /// Send work requests a QP may hold at once, unsignaled ones included.
    pub send_depth: u64,
}

/// Refuse a plan whose queues would overflow the device's limits mid-run.
pub fn check_queue_depths(plan: &ResourcePlan, max_qp_wr: u32, max_srq_wr: u32) -> Result<(), ResourceError> {
    let slots = plan.layout.slots() as u64;
    let recv = if plan.shared_receive_queue {
        let widest = lane_ranges(plan.layout.num_peers(), plan.lanes)
            .iter()
            .map(|peers| peers.len() as u64)
            .max()
            .unwrap_or(0);
        ("shared receive queue", slots * widest, max_srq_wr)
    } else {
        ("receive queue", slots, max_qp_wr)
    };
    for (queue, needed, max) in [("send queue", plan.send_depth, max_qp_wr), recv] {
        if needed > u64::from(max) {
            return Err(ResourceError::QueueTooShallow { queue, needed, max });
        }
    }
    Ok(())
}

/// Split `num_peers` into at most `lanes` contiguous, non-empty chunks of near equal size.
pub fn lane_ranges(num_peers: usize, lanes: usize) -> Vec<Range<usize>> {
    let lanes = lanes.clamp(1, num_peers.max(1));
    let (base, extra) = (num_peers / lanes, num_peers % lanes);
    let mut start = 0;
    (0..lanes)
        .map(|lane| {
            let len = base + usize::from(lane < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

struct Lane {
    peers: Range<usize>,
    qps: Vec<QueuePair>,
    srq: Option<Arc<SharedReceiveQueue>>,
    cq: Arc<CompletionQueue>,
}

pub struct Resources {
    lanes: Vec<Lane>,
    mr: MemoryRegion,
    _pd: Arc<ProtectionDomain>,
    ctx: Arc<DeviceContext>,
    lid: u16,
    rank: u32,
    link: LinkParams,
    layout: MemoryLayout,
    buffer: AlignedBuffer,
}

impl Resources {
    pub fn open(plan: &ResourcePlan) -> Result<Self, ResourceError> {
        let layout = plan.layout;
        let buffer = AlignedBuffer::zeroed(layout.total_len())?;
        // outgoing payloads are all sentinel bytes
        unsafe {
            ptr::write_bytes(
                buffer.as_ptr().as_ptr().add(layout.staging_offset()),
                SENTINEL,
                layout.staging_slots() * layout.msg_size(),
            );
        }

        let device_list = DeviceList::new()?;
        let device = device_list.find(plan.device.as_deref()).ok_or_else(|| match &plan.device {
            Some(name) => ResourceError::DeviceNotFound(name.clone()),
            None => ResourceError::NoDevice,
        })?;
        let ctx = device.open()?;
        let pd = ctx.alloc_pd()?;
        let mr = unsafe {
            pd.reg_mr(
                buffer.as_ptr().as_ptr() as usize,
                buffer.len(),
                AccessFlags::LocalWrite | AccessFlags::RemoteRead | AccessFlags::RemoteWrite,
            )?
        };

        let device_attr = ctx.query_device()?;
        check_queue_depths(plan, device_attr.max_qp_wr(), device_attr.max_srq_wr())?;
        let port_attr = ctx.query_port(plan.link.ib_port)?;
        if port_attr.port_state() != PortState::Active {
            warn!(
                device = %ctx.name(),
                port = plan.link.ib_port,
                state = ?port_attr.port_state(),
                "port is not active"
            );
        }
        info!(
            device = %ctx.name(),
            lid = port_attr.lid(),
            max_cqe = device_attr.max_cqe(),
            max_qp_wr = device_attr.max_qp_wr(),
            buffer_len = buffer.len(),
            "device opened"
        );

        let mut lanes = Vec::new();
        for peers in lane_ranges(layout.num_peers(), plan.lanes) {
            let cq = ctx.create_cq(device_attr.max_cqe())?;
            let srq = if plan.shared_receive_queue {
                Some(pd.create_srq(device_attr.max_srq_wr(), 1)?)
            } else {
                None
            };

            let mut qps = Vec::with_capacity(peers.len());
            for peer in peers.clone() {
                let mut builder = pd.create_qp_builder();
                builder
                    .setup_qp_type(QueuePairType::ReliableConnection)
                    .setup_max_send_wr(device_attr.max_qp_wr())
                    .setup_max_recv_wr(device_attr.max_qp_wr())
                    .setup_max_send_sge(1)
                    .setup_max_recv_sge(1)
                    .setup_send_cq(&cq)
                    .setup_recv_cq(&cq);
                if let Some(srq) = &srq {
                    builder.setup_srq(srq);
                }
                let qp = builder
                    .build()
                    .map_err(|source| ResourceError::CreateQueuePair { peer, source })?;
                debug!(peer, qp_num = qp.qp_number(), "queue pair created");
                qps.push(qp);
            }
            lanes.push(Lane { peers, qps, srq, cq });
        }

        Ok(Resources {
            lanes,
            mr,
            _pd: pd,
            ctx,
            lid: port_attr.lid(),
            rank: plan.rank,
            link: plan.link,
            layout,
            buffer,
        })
    }

    pub fn device_name(&self) -> String {
        self.ctx.name()
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn link(&self) -> LinkParams {
        self.link
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    fn ring_base(&self, peer: usize) -> u64 {
        self.buffer.as_ptr().as_ptr() as u64 + self.layout.recv_ring_offset(peer) as u64
    }

    /// One handshake endpoint per peer, in peer order.
    pub fn endpoints(&mut self) -> Vec<PeerEndpoint<'_>> {
        let infos: Vec<QpInfo> = self
            .lanes
            .iter()
            .flat_map(|lane| lane.peers.clone().zip(&lane.qps))
            .map(|(peer, qp)| QpInfo {
                lid: self.lid,
                qp_num: qp.qp_number(),
                rkey: self.mr.rkey(),
                raddr: self.ring_base(peer),
                rank: self.rank,
            })
            .collect();

        self.lanes
            .iter_mut()
            .flat_map(|lane| lane.qps.iter_mut())
            .zip(infos)
            .map(|(qp, info)| PeerEndpoint { qp, info })
            .collect()
    }

    /// Hand every lane its own QPs, CQ, SRQ and receive rings, plus a shared read-only view of
    /// the staging area.
    pub fn split(&mut self) -> Vec<LaneContext<'_>> {
        let Resources {
            lanes,
            mr,
            layout,
            buffer,
            ..
        } = self;
        let base = buffer.as_ptr();
        let lkey = mr.lkey();
        let staging = unsafe {
            StagingArea::from_raw(
                ptr::NonNull::new_unchecked(base.as_ptr().add(layout.staging_offset())),
                layout.staging_slots(),
                layout.msg_size(),
            )
        };

        lanes
            .iter_mut()
            .enumerate()
            .map(|(index, lane)| {
                let rings = lane
                    .peers
                    .clone()
                    .map(|peer| unsafe {
                        RecvRing::from_raw(
                            ptr::NonNull::new_unchecked(base.as_ptr().add(layout.recv_ring_offset(peer))),
                            layout.slots(),
                            layout.msg_size(),
                        )
                    })
                    .collect();
                LaneContext {
                    index,
                    peers: lane.peers.clone(),
                    qps: &mut lane.qps,
                    cq: &lane.cq,
                    srq: lane.srq.as_deref(),
                    rings,
                    staging,
                    lkey,
                }
            })
            .collect()
    }

    /// Release everything, QPs first and the buffer last.
    pub fn close(self) {
        debug!(device = %self.ctx.name(), "releasing resources");
        drop(self);
    }
}

/// Everything one worker thread drives.
pub struct LaneContext<'res> {
    pub index: usize,
    /// Global indices of this lane's peers.
    pub peers: Range<usize>,
    pub qps: &'res mut [QueuePair],
    pub cq: &'res CompletionQueue,
    pub srq: Option<&'res SharedReceiveQueue>,
    /// Receive ring of every peer of the lane, in peer order.
    pub rings: Vec<RecvRing<'res>>,
    pub staging: StagingArea<'res>,
    pub lkey: u32,
}

/// A real QP taking part in the handshake.
pub struct PeerEndpoint<'res> {
    qp: &'res mut QueuePair,
    info: QpInfo,
}

impl Endpoint for PeerEndpoint<'_> {
    fn local_info(&self) -> QpInfo {
        self.info
    }

    fn state(&self) -> QueuePairState {
        self.qp.state()
    }

    fn modify(&mut self, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError> {
        self.qp.modify(attr)
    }
}
