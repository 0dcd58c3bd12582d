//! The seam between the engines and the verbs layer.
use crate::ibverbs::completion::{
    CompletionQueue, WorkCompletion, WorkCompletionOperationType, WorkCompletionStatus,
};
use crate::ibverbs::queue_pair::{QueuePair, SetScatterGatherEntry, WorkRequestFlags};
use crate::ibverbs::shared_receive_queue::SharedReceiveQueue;
use crate::ring::LocalSlice;

use super::{EngineError, POLL_BATCH};

/// Work request id of the start message.
pub const START_WR_ID: u64 = 0xD000_0000_0000_0000;
/// Work request id of the stop message.
pub const STOP_WR_ID: u64 = 0xE000_0000_0000_0000;

pub const IMM_START: u32 = 0;
pub const IMM_STOP: u32 = 1;
pub const IMM_REGULAR: u32 = 2;

/// Work request id of a data message: the lane-local peer in the high half, the slot in the low
/// half.
pub fn data_wr_id(peer: usize, slot: usize) -> u64 {
    debug_assert!(peer < 1 << 28 && slot <= u32::MAX as usize);
    ((peer as u64) << 32) | slot as u64
}

/// Inverse of [`data_wr_id`]; `None` for the control ids.
pub fn split_wr_id(wr_id: u64) -> Option<(usize, usize)> {
    if wr_id >> 60 != 0 {
        return None;
    }
    Some(((wr_id >> 32) as usize, (wr_id & u64::from(u32::MAX)) as usize))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionKind {
    #[default]
    Send,
    Write,
    /// A received message and the immediate data it carried, in host order.
    Recv { imm: u32 },
}

/// A successful completion; failures never make it out of [`Transport::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    pub wr_id: u64,
    pub kind: CompletionKind,
}

/// One RDMA write of a local slice into the peer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWrite {
    pub wr_id: u64,
    pub local: LocalSlice,
    pub remote_addr: u64,
    pub rkey: u32,
    pub signaled: bool,
}

/// Posting and polling for one lane. `peer` is always lane-local.
pub trait Transport {
    fn post_recv(&mut self, peer: usize, wr_id: u64, buf: LocalSlice) -> Result<(), EngineError>;

    /// Post a signaled send carrying `imm`.
    fn post_send(&mut self, peer: usize, wr_id: u64, imm: u32, buf: LocalSlice) -> Result<(), EngineError>;

    /// Post `writes` to `peer` as one linked chain.
    fn post_writes(&mut self, peer: usize, writes: &[RemoteWrite]) -> Result<(), EngineError>;

    /// Fetch up to `out.len()` completions without blocking. A failed completion is an error.
    fn poll(&mut self, out: &mut [Completion]) -> Result<usize, EngineError>;
}

/// [`Transport`] over the lane's real QPs, CQ and SRQ.
pub struct LaneTransport<'res> {
    qps: &'res mut [QueuePair],
    cq: &'res CompletionQueue,
    srq: Option<&'res SharedReceiveQueue>,
    lkey: u32,
    wcs: [WorkCompletion; POLL_BATCH],
}

impl<'res> LaneTransport<'res> {
    pub fn new(
        qps: &'res mut [QueuePair], cq: &'res CompletionQueue, srq: Option<&'res SharedReceiveQueue>, lkey: u32,
    ) -> Self {
        LaneTransport {
            qps,
            cq,
            srq,
            lkey,
            wcs: [WorkCompletion::default(); POLL_BATCH],
        }
    }

    fn qp(&mut self, peer: usize) -> Result<&mut QueuePair, EngineError> {
        self.qps
            .get_mut(peer)
            .ok_or(EngineError::UnknownPeer { peer: peer as u64 })
    }
}

impl Transport for LaneTransport<'_> {
    fn post_recv(&mut self, peer: usize, wr_id: u64, buf: LocalSlice) -> Result<(), EngineError> {
        let lkey = self.lkey;
        let mut guard = match self.srq {
            Some(srq) => srq.start_post_recv(),
            None => self.qp(peer)?.start_post_recv(),
        };
        unsafe {
            guard.construct_wr(wr_id).setup_sge(lkey, buf.addr, buf.len);
        }
        guard.post().map_err(|source| EngineError::PostRecv { peer, source })
    }

    fn post_send(&mut self, peer: usize, wr_id: u64, imm: u32, buf: LocalSlice) -> Result<(), EngineError> {
        let lkey = self.lkey;
        let mut guard = self.qp(peer)?.start_post_send();
        unsafe {
            guard
                .construct_wr(wr_id, WorkRequestFlags::Signaled)
                .setup_send_imm(imm)
                .setup_sge(lkey, buf.addr, buf.len);
        }
        guard.post().map_err(|source| EngineError::PostSend { peer, source })
    }

    fn post_writes(&mut self, peer: usize, writes: &[RemoteWrite]) -> Result<(), EngineError> {
        let lkey = self.lkey;
        let mut guard = self.qp(peer)?.start_post_send();
        for write in writes {
            let flags = if write.signaled {
                WorkRequestFlags::Signaled
            } else {
                WorkRequestFlags::none()
            };
            unsafe {
                guard
                    .construct_wr(write.wr_id, flags)
                    .setup_write(write.rkey, write.remote_addr)
                    .setup_sge(lkey, write.local.addr, write.local.len);
            }
        }
        guard.post().map_err(|source| EngineError::PostSend { peer, source })
    }

    fn poll(&mut self, out: &mut [Completion]) -> Result<usize, EngineError> {
        let max = out.len().min(POLL_BATCH);
        let num = self.cq.poll(&mut self.wcs[..max])?;

        for (wc, completion) in self.wcs[..num].iter().zip(out.iter_mut()) {
            if wc.status() != WorkCompletionStatus::Success {
                return Err(EngineError::CompletionFailed {
                    wr_id: wc.wr_id(),
                    opcode: wc.opcode(),
                    status: wc.status(),
                    vendor_err: wc.vendor_err(),
                });
            }
            let kind = match wc.opcode() {
                WorkCompletionOperationType::Send => CompletionKind::Send,
                WorkCompletionOperationType::Write => CompletionKind::Write,
                WorkCompletionOperationType::Receive | WorkCompletionOperationType::ReceiveWithImmediate => {
                    CompletionKind::Recv { imm: wc.imm_data() }
                },
                opcode => {
                    return Err(EngineError::UnexpectedOpcode {
                        wr_id: wc.wr_id(),
                        opcode,
                    })
                },
            };
            *completion = Completion {
                wr_id: wc.wr_id(),
                kind,
            };
        }
        Ok(num)
    }
}
