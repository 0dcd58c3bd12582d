//! Completion queues report finished work requests; the benchmark busy-polls them without a
//! completion channel.
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_mummy_sys::{ibv_cq, ibv_destroy_cq, ibv_poll_cq, ibv_wc, ibv_wc_opcode, ibv_wc_status};

use super::device_context::DeviceContext;

#[derive(Debug, thiserror::Error)]
#[error("failed to create completion queue")]
#[non_exhaustive]
pub struct CreateCompletionQueueError(#[from] pub CreateCompletionQueueErrorKind);

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateCompletionQueueErrorKind {
    Ibverbs(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PollCompletionQueueError {
    #[error("poll completion queue failed")]
    Ibverbs(#[from] io::Error),
}

/// The status of a finished work request. Anything other than [`WorkCompletionStatus::Success`]
/// means the QP has moved to the error state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCompletionStatus {
    Success = ibv_wc_status::IBV_WC_SUCCESS,
    LocalLengthError = ibv_wc_status::IBV_WC_LOC_LEN_ERR,
    LocalQueuePairOperationError = ibv_wc_status::IBV_WC_LOC_QP_OP_ERR,
    LocalProtectionError = ibv_wc_status::IBV_WC_LOC_PROT_ERR,
    WorkRequestFlushedError = ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
    BadResponseError = ibv_wc_status::IBV_WC_BAD_RESP_ERR,
    LocalAccessError = ibv_wc_status::IBV_WC_LOC_ACCESS_ERR,
    RemoteInvalidRequestError = ibv_wc_status::IBV_WC_REM_INV_REQ_ERR,
    RemoteAccessError = ibv_wc_status::IBV_WC_REM_ACCESS_ERR,
    RemoteOperationError = ibv_wc_status::IBV_WC_REM_OP_ERR,
    RetryCounterExceededError = ibv_wc_status::IBV_WC_RETRY_EXC_ERR,
    ResponderNotReadyRetryCounterExceededError = ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR,
    RemoteAbortedError = ibv_wc_status::IBV_WC_REM_ABORT_ERR,
    FatalError = ibv_wc_status::IBV_WC_FATAL_ERR,
    ResponseTimeoutError = ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR,
    GeneralError = ibv_wc_status::IBV_WC_GENERAL_ERR,
    /// A status this crate does not name; still a failure.
    Other = u32::MAX,
}

impl From<u32> for WorkCompletionStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => WorkCompletionStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => WorkCompletionStatus::LocalLengthError,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => WorkCompletionStatus::LocalQueuePairOperationError,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => WorkCompletionStatus::LocalProtectionError,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WorkCompletionStatus::WorkRequestFlushedError,
            ibv_wc_status::IBV_WC_BAD_RESP_ERR => WorkCompletionStatus::BadResponseError,
            ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => WorkCompletionStatus::LocalAccessError,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WorkCompletionStatus::RemoteInvalidRequestError,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WorkCompletionStatus::RemoteAccessError,
            ibv_wc_status::IBV_WC_REM_OP_ERR => WorkCompletionStatus::RemoteOperationError,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WorkCompletionStatus::RetryCounterExceededError,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WorkCompletionStatus::ResponderNotReadyRetryCounterExceededError,
            ibv_wc_status::IBV_WC_REM_ABORT_ERR => WorkCompletionStatus::RemoteAbortedError,
            ibv_wc_status::IBV_WC_FATAL_ERR => WorkCompletionStatus::FatalError,
            ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR => WorkCompletionStatus::ResponseTimeoutError,
            ibv_wc_status::IBV_WC_GENERAL_ERR => WorkCompletionStatus::GeneralError,
            _ => WorkCompletionStatus::Other,
        }
    }
}

impl fmt::Display for WorkCompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The kind of operation a work completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCompletionOperationType {
    Send,
    Write,
    Read,
    Receive,
    ReceiveWithImmediate,
    Other(u32),
}

impl From<u32> for WorkCompletionOperationType {
    fn from(opcode: u32) -> Self {
        match opcode {
            ibv_wc_opcode::IBV_WC_SEND => WorkCompletionOperationType::Send,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => WorkCompletionOperationType::Write,
            ibv_wc_opcode::IBV_WC_RDMA_READ => WorkCompletionOperationType::Read,
            ibv_wc_opcode::IBV_WC_RECV => WorkCompletionOperationType::Receive,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WorkCompletionOperationType::ReceiveWithImmediate,
            other => WorkCompletionOperationType::Other(other),
        }
    }
}

/// One entry polled out of a [`CompletionQueue`].
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct WorkCompletion {
    wc: ibv_wc,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        WorkCompletion {
            wc: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }
}

impl WorkCompletion {
    pub fn wr_id(&self) -> u64 {
        self.wc.wr_id
    }

    pub fn status(&self) -> WorkCompletionStatus {
        self.wc.status.into()
    }

    pub fn opcode(&self) -> WorkCompletionOperationType {
        self.wc.opcode.into()
    }

    pub fn vendor_err(&self) -> u32 {
        self.wc.vendor_err
    }

    pub fn qp_num(&self) -> u32 {
        self.wc.qp_num
    }

    /// Immediate data of a receive completion, in host byte order.
    pub fn imm_data(&self) -> u32 {
        u32::from_be(unsafe { self.wc.imm_data_invalidated_rkey_union.imm_data })
    }
}

impl fmt::Debug for WorkCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("opcode", &self.opcode())
            .field("qp_num", &self.qp_num())
            .finish()
    }
}

/// A completion queue created with [`ibv_create_cq`] and polled with [`ibv_poll_cq`].
///
/// [`ibv_create_cq`]: https://man7.org/linux/man-pages/man3/ibv_create_cq.3.html
/// [`ibv_poll_cq`]: https://man7.org/linux/man-pages/man3/ibv_poll_cq.3.html
#[derive(Debug)]
pub struct CompletionQueue {
    pub(crate) cq: NonNull<ibv_cq>,
    _dev_ctx: Arc<DeviceContext>,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

impl CompletionQueue {
    pub(crate) fn new(dev_ctx: Arc<DeviceContext>, cq: NonNull<ibv_cq>) -> Self {
        CompletionQueue { cq, _dev_ctx: dev_ctx }
    }

    /// Number of entries the hardware actually allocated, at least the requested amount.
    pub fn capacity(&self) -> u32 {
        unsafe { self.cq.as_ref().cqe.max(0) as u32 }
    }

    /// Move up to `wcs.len()` completions into `wcs` without blocking, returning how many were
    /// written. `Ok(0)` means the queue is currently empty.
    pub fn poll(&self, wcs: &mut [WorkCompletion]) -> Result<usize, PollCompletionQueueError> {
        let num_entries = i32::try_from(wcs.len()).unwrap_or(i32::MAX);
        let ret = unsafe { ibv_poll_cq(self.cq.as_ptr(), num_entries, wcs.as_mut_ptr() as *mut ibv_wc) };

        if ret < 0 {
            Err(PollCompletionQueueError::Ibverbs(io::Error::from_raw_os_error(-ret)))
        } else {
            Ok(ret as usize)
        }
    }
}
