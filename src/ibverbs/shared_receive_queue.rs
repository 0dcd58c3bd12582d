//! A shared receive queue lets many [`QueuePair`]s consume receive requests from one pool, so the
//! number of posted buffers does not grow with the number of connections.
//!
//! [`QueuePair`]: crate::ibverbs::queue_pair::QueuePair
use std::io;
use std::ptr::{null_mut, NonNull};
use std::sync::Arc;

use rdma_mummy_sys::{ibv_create_srq, ibv_destroy_srq, ibv_srq, ibv_srq_attr, ibv_srq_init_attr};

use super::protection_domain::ProtectionDomain;
use super::queue_pair::{PostRecvGuard, RecvTarget};

/// Error returned by [`ProtectionDomain::create_srq`].
#[derive(Debug, thiserror::Error)]
#[error("failed to create shared receive queue (max_wr={max_wr})")]
#[non_exhaustive]
pub struct CreateSharedReceiveQueueError {
    pub max_wr: u32,
    pub source: CreateSharedReceiveQueueErrorKind,
}

/// The enum type for [`CreateSharedReceiveQueueError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateSharedReceiveQueueErrorKind {
    Ibverbs(#[from] io::Error),
}

#[derive(Debug)]
pub struct SharedReceiveQueue {
    pub(crate) srq: NonNull<ibv_srq>,
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for SharedReceiveQueue {}
unsafe impl Sync for SharedReceiveQueue {}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_srq(self.srq.as_ptr());
        }
    }
}

impl SharedReceiveQueue {
    pub(crate) fn new(
        pd: Arc<ProtectionDomain>, max_wr: u32, max_sge: u32,
    ) -> Result<Self, CreateSharedReceiveQueueError> {
        let mut init_attr = ibv_srq_init_attr {
            srq_context: null_mut(),
            attr: ibv_srq_attr {
                max_wr,
                max_sge,
                srq_limit: 0,
            },
        };
        let srq = unsafe { ibv_create_srq(pd.pd.as_ptr(), &mut init_attr) };

        match NonNull::new(srq) {
            Some(srq) => Ok(SharedReceiveQueue { srq, _pd: pd }),
            None => Err(CreateSharedReceiveQueueError {
                max_wr,
                source: io::Error::last_os_error().into(),
            }),
        }
    }

    /// Start collecting receive requests to be posted to this queue in one call.
    ///
    /// The queue is shared between QPs driven by one thread, so posting only needs `&self`.
    pub fn start_post_recv(&self) -> PostRecvGuard<'_> {
        PostRecvGuard::new(RecvTarget::SharedReceiveQueue(self.srq))
    }
}
