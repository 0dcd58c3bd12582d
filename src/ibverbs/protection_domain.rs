//! A protection domain is used to associate [`QueuePair`]s with [`MemoryRegion`]s, as a means for
//! enabling and controlling network adapter access to Host System memory.
//!
//! [`QueuePair`]: crate::ibverbs::queue_pair::QueuePair
//!
use rdma_mummy_sys::{ibv_dealloc_pd, ibv_pd};
use std::ptr::NonNull;
use std::sync::Arc;

use super::{
    device_context::DeviceContext,
    memory_region::{MemoryRegion, RegisterMemoryRegionError},
    queue_pair::QueuePairBuilder,
    shared_receive_queue::{CreateSharedReceiveQueueError, SharedReceiveQueue},
    AccessFlags,
};

/// A protection domain that could be used to creating RDMA QP and RDMA MR on it to associate them
/// together.
#[derive(Debug)]
pub struct ProtectionDomain {
    pub(crate) pd: NonNull<ibv_pd>,
    _dev_ctx: Arc<DeviceContext>,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_pd(self.pd.as_ptr());
        }
    }
}

impl ProtectionDomain {
    pub(crate) fn new(dev_ctx: Arc<DeviceContext>, pd: NonNull<ibv_pd>) -> Self {
        ProtectionDomain { pd, _dev_ctx: dev_ctx }
    }

    /// Register a memory region that was allocated outside this module.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` is valid for `len` bytes and that the memory outlives
    /// the returned [`MemoryRegion`].
    pub unsafe fn reg_mr(
        self: &Arc<Self>, ptr: usize, len: usize, access: AccessFlags,
    ) -> Result<MemoryRegion, RegisterMemoryRegionError> {
        MemoryRegion::reg_mr(Arc::clone(self), ptr, len, access)
    }

    /// Create a [`SharedReceiveQueue`] holding up to `max_wr` receive requests of `max_sge`
    /// scatter / gather entries each.
    pub fn create_srq(
        self: &Arc<Self>, max_wr: u32, max_sge: u32,
    ) -> Result<Arc<SharedReceiveQueue>, CreateSharedReceiveQueueError> {
        SharedReceiveQueue::new(Arc::clone(self), max_wr, max_sge).map(Arc::new)
    }

    /// Create a [`QueuePairBuilder`] for building QPs on this protection domain
    /// later.
    pub fn create_qp_builder(self: &Arc<Self>) -> QueuePairBuilder {
        QueuePairBuilder::new(self)
    }
}
