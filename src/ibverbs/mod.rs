//! Safe wrappers over the subset of libibverbs the echo benchmark drives: device discovery,
//! protection domains, memory registration, completion queues, shared receive queues and
//! reliable-connected queue pairs.
pub mod address;
pub mod completion;
pub mod device;
pub mod device_context;
pub mod memory_region;
pub mod protection_domain;
pub mod queue_pair;
pub mod shared_receive_queue;

use bitmask_enum::bitmask;
use rdma_mummy_sys::ibv_access_flags;

/// Access rights of a memory region or of incoming operations on a queue pair.
#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum AccessFlags {
    LocalWrite = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as _,
    RemoteWrite = ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0 as _,
    RemoteRead = ibv_access_flags::IBV_ACCESS_REMOTE_READ.0 as _,
    RemoteAtomic = ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0 as _,
}
