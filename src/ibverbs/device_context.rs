//! The device context is used for querying RDMA device attributes and creating the initial
//! resources.
use std::io;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use rdma_mummy_sys::{
    ibv_alloc_pd, ibv_close_device, ibv_context, ibv_create_cq, ibv_device_attr_ex, ibv_mtu, ibv_port_attr,
    ibv_port_state, ibv_query_device_ex, ibv_query_port,
};
use serde::{Deserialize, Serialize};

use super::completion::{CompletionQueue, CreateCompletionQueueError, CreateCompletionQueueErrorKind};
use super::device::device_name;
use super::protection_domain::ProtectionDomain;

/// Error returned by [`DeviceContext::alloc_pd`] for allocating a new RDMA PD.
#[derive(Debug, thiserror::Error)]
#[error("failed to alloc protection domain")]
#[non_exhaustive]
pub struct AllocateProtectionDomainError(#[from] pub AllocateProtectionDomainErrorKind);

/// The enum type for [`AllocateProtectionDomainError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum AllocateProtectionDomainErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::query_device`] for querying device context's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query device")]
#[non_exhaustive]
pub struct QueryDeviceError(#[from] pub QueryDeviceErrorKind);

/// The enum type for [`QueryDeviceError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryDeviceErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::query_port`] for querying physical port's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query port (port_num={port_num})")]
#[non_exhaustive]
pub struct QueryPortError {
    pub port_num: u8,
    pub source: QueryPortErrorKind,
}

/// The enum type for [`QueryPortError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryPortErrorKind {
    Ibverbs(#[from] io::Error),
}

/// A context of the RDMA device, could be used to query its resources or creating PD or CQ.
#[derive(Debug)]
pub struct DeviceContext {
    pub(crate) context: *mut ibv_context,
}

unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

/// RDMA Maximum Transmission Units (MTU). Only 5 sizes are allowed and they count the RDMA
/// payload only, headers of the underlying link come on top.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mtu {
    Mtu256 = ibv_mtu::IBV_MTU_256,
    Mtu512 = ibv_mtu::IBV_MTU_512,
    Mtu1024 = ibv_mtu::IBV_MTU_1024,
    Mtu2048 = ibv_mtu::IBV_MTU_2048,
    Mtu4096 = ibv_mtu::IBV_MTU_4096,
}

impl From<u32> for Mtu {
    fn from(mtu: u32) -> Self {
        match mtu {
            ibv_mtu::IBV_MTU_256 => Mtu::Mtu256,
            ibv_mtu::IBV_MTU_512 => Mtu::Mtu512,
            ibv_mtu::IBV_MTU_1024 => Mtu::Mtu1024,
            ibv_mtu::IBV_MTU_2048 => Mtu::Mtu2048,
            ibv_mtu::IBV_MTU_4096 => Mtu::Mtu4096,
            _ => panic!("Unknown MTU value: {mtu}"),
        }
    }
}

impl Mtu {
    /// Map a size in bytes (as written in a config file) to the MTU enum.
    pub fn from_bytes(bytes: u32) -> Option<Mtu> {
        match bytes {
            256 => Some(Mtu::Mtu256),
            512 => Some(Mtu::Mtu512),
            1024 => Some(Mtu::Mtu1024),
            2048 => Some(Mtu::Mtu2048),
            4096 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    pub fn bytes(&self) -> u32 {
        128 << (*self as u32)
    }
}

/// The logical state of a port.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortState {
    /// Reserved value, shouldn't be observed.
    Nop = ibv_port_state::IBV_PORT_NOP,
    /// Logical link is down. The physical link of the port isn't up.
    Down = ibv_port_state::IBV_PORT_DOWN,
    /// The physical link of the port is up, but the subnet manager haven't yet configured the
    /// logical link.
    Initializing = ibv_port_state::IBV_PORT_INIT,
    /// The physical link of the port is up, but the subnet manager haven't yet fully configured
    /// the logical link.
    Armed = ibv_port_state::IBV_PORT_ARMED,
    /// Logical link is active. The link layer can transmit and receive all packet types.
    Active = ibv_port_state::IBV_PORT_ACTIVE,
    /// The logical link was active, but the physical link suffered from a failure.
    ActiveDefer = ibv_port_state::IBV_PORT_ACTIVE_DEFER,
}

impl From<u32> for PortState {
    fn from(port_state: u32) -> Self {
        match port_state {
            ibv_port_state::IBV_PORT_NOP => PortState::Nop,
            ibv_port_state::IBV_PORT_DOWN => PortState::Down,
            ibv_port_state::IBV_PORT_INIT => PortState::Initializing,
            ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
            ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
            ibv_port_state::IBV_PORT_ACTIVE_DEFER => PortState::ActiveDefer,
            _ => panic!("Unknown port state value: {port_state}"),
        }
    }
}

/// The attributes of a port of an RDMA device context.
pub struct PortAttr {
    attr: ibv_port_attr,
}

impl PortAttr {
    /// Get the base local identifier of this port, assigned by the subnet manager.
    pub fn lid(&self) -> u16 {
        self.attr.lid
    }

    /// Get the maximum MTU enabled on this port to transmit and receive.
    pub fn active_mtu(&self) -> Mtu {
        self.attr.active_mtu.into()
    }

    /// Get the logical port status of this port.
    pub fn port_state(&self) -> PortState {
        self.attr.state.into()
    }
}

/// The attributes of an RDMA device that is associated with a context.
pub struct DeviceAttr {
    attr: ibv_device_attr_ex,
}

impl DeviceAttr {
    /// Get the maximum number of entries a completion queue can hold.
    pub fn max_cqe(&self) -> u32 {
        self.attr.orig_attr.max_cqe.max(0) as u32
    }

    /// Get the maximum number of outstanding work requests on any queue of a QP.
    pub fn max_qp_wr(&self) -> u32 {
        self.attr.orig_attr.max_qp_wr.max(0) as u32
    }

    /// Get the maximum number of outstanding work requests on a shared receive queue.
    pub fn max_srq_wr(&self) -> u32 {
        self.attr.orig_attr.max_srq_wr.max(0) as u32
    }

    /// Get the number of physical ports on this device.
    pub fn phys_port_cnt(&self) -> u8 {
        self.attr.orig_attr.phys_port_cnt
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            ibv_close_device(self.context);
        }
    }
}

impl DeviceContext {
    /// Get the name of the device this context was opened on.
    pub fn name(&self) -> String {
        unsafe { device_name((*self.context).device) }
    }

    /// Allocate a protection domain.
    pub fn alloc_pd(self: &Arc<Self>) -> Result<Arc<ProtectionDomain>, AllocateProtectionDomainError> {
        let pd = unsafe { ibv_alloc_pd(self.context) };

        match NonNull::new(pd) {
            Some(pd) => Ok(Arc::new(ProtectionDomain::new(Arc::clone(self), pd))),
            None => Err(AllocateProtectionDomainErrorKind::Ibverbs(io::Error::last_os_error()).into()),
        }
    }

    /// Create a [`CompletionQueue`] with room for `cqe` completions, without any completion
    /// channel; it is meant to be busy-polled.
    pub fn create_cq(self: &Arc<Self>, cqe: u32) -> Result<Arc<CompletionQueue>, CreateCompletionQueueError> {
        let cqe = i32::try_from(cqe).unwrap_or(i32::MAX);
        let cq = unsafe { ibv_create_cq(self.context, cqe, ptr::null_mut(), ptr::null_mut(), 0) };

        match NonNull::new(cq) {
            Some(cq) => Ok(Arc::new(CompletionQueue::new(Arc::clone(self), cq))),
            None => Err(CreateCompletionQueueErrorKind::Ibverbs(io::Error::last_os_error()).into()),
        }
    }

    /// Query the attributes of the RDMA device.
    pub fn query_device(&self) -> Result<DeviceAttr, QueryDeviceError> {
        let mut attr = MaybeUninit::<ibv_device_attr_ex>::uninit();
        unsafe {
            match ibv_query_device_ex(self.context, ptr::null(), attr.as_mut_ptr()) {
                0 => Ok(DeviceAttr {
                    attr: attr.assume_init(),
                }),
                ret => Err(QueryDeviceErrorKind::Ibverbs(io::Error::from_raw_os_error(ret)).into()),
            }
        }
    }

    /// Query the attributes of a physical port.
    pub fn query_port(&self, port_num: u8) -> Result<PortAttr, QueryPortError> {
        let mut attr = MaybeUninit::<ibv_port_attr>::uninit();
        unsafe {
            match ibv_query_port(self.context, port_num, attr.as_mut_ptr()) {
                0 => Ok(PortAttr {
                    attr: attr.assume_init(),
                }),
                ret => Err(QueryPortError {
                    port_num,
                    source: io::Error::from_raw_os_error(ret).into(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::device;
    use rstest::rstest;

    #[test]
    fn test_mtu_conversion() {
        assert_eq!(Mtu::from(ibv_mtu::IBV_MTU_256), Mtu::Mtu256);
        assert_eq!(Mtu::from(ibv_mtu::IBV_MTU_512), Mtu::Mtu512);
        assert_eq!(Mtu::from(ibv_mtu::IBV_MTU_1024), Mtu::Mtu1024);
        assert_eq!(Mtu::from(ibv_mtu::IBV_MTU_2048), Mtu::Mtu2048);
        assert_eq!(Mtu::from(ibv_mtu::IBV_MTU_4096), Mtu::Mtu4096);
    }

    #[test]
    #[should_panic(expected = "Unknown MTU value")]
    fn test_invalid_mtu_conversion() {
        let _ = Mtu::from(999);
    }

    #[rstest]
    #[case(256, Some(Mtu::Mtu256))]
    #[case(1024, Some(Mtu::Mtu1024))]
    #[case(4096, Some(Mtu::Mtu4096))]
    #[case(1500, None)]
    #[case(9000, None)]
    fn test_mtu_from_bytes(#[case] bytes: u32, #[case] expected: Option<Mtu>) {
        assert_eq!(Mtu::from_bytes(bytes), expected);
        if let Some(mtu) = expected {
            assert_eq!(mtu.bytes(), bytes);
        }
    }

    #[test]
    fn test_port_state_conversion() {
        assert_eq!(PortState::from(0), PortState::Nop);
        assert_eq!(PortState::from(1), PortState::Down);
        assert_eq!(PortState::from(2), PortState::Initializing);
        assert_eq!(PortState::from(3), PortState::Armed);
        assert_eq!(PortState::from(4), PortState::Active);
        assert_eq!(PortState::from(5), PortState::ActiveDefer);
    }

    #[test]
    fn test_query_port_error() -> Result<(), Box<dyn std::error::Error>> {
        let invalid_port_num: u8 = 255;
        let device_list = device::DeviceList::new()?;
        for device in &device_list {
            let ctx = device.open().unwrap();
            let error = ctx.query_port(invalid_port_num).err().unwrap();
            assert_eq!(error.port_num, invalid_port_num);
            match error.source {
                QueryPortErrorKind::Ibverbs(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            };
        }
        Ok(())
    }

    #[test]
    fn test_device_limits_are_usable() -> Result<(), Box<dyn std::error::Error>> {
        let device_list = device::DeviceList::new()?;
        for device in &device_list {
            let ctx = device.open()?;
            let attr = ctx.query_device()?;
            assert!(attr.max_cqe() > 0);
            assert!(attr.max_qp_wr() > 0);
            assert!(attr.phys_port_cnt() >= 1);
            assert_eq!(ctx.name(), device.name());
        }
        Ok(())
    }
}
