//! Users need to register memory they allocated as memory region for accessing it later.
use rdma_mummy_sys::{ibv_dereg_mr, ibv_mr, ibv_reg_mr};
use std::alloc::{self, Layout};
use std::{io, ptr::NonNull, sync::Arc};

use super::protection_domain::ProtectionDomain;
use super::AccessFlags;

/// Alignment of every buffer handed to the hardware.
pub const PAGE_SIZE: usize = 4096;

/// Error returned by [`ProtectionDomain::reg_mr`] for registering a new RDMA MR.
#[derive(Debug, thiserror::Error)]
#[error("failed to register memory region")]
#[non_exhaustive]
pub struct RegisterMemoryRegionError(#[from] pub RegisterMemoryRegionErrorKind);

/// The enum type for [`RegisterMemoryRegionError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum RegisterMemoryRegionErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`AlignedBuffer::zeroed`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AllocateBufferError {
    #[error("invalid buffer layout (len={len})")]
    InvalidLayout { len: usize },
    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },
}

/// A zero-initialized, page-aligned heap buffer whose address never moves, suitable for
/// registration as a [`MemoryRegion`].
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to [`PAGE_SIZE`].
    pub fn zeroed(len: usize) -> Result<Self, AllocateBufferError> {
        if len == 0 {
            return Err(AllocateBufferError::InvalidLayout { len });
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| AllocateBufferError::InvalidLayout { len })?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(AllocateBufferError::OutOfMemory { len })?;
        Ok(AlignedBuffer { ptr, layout })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A registered memory region abstraction that wraps an RDMA memory region.
#[derive(Debug)]
pub struct MemoryRegion {
    mr: NonNull<ibv_mr>,
    _pd: Arc<ProtectionDomain>,
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr.as_ptr());
        }
    }
}

impl MemoryRegion {
    /// Returns the RDMA local key.
    pub fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref().lkey }
    }

    /// Returns the RDMA remote key.
    pub fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref().rkey }
    }

    /// Returns the length of the registered region.
    pub fn region_len(&self) -> usize {
        unsafe { self.mr.as_ref().length }
    }

    /// Returns the starting address of the registered region.
    pub fn get_ptr(&self) -> usize {
        unsafe { self.mr.as_ref().addr as _ }
    }

    /// # Safety
    ///
    /// The caller must ensure that `ptr` is valid for `len` bytes and outlives the region.
    pub(crate) unsafe fn reg_mr(
        pd: Arc<ProtectionDomain>, ptr: usize, len: usize, access: AccessFlags,
    ) -> Result<Self, RegisterMemoryRegionError> {
        let mr = ibv_reg_mr(pd.pd.as_ptr(), ptr as _, len, access.bits());

        match NonNull::new(mr) {
            Some(mr) => Ok(Self { mr, _pd: pd }),
            None => Err(RegisterMemoryRegionErrorKind::Ibverbs(io::Error::last_os_error()).into()),
        }
    }
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::device;

    #[test]
    fn test_aligned_buffer_is_page_aligned_and_zeroed() {
        let buffer = AlignedBuffer::zeroed(3 * PAGE_SIZE + 17).unwrap();
        assert_eq!(buffer.as_ptr().as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(buffer.len(), 3 * PAGE_SIZE + 17);
        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr().as_ptr(), buffer.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_buffer_is_rejected() {
        assert!(matches!(
            AlignedBuffer::zeroed(0),
            Err(AllocateBufferError::InvalidLayout { len: 0 })
        ));
    }

    #[test]
    fn test_register_aligned_buffer() -> Result<(), Box<dyn std::error::Error>> {
        let device_list = device::DeviceList::new()?;
        for device in &device_list {
            let ctx = device.open()?;
            let pd = ctx.alloc_pd()?;
            let buffer = AlignedBuffer::zeroed(PAGE_SIZE)?;
            let mr = unsafe {
                pd.reg_mr(
                    buffer.as_ptr().as_ptr() as usize,
                    buffer.len(),
                    AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
                )?
            };
            assert_eq!(mr.get_ptr(), buffer.as_ptr().as_ptr() as usize);
            assert_eq!(mr.region_len(), PAGE_SIZE);
            drop(mr);
        }
        Ok(())
    }
}
