//! The device is used for creating a device context, everything about RDMA starts here.
use std::sync::Arc;
use std::{ffi::CStr, io, marker::PhantomData};

use rdma_mummy_sys::{ibv_device, ibv_free_device_list, ibv_get_device_list, ibv_get_device_name, ibv_open_device};

use super::device_context::DeviceContext;

/// Error returned by [`DeviceList::new`] for getting a new [`DeviceList`].
#[derive(Debug, thiserror::Error)]
#[error("failed to get device list")]
#[non_exhaustive]
pub struct GetDeviceListError(#[from] pub GetDeviceListErrorKind);

/// The enum type for [`GetDeviceListError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum GetDeviceListErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`Device::open`] for open the device to create a [`DeviceContext`].
#[derive(Debug, thiserror::Error)]
#[error("failed to open device {name}")]
#[non_exhaustive]
pub struct OpenDeviceError {
    pub name: String,
    pub source: OpenDeviceErrorKind,
}

/// The enum type for [`OpenDeviceError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum OpenDeviceErrorKind {
    Ibverbs(#[from] io::Error),
}

/// The RDMA device list which contains all RDMA devices based on the environment configuration.
pub struct DeviceList {
    devices: *mut *mut ibv_device,
    num_devices: usize,
}

impl DeviceList {
    /// Get a new RDMA device list based on current environment.
    pub fn new() -> Result<DeviceList, GetDeviceListError> {
        let mut num_devices: i32 = 0;
        let devices = unsafe { ibv_get_device_list(&mut num_devices as *mut _) };
        if devices.is_null() {
            return Err(GetDeviceListErrorKind::Ibverbs(io::Error::last_os_error()).into());
        }

        Ok(DeviceList {
            devices,
            num_devices: num_devices as usize,
        })
    }

    /// Get a device list iterator.
    pub fn iter(&self) -> DeviceListIter<'_> {
        DeviceListIter {
            current: 0,
            total: self.num_devices,
            devices: self,
        }
    }

    /// Get the device from device list by index.
    pub fn get(&self, index: usize) -> Option<Device<'_>> {
        if index >= self.num_devices {
            return None;
        }
        let device = unsafe { *self.devices.add(index) };
        if device.is_null() {
            None
        } else {
            Some(Device::new(device, self))
        }
    }

    /// Pick the device named `name`, or the first device of the list when no name is given.
    pub fn find(&self, name: Option<&str>) -> Option<Device<'_>> {
        match name {
            Some(name) => self.iter().find(|device| device.name() == name),
            None => self.get(0),
        }
    }

    /// Get the device list length.
    pub fn len(&self) -> usize {
        self.num_devices
    }

    /// Check if current device list is empty.
    pub fn is_empty(&self) -> bool {
        self.num_devices == 0
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.devices) };
    }
}

impl<'list> IntoIterator for &'list DeviceList {
    type Item = <DeviceListIter<'list> as Iterator>::Item;
    type IntoIter = DeviceListIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The iterator of the [`DeviceList`].
pub struct DeviceListIter<'list> {
    current: usize,
    total: usize,
    devices: &'list DeviceList,
}

impl<'list> Iterator for DeviceListIter<'list> {
    type Item = Device<'list>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.total {
            return None;
        }
        let device = unsafe { *self.devices.devices.add(self.current) };
        self.current += 1;
        Some(Device::new(device, self.devices))
    }
}

/// A safe wrapper around a raw RDMA device pointer.
///
/// The lifetime parameter ensures that a Device cannot outlive the DeviceList
/// from which it was derived.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct Device<'list> {
    device: *mut ibv_device,
    _dev_list: PhantomData<&'list ()>,
}

impl Device<'_> {
    fn new(device: *mut ibv_device, _devices: &DeviceList) -> Self {
        Device {
            device,
            _dev_list: PhantomData,
        }
    }

    /// Get the name of the device, for example, `mlx5_0`.
    pub fn name(&self) -> String {
        unsafe { device_name(self.device) }
    }

    /// Open the device to create a [`DeviceContext`] for querying / creating all other RDMA
    /// resources later.
    pub fn open(&self) -> Result<Arc<DeviceContext>, OpenDeviceError> {
        let context = unsafe { ibv_open_device(self.device) };
        if context.is_null() {
            return Err(OpenDeviceError {
                name: self.name(),
                source: io::Error::last_os_error().into(),
            });
        }
        Ok(Arc::new(DeviceContext { context }))
    }
}

pub(crate) unsafe fn device_name(device: *mut ibv_device) -> String {
    let name = ibv_get_device_name(device);
    if name.is_null() {
        String::new()
    } else {
        String::from_utf8_lossy(CStr::from_ptr(name).to_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma_mummy_sys::{_ibv_device_ops, ibv_node_type, ibv_transport_type};
    use std::ffi::CString;

    fn mock_devices(num: usize) -> Vec<*mut ibv_device> {
        (0..num)
            .map(|i| {
                let mut ibv_dev = Box::new(ibv_device {
                    _ops: _ibv_device_ops {
                        _dummy1: None,
                        _dummy2: None,
                    },
                    node_type: ibv_node_type::IBV_NODE_CA,
                    transport_type: ibv_transport_type::IBV_TRANSPORT_IB,
                    name: [0; 64usize],
                    dev_name: [0; 64usize],
                    dev_path: [0; 256usize],
                    ibdev_path: [0; 256usize],
                });
                for (j, &b) in CString::new(format!("mock{i}")).unwrap().as_bytes().iter().enumerate() {
                    ibv_dev.name[j] = b as std::os::raw::c_char;
                }
                Box::into_raw(ibv_dev)
            })
            .collect()
    }

    #[test]
    fn test_find_device_by_name() {
        let mut ptrs = mock_devices(4);
        let dev_list = DeviceList {
            devices: ptrs.as_mut_ptr(),
            num_devices: ptrs.len(),
        };

        assert_eq!(dev_list.find(None).unwrap().name(), "mock0");
        assert_eq!(dev_list.find(Some("mock2")).unwrap().name(), "mock2");
        assert!(dev_list.find(Some("mlx5_9")).is_none());
        assert_eq!(dev_list.iter().count(), 4);
        assert!(dev_list.get(4).is_none());

        // Avoid calling `ibv_free_device_list` for mock devices,
        // or it will cause panic in rdma-core
        std::mem::forget(dev_list);
        for ptr in ptrs {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }

    #[test]
    fn test_find_on_empty_list() {
        let mut ptrs: Vec<*mut ibv_device> = Vec::new();
        let dev_list = DeviceList {
            devices: ptrs.as_mut_ptr(),
            num_devices: 0,
        };
        assert!(dev_list.is_empty());
        assert!(dev_list.find(None).is_none());
        std::mem::forget(dev_list);
    }

    #[test]
    fn test_open_every_device() -> Result<(), Box<dyn std::error::Error>> {
        let devices = DeviceList::new()?;
        for device in &devices {
            let ctx = device.open()?;
            assert!(!ctx.context.is_null());
        }
        Ok(())
    }
}
