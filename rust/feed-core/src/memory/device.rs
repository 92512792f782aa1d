// rust/feed-core/src/memory/device.rs

//! Host and device address spaces.
//!
//! A [`Device`] is a bounded address space identified by an index. Device
//! memory is handed out as [`DeviceBlock`]s whose bytes return to the device
//! when the last reference drops. Threads opt into a device with [`bind`];
//! device allocations made by a thread land on its bound device.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::error::fatal;

/// A bounded device address space.
#[derive(Debug)]
pub struct Device {
    index: u32,
    capacity: usize,
    in_use: AtomicUsize,
}

static DEVICES: OnceLock<Mutex<HashMap<u32, Arc<Device>>>> = OnceLock::new();

impl Device {
    /// Creates a standalone device with `capacity` bytes of memory.
    pub fn new(index: u32, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            capacity,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Returns the process-wide device with this index, creating it with
    /// `capacity` bytes on first use.
    pub fn shared(index: u32, capacity: usize) -> Arc<Self> {
        let devices = DEVICES.get_or_init(|| Mutex::new(HashMap::new()));
        devices
            .lock()
            .entry(index)
            .or_insert_with(|| Self::new(index, capacity))
            .clone()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently allocated on this device.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Allocates `size` zeroed bytes on this device.
    ///
    /// Exhausting the device is fatal.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Arc<DeviceBlock> {
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.capacity)
            });
        if let Err(used) = reserved {
            fatal(format!(
                "device {} allocation of {} bytes failed: {} of {} bytes in use",
                self.index, size, used, self.capacity
            ));
        }

        let bytes = alloc_zeroed(size, || format!("device {} allocation", self.index));
        Arc::new(DeviceBlock {
            device: self.clone(),
            bytes: RwLock::new(bytes),
        })
    }
}

/// A block of host memory.
#[derive(Debug)]
pub struct HostBlock {
    pub(crate) bytes: RwLock<Box<[u8]>>,
    pinned: bool,
}

impl HostBlock {
    /// Allocates `size` zeroed bytes of pageable host memory.
    pub fn new(size: usize) -> Arc<Self> {
        Self::allocate(size, false)
    }

    /// Wraps existing bytes as a host block.
    pub fn from_vec(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: RwLock::new(bytes.into_boxed_slice()),
            pinned: false,
        })
    }

    pub(crate) fn allocate(size: usize, pinned: bool) -> Arc<Self> {
        Arc::new(Self {
            bytes: RwLock::new(alloc_zeroed(size, || "host allocation".to_string())),
            pinned,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the block was allocated for DMA transfers to a device.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Copies the block contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.read().to_vec()
    }
}

/// A block of device memory, released back to its device on drop.
#[derive(Debug)]
pub struct DeviceBlock {
    device: Arc<Device>,
    pub(crate) bytes: RwLock<Box<[u8]>>,
}

impl DeviceBlock {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the block contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.read().to_vec()
    }
}

impl Drop for DeviceBlock {
    fn drop(&mut self) {
        let len = self.bytes.get_mut().len();
        self.device.in_use.fetch_sub(len, Ordering::AcqRel);
    }
}

fn alloc_zeroed(size: usize, what: impl FnOnce() -> String) -> Box<[u8]> {
    let mut bytes = Vec::new();
    if bytes.try_reserve_exact(size).is_err() {
        fatal(format!("{} of size {} failed", what(), size));
    }
    bytes.resize(size, 0);
    bytes.into_boxed_slice()
}

thread_local! {
    static BOUND: RefCell<Option<Arc<Device>>> = const { RefCell::new(None) };
}

/// Returns the device bound to the calling thread.
pub fn current() -> Option<Arc<Device>> {
    BOUND.with(|bound| bound.borrow().clone())
}

/// Binds `device` to the calling thread until the returned guard drops.
pub fn bind(device: Arc<Device>) -> DeviceBinding {
    let previous = BOUND.with(|bound| bound.borrow_mut().replace(device));
    DeviceBinding { previous }
}

/// Restores the previous thread binding on drop.
#[must_use = "the device is unbound when the binding is dropped"]
pub struct DeviceBinding {
    previous: Option<Arc<Device>>,
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BOUND.with(|bound| *bound.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_accounting() {
        let dev = Device::new(0, 1024);
        let a = dev.allocate(100);
        let b = dev.allocate(200);
        assert_eq!(dev.in_use(), 300);
        assert_eq!(a.len(), 100);
        assert!(a.bytes.read().iter().all(|b| *b == 0));

        drop(a);
        assert_eq!(dev.in_use(), 200);
        drop(b);
        assert_eq!(dev.in_use(), 0);
    }

    #[test]
    fn test_block_keeps_device_alive() {
        let block = Device::new(3, 64).allocate(8);
        assert_eq!(block.device().index(), 3);
        assert_eq!(block.device().in_use(), 8);
    }

    #[test]
    fn test_bind_nests_and_restores() {
        assert!(current().is_none());
        let outer = bind(Device::new(1, 16));
        {
            let _inner = bind(Device::new(2, 16));
            assert_eq!(current().map(|d| d.index()), Some(2));
        }
        assert_eq!(current().map(|d| d.index()), Some(1));
        drop(outer);
        assert!(current().is_none());
    }

    #[test]
    fn test_shared_device_is_reused() {
        let a = Device::shared(900, 4096);
        let b = Device::shared(900, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.capacity(), 4096);
    }

    #[test]
    fn test_host_block_from_vec() {
        let block = HostBlock::from_vec(vec![1, 2, 3]);
        assert_eq!(block.to_vec(), vec![1, 2, 3]);
        assert!(!block.is_pinned());
        assert!(HostBlock::allocate(4, true).is_pinned());
    }
}
