// rust/feed-core/src/memory/buffer.rs

//! Lazily synchronized host/device byte buffer.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{fatal, FeedError, Result};

use super::device::{self, Device, DeviceBlock, HostBlock};
use super::stream::TransferStream;

/// Read-only view of one side of a buffer.
pub type BytesRef<'a> = MappedRwLockReadGuard<'a, [u8]>;
/// Writable view of one side of a buffer.
pub type BytesMut<'a> = MappedRwLockWriteGuard<'a, [u8]>;

/// Which copy of a [`DualLocationBuffer`] is up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    /// Nothing allocated yet.
    Uninitialized,
    /// The host copy is ahead of the device copy.
    AtHost,
    /// The device copy is ahead of the host copy.
    AtDevice,
    /// Both copies hold the same bytes.
    Synced,
}

/// Transfers and allocations performed by one buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferCounts {
    pub host_to_device: u64,
    pub device_to_host: u64,
    pub host_allocations: u64,
    pub device_allocations: u64,
}

/// One logical byte array homed on the host, a device, or both.
///
/// Every view first synchronizes the side it exposes; mutable views then
/// mark that side as the only up-to-date copy. Device-side allocations land
/// on the device bound to the calling thread (see [`device::bind`]).
#[derive(Debug)]
pub struct DualLocationBuffer {
    size: usize,
    head: Head,
    host: Option<Arc<HostBlock>>,
    device: Option<Arc<DeviceBlock>>,
    own_host_data: bool,
    own_device_data: bool,
    counts: TransferCounts,
}

impl DualLocationBuffer {
    /// Creates an uninitialized buffer of `size` bytes. Nothing is allocated
    /// until a view is requested.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            head: Head::Uninitialized,
            host: None,
            device: None,
            own_host_data: false,
            own_device_data: false,
            counts: TransferCounts::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn head(&self) -> Head {
        self.head
    }

    pub fn transfer_counts(&self) -> TransferCounts {
        self.counts
    }

    pub fn owns_host_data(&self) -> bool {
        self.own_host_data
    }

    pub fn owns_device_data(&self) -> bool {
        self.own_device_data
    }

    /// Index of the device holding the device copy, if one was allocated.
    pub fn device_index(&self) -> Option<u32> {
        self.device.as_ref().map(|block| block.device().index())
    }

    /// Changes the buffer size. A different size drops both copies and
    /// returns the buffer to [`Head::Uninitialized`]. Resizing to the
    /// current size keeps both copies, their data and the head unchanged.
    pub fn resize(&mut self, size: usize) {
        if size == self.size {
            return;
        }
        self.release();
        self.size = size;
    }

    /// Host view, copying from the device first if the device is ahead.
    pub fn host_view(&mut self) -> BytesRef<'_> {
        self.to_host();
        RwLockReadGuard::map(self.host_block().bytes.read(), |b| &**b)
    }

    /// Writable host view. The host becomes the only up-to-date copy.
    pub fn mutable_host_view(&mut self) -> BytesMut<'_> {
        self.to_host();
        self.head = Head::AtHost;
        RwLockWriteGuard::map(self.host_block().bytes.write(), |b| &mut **b)
    }

    /// Device view, copying from the host first if the host is ahead.
    pub fn device_view(&mut self) -> BytesRef<'_> {
        self.to_device();
        RwLockReadGuard::map(self.device_block().bytes.read(), |b| &**b)
    }

    /// Writable device view. The device becomes the only up-to-date copy.
    pub fn mutable_device_view(&mut self) -> BytesMut<'_> {
        self.to_device();
        self.head = Head::AtDevice;
        RwLockWriteGuard::map(self.device_block().bytes.write(), |b| &mut **b)
    }

    /// Attaches an externally owned host allocation. The buffer never frees
    /// it; the host becomes the up-to-date copy.
    pub fn set_host_data(&mut self, block: Arc<HostBlock>) -> Result<()> {
        if block.len() != self.size {
            return Err(FeedError::shape(format!(
                "host block of {} bytes attached to a buffer of {} bytes",
                block.len(),
                self.size
            )));
        }
        self.host = Some(block);
        self.own_host_data = false;
        self.head = Head::AtHost;
        Ok(())
    }

    /// Attaches an externally owned device allocation. The buffer never
    /// frees it; the device becomes the up-to-date copy.
    pub fn set_device_data(&mut self, block: Arc<DeviceBlock>) -> Result<()> {
        if block.len() != self.size {
            return Err(FeedError::shape(format!(
                "device block of {} bytes attached to a buffer of {} bytes",
                block.len(),
                self.size
            )));
        }
        self.device = Some(block);
        self.own_device_data = false;
        self.head = Head::AtDevice;
        Ok(())
    }

    /// Issues a host-to-device copy on `stream` without waiting for it.
    ///
    /// The buffer is marked synchronized immediately. The device copy must
    /// not be read until the caller has called
    /// [`TransferStream::synchronize`] on the same stream.
    pub fn async_push_to_device(&mut self, stream: &TransferStream) {
        if self.head != Head::AtHost {
            fatal(format!(
                "async push to device {} requires a host-authoritative buffer, head is {:?}",
                stream.device().index(),
                self.head
            ));
        }

        let device = match &self.device {
            Some(block) => block.clone(),
            None => {
                let block = self.allocate_device(stream.device());
                self.device = Some(block.clone());
                self.own_device_data = true;
                block
            }
        };
        let host = self.host_block_arc();
        stream.enqueue_copy(host, device);
        self.counts.host_to_device += 1;
        self.head = Head::Synced;
    }

    fn to_host(&mut self) {
        match self.head {
            Head::Uninitialized => {
                self.host = Some(self.allocate_host());
                self.own_host_data = true;
                self.head = Head::AtHost;
            }
            Head::AtDevice => {
                if self.host.is_none() {
                    self.host = Some(self.allocate_host());
                    self.own_host_data = true;
                }
                let host = self.host_block();
                let device = self.device_block();
                let mut dst = host.bytes.write();
                let src = device.bytes.read();
                dst.copy_from_slice(&src);
                drop(src);
                drop(dst);
                self.counts.device_to_host += 1;
                self.head = Head::Synced;
            }
            Head::AtHost | Head::Synced => {}
        }
    }

    fn to_device(&mut self) {
        match self.head {
            Head::Uninitialized => {
                let device = self.bound_device();
                self.device = Some(self.allocate_device(&device));
                self.own_device_data = true;
                self.head = Head::AtDevice;
            }
            Head::AtHost => {
                if self.device.is_none() {
                    let device = self.bound_device();
                    self.device = Some(self.allocate_device(&device));
                    self.own_device_data = true;
                }
                let host = self.host_block();
                let device = self.device_block();
                let src = host.bytes.read();
                let mut dst = device.bytes.write();
                dst.copy_from_slice(&src);
                drop(dst);
                drop(src);
                self.counts.host_to_device += 1;
                self.head = Head::Synced;
            }
            Head::AtDevice | Head::Synced => {}
        }
    }

    fn allocate_host(&mut self) -> Arc<HostBlock> {
        self.counts.host_allocations += 1;
        // Pin host memory on threads that feed a device.
        HostBlock::allocate(self.size, device::current().is_some())
    }

    fn allocate_device(&mut self, device: &Arc<Device>) -> Arc<DeviceBlock> {
        self.counts.device_allocations += 1;
        device.allocate(self.size)
    }

    fn bound_device(&self) -> Arc<Device> {
        if let Some(block) = &self.device {
            return block.device().clone();
        }
        match device::current() {
            Some(device) => device,
            None => fatal("device memory requested on a thread with no bound device"),
        }
    }

    fn host_block(&self) -> &HostBlock {
        match self.host.as_deref() {
            Some(block) => block,
            None => fatal(format!("buffer in state {:?} has no host copy", self.head)),
        }
    }

    fn host_block_arc(&self) -> Arc<HostBlock> {
        match &self.host {
            Some(block) => block.clone(),
            None => fatal(format!("buffer in state {:?} has no host copy", self.head)),
        }
    }

    fn device_block(&self) -> &DeviceBlock {
        match self.device.as_deref() {
            Some(block) => block,
            None => fatal(format!("buffer in state {:?} has no device copy", self.head)),
        }
    }

    fn release(&mut self) {
        // Dropping our reference frees owned blocks; attached blocks stay
        // alive through their owner's reference.
        self.host = None;
        self.device = None;
        self.own_host_data = false;
        self.own_device_data = false;
        self.head = Head::Uninitialized;
    }
}

impl Default for DualLocationBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}
