// rust/feed-core/src/memory/mod.rs

//! Host/device memory for batches.
//!
//! The device side is modelled as a bounded address space per device index
//! with an ordered transfer stream; the synchronization protocol of
//! [`DualLocationBuffer`] is the same one a real accelerator backend needs.
//!
//! # Example
//!
//! ```
//! use feed_core::memory::{device, Device, DualLocationBuffer, Head};
//!
//! let _binding = device::bind(Device::new(0, 1 << 20));
//! let mut buf = DualLocationBuffer::new(4);
//! buf.mutable_host_view().copy_from_slice(&[1, 2, 3, 4]);
//! assert_eq!(&*buf.device_view(), &[1, 2, 3, 4]);
//! assert_eq!(buf.head(), Head::Synced);
//! ```

mod buffer;
pub mod device;
mod stream;

pub use buffer::{BytesMut, BytesRef, DualLocationBuffer, Head, TransferCounts};
pub use device::{Device, DeviceBlock, HostBlock};
pub use stream::TransferStream;
