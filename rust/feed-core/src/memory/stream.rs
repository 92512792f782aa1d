// rust/feed-core/src/memory/stream.rs

//! Asynchronous host-to-device transfer stream.

use std::sync::Arc;

use crate::error::Result;
use crate::queue::BoundedSyncQueue;
use crate::worker::Worker;

use super::device::{Device, DeviceBlock, HostBlock};

enum StreamOp {
    Copy {
        src: Arc<HostBlock>,
        dst: Arc<DeviceBlock>,
    },
    Signal(Arc<BoundedSyncQueue<()>>),
}

/// An ordered queue of transfers into one device.
///
/// Copies run on the stream's own thread in issue order. Nothing issued on
/// a stream is guaranteed visible on the device until [`synchronize`]
/// returns.
///
/// [`synchronize`]: TransferStream::synchronize
pub struct TransferStream {
    device: Arc<Device>,
    ops: Arc<BoundedSyncQueue<StreamOp>>,
    worker: Worker,
}

impl TransferStream {
    /// Creates a stream and starts its copy thread.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let name = format!("transfer-stream:{}", device.index());
        let ops = Arc::new(BoundedSyncQueue::named(name.clone()));
        let mut worker = Worker::new(name);

        let pending = ops.clone();
        worker.start(move |stop| {
            while let Some(op) = pending.pop_interruptible(&stop) {
                match op {
                    StreamOp::Copy { src, dst } => {
                        // host before device, same as the buffer's sync paths
                        let src = src.bytes.read();
                        let mut dst = dst.bytes.write();
                        dst.copy_from_slice(&src);
                    }
                    StreamOp::Signal(done) => done.push(()),
                }
            }
        })?;

        Ok(Self { device, ops, worker })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn enqueue_copy(&self, src: Arc<HostBlock>, dst: Arc<DeviceBlock>) {
        self.ops.push(StreamOp::Copy { src, dst });
    }

    /// Blocks until every transfer issued so far has completed.
    pub fn synchronize(&self) {
        let done = Arc::new(BoundedSyncQueue::named(format!("{}/sync", self.worker.name())));
        self.ops.push(StreamOp::Signal(done.clone()));
        done.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_visible_after_synchronize() {
        let dev = Device::new(0, 1 << 16);
        let stream = TransferStream::new(dev.clone()).unwrap();

        let src = HostBlock::from_vec((0..64u8).collect());
        let dst = dev.allocate(64);
        stream.enqueue_copy(src, dst.clone());
        stream.synchronize();

        assert_eq!(dst.to_vec(), (0..64u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_copies_apply_in_issue_order() {
        let dev = Device::new(0, 1 << 16);
        let stream = TransferStream::new(dev.clone()).unwrap();
        let dst = dev.allocate(4);

        for fill in 1..=5u8 {
            stream.enqueue_copy(HostBlock::from_vec(vec![fill; 4]), dst.clone());
        }
        stream.synchronize();

        assert_eq!(dst.to_vec(), vec![5; 4]);
    }

    #[test]
    fn test_synchronize_on_idle_stream() {
        let stream = TransferStream::new(Device::new(1, 0)).unwrap();
        stream.synchronize();
        assert_eq!(stream.device().index(), 1);
    }
}
