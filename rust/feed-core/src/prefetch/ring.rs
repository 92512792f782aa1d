// rust/feed-core/src/prefetch/ring.rs

use std::sync::Arc;
use std::time::Duration;

use super::{Batch, BatchLoader, Loaded, Tensor};
use crate::error::{fatal, FeedError, Result};
use crate::memory::{device, Device, TransferStream};
use crate::queue::BoundedSyncQueue;
use crate::worker::{StopToken, Worker};

type Slots = BoundedSyncQueue<Box<Batch>>;

/// Options for a [`PrefetchRing`].
#[derive(Debug, Clone)]
pub struct RingOptions {
    /// Name used for the loader thread and the ring's queues.
    pub name: String,
    pub pool_size: usize,
    /// How long [`PrefetchRing::take_full`] waits before aborting.
    pub starvation_timeout: Duration,
    /// Device to stage batches onto, if any.
    pub device: Option<Arc<Device>>,
    pub output_labels: bool,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            name: "prefetch".to_string(),
            pool_size: 3,
            starvation_timeout: Duration::from_secs(30),
            device: None,
            output_labels: true,
        }
    }
}

/// A fixed pool of batches cycling between a loader thread and the
/// consumer.
///
/// The loader pops a free batch, fills it, stages it on the device when one
/// is configured (waiting for the transfer to finish), and pushes it to the
/// full queue. The consumer takes full batches and hands them back once
/// their contents have been copied out.
pub struct PrefetchRing {
    free: Arc<Slots>,
    full: Arc<Slots>,
    options: RingOptions,
    worker: Worker,
}

impl PrefetchRing {
    /// Shapes and warms up every batch slot on the calling thread, then
    /// starts the loader thread.
    ///
    /// # Errors
    ///
    /// Returns an error if `loader` cannot shape the pool or a thread cannot
    /// be started.
    pub fn start<L: BatchLoader>(options: RingOptions, mut loader: L) -> Result<Self> {
        if options.pool_size == 0 {
            return Err(FeedError::config("prefetch pool size must be greater than 0"));
        }
        let free = Arc::new(Slots::named(format!("{}/free", options.name)));
        let full = Arc::new(Slots::named(format!("{}/full", options.name)));

        // Allocations below, and the loader thread, land on the ring's device.
        let _binding = options.device.clone().map(device::bind);

        for _ in 0..options.pool_size {
            let mut batch = Box::new(Batch::new(options.output_labels));
            loader.prepare(&mut batch)?;
            warm_up(&mut batch.data, options.device.is_some());
            if let Some(label) = batch.label.as_mut() {
                warm_up(label, options.device.is_some());
            }
            free.push(batch);
        }
        tracing::info!(
            ring = %options.name,
            pool_size = options.pool_size,
            device = ?options.device.as_ref().map(|d| d.index()),
            "initialized prefetch data"
        );

        let stream = match &options.device {
            Some(device) => Some(TransferStream::new(device.clone())?),
            None => None,
        };

        let mut worker = Worker::new(format!("{}/loader", options.name));
        let name = options.name.clone();
        let (loader_free, loader_full) = (free.clone(), full.clone());
        worker.start(move |stop| {
            run_loader(&name, loader, stream, &loader_free, &loader_full, &stop);
        })?;

        Ok(Self {
            free,
            full,
            options,
            worker,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.options.pool_size
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.options.device.as_ref()
    }

    /// Batches ready for the consumer.
    pub fn full_len(&self) -> usize {
        self.full.len()
    }

    /// Batches waiting for the loader.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Takes the next loaded batch, aborting the process if none arrives
    /// within the starvation timeout.
    pub fn take_full(&self) -> Box<Batch> {
        self.full.pop_or_abort(self.options.starvation_timeout)
    }

    /// Takes the next loaded batch, waiting at most `timeout`.
    pub fn try_take_full(&self, timeout: Duration) -> Result<Box<Batch>> {
        self.full
            .pop_timeout(timeout)
            .ok_or_else(|| FeedError::starved(self.full.name(), timeout))
    }

    /// Returns a consumed batch to the loader.
    pub fn recycle(&self, batch: Box<Batch>) {
        self.free.push(batch);
    }

    /// Copies the next batch into the consumer's tensors, reshaping them
    /// like the batch, and recycles it. With a device configured the copy
    /// happens in device memory.
    pub fn forward(&self, data_top: &mut Tensor, label_top: Option<&mut Tensor>) {
        let _binding = self.options.device.clone().map(device::bind);
        let on_device = self.options.device.is_some();

        let mut batch = self.take_full();
        data_top.reshape_like(&batch.data);
        data_top.copy_from(&mut batch.data, on_device);
        if let (Some(top), Some(label)) = (label_top, batch.label.as_mut()) {
            top.reshape_like(label);
            top.copy_from(label, on_device);
        }
        self.recycle(batch);
    }
}

impl Drop for PrefetchRing {
    fn drop(&mut self) {
        self.worker.stop();
        tracing::debug!(ring = %self.options.name, "stopped prefetch ring");
    }
}

/// Touches both views once so first-time allocation happens before the
/// loader thread exists.
fn warm_up(tensor: &mut Tensor, on_device: bool) {
    drop(tensor.host_bytes());
    if on_device {
        drop(tensor.device_bytes());
    }
}

fn run_loader<L: BatchLoader>(
    name: &str,
    mut loader: L,
    stream: Option<TransferStream>,
    free: &Slots,
    full: &Slots,
    stop: &StopToken,
) {
    while let Some(mut batch) = free.pop_interruptible(stop) {
        match loader.load_batch(&mut batch, stop) {
            Ok(Loaded::Ready) => {}
            Ok(Loaded::Interrupted) => return,
            Err(e) => fatal(format!("prefetch ring '{name}' failed to load a batch: {e}")),
        }
        if let Some(stream) = &stream {
            batch.data.buffer_mut().async_push_to_device(stream);
            if let Some(label) = batch.label.as_mut() {
                label.buffer_mut().async_push_to_device(stream);
            }
            stream.synchronize();
        }
        full.push(batch);
    }
}
