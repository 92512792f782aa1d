// rust/feed-core/src/pipeline.rs

//! One consumer's view of a data source.
//!
//! [`DataFeed`] ties together the pieces a training replica needs: a
//! [`ReaderHandle`] on the shared source, a [`RecordBatchLoader`] that
//! assembles batches from it, and a [`PrefetchRing`] that keeps batches
//! loaded (and staged on the device) ahead of the consumer.
//!
//! # Example
//!
//! ```no_run
//! use feed_core::record::{Datum, Passthrough};
//! use feed_core::{DataFeed, FeedConfig, Tensor};
//!
//! let config = FeedConfig::from_file("feed.toml").unwrap().with_env_overrides();
//! let feed = DataFeed::open::<Datum, _>(&config, Passthrough).unwrap();
//!
//! let mut data = Tensor::new(1);
//! let mut labels = Tensor::new(4);
//! for _ in 0..100 {
//!     feed.forward(&mut data, Some(&mut labels));
//!     // train on data / labels
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FeedConfig;
use crate::error::Result;
use crate::memory::Device;
use crate::prefetch::{Batch, PrefetchRing, RecordBatchLoader, RingOptions, Tensor};
use crate::reader::{ReaderHandle, SourceKey, SourceRegistry};
use crate::record::{Record, Transform};

/// A consumer of one source: reader, loader thread and batch pool.
pub struct DataFeed {
    key: SourceKey,
    batch_size: usize,
    ring: PrefetchRing,
}

impl DataFeed {
    /// Opens a feed from a configuration file, applying `FEED_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the feed cannot
    /// be opened.
    pub fn from_config_file<R, T>(path: impl AsRef<Path>, transform: T) -> Result<Self>
    where
        R: Record,
        T: Transform<R>,
    {
        let config = FeedConfig::from_file(path)?.with_env_overrides();
        Self::open::<R, T>(&config, transform)
    }

    /// Opens a feed on the process-wide source registry.
    ///
    /// Blocks until the source has delivered the first record, which
    /// determines the batch shape. In the train phase the source waits for
    /// every expected consumer to register before delivering, so replicas
    /// must be opened concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the source cannot
    /// be opened or is empty, or no record arrives within the starvation
    /// timeout.
    pub fn open<R, T>(config: &FeedConfig, transform: T) -> Result<Self>
    where
        R: Record,
        T: Transform<R>,
    {
        Self::open_in::<R, T>(SourceRegistry::global(), config, transform)
    }

    /// Like [`DataFeed::open`], sharing sources through `registry`.
    pub fn open_in<R, T>(
        registry: Arc<SourceRegistry>,
        config: &FeedConfig,
        transform: T,
    ) -> Result<Self>
    where
        R: Record,
        T: Transform<R>,
    {
        config.validate()?;

        let spec = config.source_spec();
        let key = spec.key();
        let reader = ReaderHandle::<R>::open_in(registry, &spec, config.channel_depth())?;
        let loader = RecordBatchLoader::new(
            reader,
            transform,
            config.source.batch_size,
            config.starvation_timeout(),
        );

        let device = config
            .device
            .enabled
            .then(|| Device::shared(config.device.index, config.device.capacity_bytes));
        let options = RingOptions {
            name: key.to_string(),
            pool_size: config.prefetch.pool_size,
            starvation_timeout: config.starvation_timeout(),
            device,
            output_labels: config.prefetch.output_labels,
        };
        let ring = PrefetchRing::start(options, loader)?;

        tracing::info!(
            source = %key,
            batch_size = config.source.batch_size,
            "opened data feed"
        );
        Ok(Self {
            key,
            batch_size: config.source.batch_size,
            ring,
        })
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.ring.device()
    }

    pub fn ring(&self) -> &PrefetchRing {
        &self.ring
    }

    /// Copies the next batch into `data` (and `labels`), reshaping them.
    /// Aborts the process if no batch arrives within the starvation timeout.
    pub fn forward(&self, data: &mut Tensor, labels: Option<&mut Tensor>) {
        self.ring.forward(data, labels);
    }

    /// Borrows the next batch without copying it. Hand it back with
    /// [`DataFeed::recycle`].
    pub fn take(&self) -> Box<Batch> {
        self.ring.take_full()
    }

    /// Like [`DataFeed::take`], returning a starvation error after `timeout`.
    pub fn try_take(&self, timeout: Duration) -> Result<Box<Batch>> {
        self.ring.try_take_full(timeout)
    }

    pub fn recycle(&self, batch: Box<Batch>) {
        self.ring.recycle(batch);
    }
}
