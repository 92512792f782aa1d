// rust/feed-core/src/lib.rs

//! Data feed for training replicas.
//!
//! This crate moves records from an on-disk database into host and device
//! memory ahead of the consumer, and splits a shared source deterministically
//! across concurrent consumers: one reader thread per source, one channel per
//! consumer, records dealt round-robin in registration order. Each consumer
//! then prefetches batches on its own loader thread into a fixed pool of
//! host/device buffers.

pub mod config;
pub mod error;
pub mod queue;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::{FeedConfig, Phase};
pub use error::{fatal, FeedError, Result};
pub use queue::BoundedSyncQueue;
pub use worker::{ContextGuard, StopToken, ThreadContext, Worker};

pub mod memory;
pub use memory::{Device, DualLocationBuffer, Head, TransferStream};

pub mod db;
pub use db::{Backend, Database, Mode};

pub mod record;
pub use record::{Datum, Passthrough, RawRecord, Record, Transform};

pub mod reader;
pub use reader::{ReaderHandle, RecordChannel, SourceKey, SourceRegistry, SourceSpec};

pub mod prefetch;
pub use prefetch::{Batch, BatchLoader, Loaded, PrefetchRing, RecordBatchLoader, RingOptions, Tensor};

pub mod pipeline;
pub use pipeline::DataFeed;
