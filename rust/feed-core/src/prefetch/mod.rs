// rust/feed-core/src/prefetch/mod.rs

//! Batch assembly and the prefetch ring.
//!
//! A [`BatchLoader`] turns records into [`Batch`]es; a [`PrefetchRing`]
//! runs the loader on a background thread over a fixed pool of batches so
//! the consumer always finds the next batch ready, staged on its device when
//! one is configured.

mod loader;
mod ring;
mod tensor;

pub use loader::{BatchLoader, Loaded, RecordBatchLoader};
pub use ring::{PrefetchRing, RingOptions};
pub use tensor::{Batch, Tensor};
