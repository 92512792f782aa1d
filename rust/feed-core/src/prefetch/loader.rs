// rust/feed-core/src/prefetch/loader.rs

use std::time::Duration;

use super::Batch;
use crate::error::{FeedError, Result};
use crate::reader::ReaderHandle;
use crate::record::{Record, Transform};
use crate::worker::StopToken;

/// Outcome of [`BatchLoader::load_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loaded {
    Ready,
    /// A stop was requested before the batch was complete.
    Interrupted,
}

/// Fills batches for a [`PrefetchRing`](super::PrefetchRing).
pub trait BatchLoader: Send + 'static {
    /// Shapes a pool slot before the loader thread starts. Runs on the
    /// thread that creates the ring.
    fn prepare(&mut self, batch: &mut Batch) -> Result<()>;

    /// Fills `batch` on the loader thread, reshaping it if needed.
    fn load_batch(&mut self, batch: &mut Batch, stop: &StopToken) -> Result<Loaded>;
}

/// Builds batches from the records of a [`ReaderHandle`].
///
/// Each batch takes its shape from its first record; every record of the
/// batch must produce a sample of that shape.
pub struct RecordBatchLoader<R: Record, T> {
    reader: ReaderHandle<R>,
    transform: T,
    batch_size: usize,
    first_record_wait: Duration,
}

impl<R: Record, T: Transform<R>> RecordBatchLoader<R, T> {
    /// `first_record_wait` bounds how long [`BatchLoader::prepare`] waits
    /// for the source to deliver a record to shape the pool from.
    pub fn new(
        reader: ReaderHandle<R>,
        transform: T,
        batch_size: usize,
        first_record_wait: Duration,
    ) -> Self {
        Self {
            reader,
            transform,
            batch_size,
            first_record_wait,
        }
    }

    pub fn reader(&self) -> &ReaderHandle<R> {
        &self.reader
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn shape_batch(&self, batch: &mut Batch, sample_shape: &[usize]) {
        let mut shape = Vec::with_capacity(sample_shape.len() + 1);
        shape.push(self.batch_size);
        shape.extend_from_slice(sample_shape);
        batch.data.reshape(&shape);
        if let Some(label) = batch.label.as_mut() {
            label.reshape(&[self.batch_size]);
        }
    }
}

fn missing_label() -> FeedError {
    FeedError::config("labels were requested but the records carry none")
}

impl<R: Record, T: Transform<R>> BatchLoader for RecordBatchLoader<R, T> {
    fn prepare(&mut self, batch: &mut Batch) -> Result<()> {
        let filled = self.reader.filled();
        let peeked = filled.peek_timeout_with(self.first_record_wait, |record| {
            (self.transform.sample_shape(record), record.label().is_some())
        });
        let (sample_shape, has_label) = match peeked {
            Some(peeked) => peeked,
            None => return Err(FeedError::starved(filled.name(), self.first_record_wait)),
        };
        let sample_shape = sample_shape?;
        if batch.label.is_some() && !has_label {
            return Err(missing_label());
        }
        self.shape_batch(batch, &sample_shape);
        Ok(())
    }

    fn load_batch(&mut self, batch: &mut Batch, stop: &StopToken) -> Result<Loaded> {
        let Some(first) = self.reader.filled().pop_interruptible(stop) else {
            return Ok(Loaded::Interrupted);
        };
        let sample_shape = match self.transform.sample_shape(&first) {
            Ok(shape) => shape,
            Err(e) => {
                self.reader.empty().push(first);
                return Err(e);
            }
        };
        self.shape_batch(batch, &sample_shape);

        let sample_len = batch.data.byte_len() / self.batch_size;
        let mut data = batch.data.host_bytes_mut();
        let mut labels = batch.label.as_mut().map(|label| label.host_bytes_mut());

        let mut pending = Some(first);
        for item in 0..self.batch_size {
            let record = match pending.take() {
                Some(record) => record,
                None => match self.reader.filled().pop_interruptible(stop) {
                    Some(record) => record,
                    None => return Ok(Loaded::Interrupted),
                },
            };

            let sample = &mut data[item * sample_len..(item + 1) * sample_len];
            let mut result = self.transform.apply(&record, sample);
            if result.is_ok() {
                if let Some(labels) = labels.as_mut() {
                    match record.label() {
                        Some(label) => {
                            labels[item * 4..item * 4 + 4].copy_from_slice(&label.to_le_bytes())
                        }
                        None => result = Err(missing_label()),
                    }
                }
            }
            self.reader.empty().push(record);
            result?;
        }
        Ok(Loaded::Ready)
    }
}
