// rust/feed-core/src/reader/channel.rs

use crate::queue::BoundedSyncQueue;
use crate::record::Record;

/// The empty/filled queue pair connecting one consumer to its source.
///
/// A channel owns a fixed population of records, created at construction.
/// The source pops from `empty`, decodes into the record and pushes it to
/// `filled`; the consumer does the reverse.
pub struct RecordChannel<R> {
    empty: BoundedSyncQueue<R>,
    filled: BoundedSyncQueue<R>,
    depth: usize,
}

impl<R: Record> RecordChannel<R> {
    /// Creates a channel holding `depth` default records in its empty queue.
    pub fn new(name: &str, depth: usize) -> Self {
        let empty = BoundedSyncQueue::named(format!("{name}/empty"));
        for _ in 0..depth {
            empty.push(R::default());
        }
        Self {
            empty,
            filled: BoundedSyncQueue::named(format!("{name}/filled")),
            depth,
        }
    }
}

impl<R> RecordChannel<R> {
    pub fn empty(&self) -> &BoundedSyncQueue<R> {
        &self.empty
    }

    pub fn filled(&self) -> &BoundedSyncQueue<R> {
        &self.filled
    }

    /// Number of records owned by this channel.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Records currently parked in either queue.
    pub fn queued(&self) -> usize {
        self.empty.len() + self.filled.len()
    }
}
