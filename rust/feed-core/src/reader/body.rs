// rust/feed-core/src/reader/body.rs

use std::sync::Arc;

use super::{RecordChannel, SourceKey, SourceSpec};
use crate::db::{Cursor, Database, Mode};
use crate::error::{fatal, FeedError, Result};
use crate::queue::BoundedSyncQueue;
use crate::record::Record;
use crate::worker::{StopToken, Worker};

type Pending<R> = BoundedSyncQueue<Arc<RecordChannel<R>>>;

/// The reader thread shared by every consumer of one source.
///
/// The thread owns the database cursor. It holds the pending-registration
/// queue and the registered channels but never the body itself, so dropping
/// the last strong reference to the body stops the thread.
pub(crate) struct SourceBody<R: Record> {
    key: SourceKey,
    pending: Arc<Pending<R>>,
    worker: Worker,
}

impl<R: Record> SourceBody<R> {
    /// Opens the source database and starts the reader thread.
    pub(crate) fn start(spec: &SourceSpec) -> Result<Self> {
        let key = spec.key();
        let db = Database::open(spec.backend, &spec.path, Mode::Read, &spec.storage)?;
        let cursor = db.cursor()?;
        if !cursor.valid() {
            return Err(FeedError::database(&spec.path, "database contains no records"));
        }

        let pending = Arc::new(BoundedSyncQueue::named(format!("{key}/pending")));
        let reader = SourceReader {
            key: key.clone(),
            consumers: spec.consumers.max(1),
            pending: pending.clone(),
            cursor,
            _db: db,
        };

        let mut worker = Worker::new(format!("source:{key}"));
        worker.start(move |stop| reader.run(&stop))?;
        tracing::info!(source = %key, consumers = spec.consumers, "started source reader");

        Ok(Self {
            key,
            pending,
            worker,
        })
    }

    /// Queues `channel` for the reader thread to pick up.
    pub(crate) fn register(&self, channel: Arc<RecordChannel<R>>) {
        self.pending.push(channel);
    }
}

impl<R: Record> Drop for SourceBody<R> {
    fn drop(&mut self) {
        self.worker.stop();
        tracing::debug!(source = %self.key, "stopped source reader");
    }
}

/// State owned by the reader thread.
struct SourceReader<R: Record> {
    key: SourceKey,
    consumers: usize,
    pending: Arc<Pending<R>>,
    cursor: Cursor,
    _db: Database,
}

impl<R: Record> SourceReader<R> {
    fn run(mut self, stop: &StopToken) {
        // Every expected consumer gets one record before any gets a second.
        let mut active = Vec::with_capacity(self.consumers);
        for _ in 0..self.consumers {
            let Some(channel) = self.pending.pop_interruptible(stop) else {
                return;
            };
            if !self.read_one(&channel, stop) {
                return;
            }
            active.push(channel);
        }
        tracing::info!(
            source = %self.key,
            consumers = active.len(),
            "all consumers registered, distributing records round-robin"
        );

        while !stop.is_stop_requested() {
            for channel in &active {
                if !self.read_one(channel, stop) {
                    return;
                }
            }
            if !self.pending.is_empty() {
                fatal(format!(
                    "source '{}' expects {} consumers but another registered after startup",
                    self.key, self.consumers
                ));
            }
        }
    }

    /// Moves the cursor's current record into `channel`. Returns false when
    /// interrupted by a stop request.
    fn read_one(&mut self, channel: &RecordChannel<R>, stop: &StopToken) -> bool {
        let Some(mut record) = channel.empty().pop_interruptible(stop) else {
            return false;
        };
        if let Err(e) = record.decode_from(self.cursor.value()) {
            fatal(format!("source '{}': {e}", self.key));
        }
        channel.filled().push(record);

        if let Err(e) = self.cursor.next() {
            fatal(format!("source '{}': {e}", self.key));
        }
        if !self.cursor.valid() {
            tracing::debug!(source = %self.key, "restarting data prefetching from start");
            if let Err(e) = self.cursor.seek_to_first() {
                fatal(format!("source '{}': {e}", self.key));
            }
        }
        true
    }
}
