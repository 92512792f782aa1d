// rust/feed-core/src/reader/handle.rs

use std::sync::Arc;

use super::body::SourceBody;
use super::{RecordChannel, SourceKey, SourceRegistry, SourceSpec};
use crate::error::Result;
use crate::queue::BoundedSyncQueue;
use crate::record::Record;

/// One consumer's connection to a shared source.
///
/// Filled records are taken from [`filled`](Self::filled) and handed back
/// through [`empty`](Self::empty) once consumed.
pub struct ReaderHandle<R: Record> {
    key: SourceKey,
    registry: Arc<SourceRegistry>,
    body: Option<Arc<SourceBody<R>>>,
    channel: Arc<RecordChannel<R>>,
}

impl<R: Record> ReaderHandle<R> {
    /// Opens a channel of `depth` records on the source described by `spec`,
    /// using the process-wide registry.
    ///
    /// # Errors
    ///
    /// Returns an error if this is the first handle for the source and its
    /// database cannot be opened or is empty.
    pub fn open(spec: &SourceSpec, depth: usize) -> Result<Self> {
        Self::open_in(SourceRegistry::global(), spec, depth)
    }

    /// Like [`open`](Self::open), against a specific registry.
    pub fn open_in(registry: Arc<SourceRegistry>, spec: &SourceSpec, depth: usize) -> Result<Self> {
        let key = spec.key();
        let channel = Arc::new(RecordChannel::new(key.as_str(), depth));
        let body = registry.attach(spec, channel.clone())?;
        tracing::debug!(source = %key, depth, "opened reader");

        Ok(Self {
            key,
            registry,
            body: Some(body),
            channel,
        })
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    /// Records decoded by the source, in cursor order.
    pub fn filled(&self) -> &BoundedSyncQueue<R> {
        self.channel.filled()
    }

    /// Consumed records waiting to be refilled.
    pub fn empty(&self) -> &BoundedSyncQueue<R> {
        self.channel.empty()
    }

    pub fn channel(&self) -> &RecordChannel<R> {
        &self.channel
    }

    /// Returns true if this handle shares its source body with `other`.
    pub fn shares_source_with(&self, other: &ReaderHandle<R>) -> bool {
        match (&self.body, &other.body) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<R: Record> Drop for ReaderHandle<R> {
    fn drop(&mut self) {
        // The last handle's drop stops the body thread here, before the
        // registry entry is erased and before the channel is freed.
        drop(self.body.take());
        self.registry.release(&self.key);
    }
}

impl<R: Record> std::fmt::Debug for ReaderHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderHandle")
            .field("key", &self.key)
            .field("depth", &self.channel.depth())
            .field("filled", &self.channel.filled().len())
            .finish()
    }
}
