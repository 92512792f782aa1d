// rust/feed-core/src/reader/registry.rs

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use super::body::SourceBody;
use super::{RecordChannel, SourceKey, SourceSpec};
use crate::error::{FeedError, Result};
use crate::record::Record;

type ErasedBody = dyn Any + Send + Sync;

/// Maps source keys to the live reader body for that source.
///
/// Entries are non-owning: a body lives exactly as long as some
/// [`ReaderHandle`](super::ReaderHandle) holds it, and the handle that drops
/// the last reference erases the expired entry.
#[derive(Default)]
pub struct SourceRegistry {
    bodies: Mutex<HashMap<SourceKey, Weak<ErasedBody>>>,
}

static GLOBAL: OnceLock<Arc<SourceRegistry>> = OnceLock::new();

impl SourceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry used by [`ReaderHandle::open`](super::ReaderHandle::open).
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Finds or starts the body for `spec` and registers `channel` with it.
    ///
    /// Registration happens under the registry lock, so the order in which
    /// handles attach is the order in which the body serves them.
    pub(crate) fn attach<R: Record>(
        &self,
        spec: &SourceSpec,
        channel: Arc<RecordChannel<R>>,
    ) -> Result<Arc<SourceBody<R>>> {
        let key = spec.key();
        let mut bodies = self.bodies.lock();

        let live = bodies.get(&key).and_then(Weak::upgrade);
        let body = match live {
            Some(erased) => erased.downcast::<SourceBody<R>>().map_err(|_| {
                FeedError::config(format!(
                    "source '{key}' is already open with a different record type"
                ))
            })?,
            None => {
                let body = Arc::new(SourceBody::<R>::start(spec)?);
                let erased: Arc<ErasedBody> = body.clone();
                bodies.insert(key, Arc::downgrade(&erased));
                body
            }
        };

        body.register(channel);
        Ok(body)
    }

    /// Erases the entry for `key` if its body has been dropped.
    pub(crate) fn release(&self, key: &SourceKey) {
        let mut bodies = self.bodies.lock();
        if bodies.get(key).is_some_and(|w| w.strong_count() == 0) {
            bodies.remove(key);
            tracing::debug!(source = %key, "released source");
        }
    }

    /// Returns true if a live body is registered for `key`.
    pub fn contains(&self, key: &SourceKey) -> bool {
        self.bodies
            .lock()
            .get(key)
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Number of entries, live or not yet erased.
    pub fn len(&self) -> usize {
        self.bodies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bodies = self.bodies.lock();
        f.debug_struct("SourceRegistry")
            .field("sources", &bodies.keys().collect::<Vec<_>>())
            .finish()
    }
}
