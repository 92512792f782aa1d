// rust/feed-core/src/reader/mod.rs

//! Record distribution from a shared source to many consumers.
//!
//! Every distinct source (identified by owner name and path) gets one
//! reader thread. Each consumer opens a [`ReaderHandle`], which owns a
//! [`RecordChannel`] and registers it with the source. The reader thread
//! first serves one record to each of the expected consumers in the order
//! they registered, then keeps serving them round-robin, one record per
//! consumer per round, rewinding the cursor when it runs out. Which record
//! lands in which channel depends only on the database order, the consumer
//! count and the round index.

use std::fmt;
use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::db::Backend;

mod body;
mod channel;
mod handle;
mod registry;

pub use channel::RecordChannel;
pub use handle::ReaderHandle;
pub use registry::SourceRegistry;

/// Identity of a source: `"{name}:{path}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(name: &str, path: &std::path::Path) -> Self {
        Self(format!("{}:{}", name, path.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to open a source.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    /// Logical owner. Two owners of the same path read independently.
    pub name: String,
    pub path: PathBuf,
    pub backend: Backend,
    /// Consumers the reader waits for before steady state.
    pub consumers: usize,
    pub storage: StorageConfig,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, backend: Backend) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            backend,
            consumers: 1,
            storage: StorageConfig::default(),
        }
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(&self.name, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, Mode};
    use crate::record::{Datum, RawRecord};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    fn memory_source(path: &str, records: &[&str]) -> SourceSpec {
        let db = Database::open(Backend::Memory, path, Mode::New, &StorageConfig::default()).unwrap();
        let mut writer = db.writer().unwrap();
        for record in records {
            writer.put(record.as_bytes()).unwrap();
        }
        writer.commit().unwrap();
        SourceSpec::new("train", path, Backend::Memory)
    }

    fn take(handle: &ReaderHandle<RawRecord>, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| {
                let record = handle.filled().pop_timeout(WAIT).expect("record");
                let text = String::from_utf8(record.0.clone()).unwrap();
                handle.empty().push(record);
                text
            })
            .collect()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_source_key_format() {
        let spec = SourceSpec::new("data", "/srv/train.rec", Backend::RecordFile);
        assert_eq!(spec.key().as_str(), "data:/srv/train.rec");
        assert_eq!(spec.key().to_string(), "data:/srv/train.rec");
    }

    #[test]
    fn test_two_consumers_alternate_records() {
        let spec = memory_source("mem://reader-abcd", &["A", "B", "C", "D"]).with_consumers(2);
        let registry = SourceRegistry::new();
        let first = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 6).unwrap();
        let second = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 6).unwrap();

        assert_eq!(take(&first, 3), ["A", "C", "A"]);
        assert_eq!(take(&second, 3), ["B", "D", "B"]);
    }

    #[test]
    fn test_single_consumer_wraps_around() {
        let spec = memory_source("mem://reader-wrap", &["a", "b", "c"]);
        let handle = ReaderHandle::<RawRecord>::open_in(SourceRegistry::new(), &spec, 2).unwrap();
        assert_eq!(take(&handle, 7), ["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_round_robin_is_deterministic() {
        let records: Vec<String> = (0..7).map(|i| format!("r{i}")).collect();
        let refs: Vec<&str> = records.iter().map(String::as_str).collect();
        let spec = memory_source("mem://reader-determinism", &refs).with_consumers(3);

        let run = || {
            let registry = SourceRegistry::new();
            let handles: Vec<_> = (0..3)
                .map(|_| ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 4).unwrap())
                .collect();
            // The reader serves channels in lockstep, so consume round by
            // round; each channel holds fewer records than are read.
            let mut seen = vec![Vec::new(); handles.len()];
            for _ in 0..10 {
                for (consumer, handle) in handles.iter().enumerate() {
                    seen[consumer].extend(take(handle, 1));
                }
            }
            seen
        };

        let first = run();
        let second = run();
        assert_eq!(first, second);

        for (consumer, seen) in first.iter().enumerate() {
            for (round, record) in seen.iter().enumerate() {
                assert_eq!(record, &records[(round * 3 + consumer) % 7]);
            }
        }
    }

    #[test]
    fn test_channel_population_is_conserved() {
        let spec = memory_source("mem://reader-conservation", &["x", "y"]);
        let handle = ReaderHandle::<RawRecord>::open_in(SourceRegistry::new(), &spec, 4).unwrap();

        wait_until(|| handle.filled().len() == 4);
        assert_eq!(handle.channel().queued(), 4);

        let checked_out = handle.filled().pop();
        assert_eq!(handle.channel().queued() + 1, handle.channel().depth());

        handle.empty().push(checked_out);
        wait_until(|| handle.filled().len() == 4);
        assert_eq!(handle.channel().queued(), handle.channel().depth());
    }

    #[test]
    fn test_registry_shares_one_body_and_cleans_up() {
        let spec = memory_source("mem://reader-dedup", &["1", "2"]).with_consumers(2);
        let registry = SourceRegistry::new();

        let a = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();
        let b = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();
        assert!(a.shares_source_with(&b));
        assert!(registry.contains(&spec.key()));
        assert_eq!(registry.len(), 1);

        drop(a);
        assert!(registry.contains(&spec.key()));
        drop(b);
        assert!(!registry.contains(&spec.key()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_distinct_owners_read_independently() {
        let spec = memory_source("mem://reader-owners", &["p", "q"]);
        let other = SourceSpec {
            name: "validation".to_string(),
            ..spec.clone()
        };
        let registry = SourceRegistry::new();

        let a = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();
        let b = ReaderHandle::<RawRecord>::open_in(registry.clone(), &other, 2).unwrap();
        assert!(!a.shares_source_with(&b));
        assert_eq!(registry.len(), 2);

        assert_eq!(take(&a, 3), ["p", "q", "p"]);
        assert_eq!(take(&b, 3), ["p", "q", "p"]);
    }

    #[test]
    fn test_open_missing_source_fails() {
        let spec = SourceSpec::new("train", "mem://reader-does-not-exist", Backend::Memory);
        let registry = SourceRegistry::new();
        assert!(ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_while_waiting_for_other_consumers() {
        let spec = memory_source("mem://reader-startup", &["only"]).with_consumers(3);
        let registry = SourceRegistry::new();
        let handle = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();

        // The first consumer is served before the barrier.
        let record = handle.filled().pop_timeout(WAIT).unwrap();
        assert_eq!(record.as_bytes(), b"only");

        drop(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_type_mismatch_is_rejected() {
        let spec = memory_source("mem://reader-mismatch", &["z"]).with_consumers(2);
        let registry = SourceRegistry::new();
        let _raw = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();
        assert!(ReaderHandle::<Datum>::open_in(registry.clone(), &spec, 2).is_err());
    }

    #[test]
    fn test_late_registration_aborts() {
        if crate::error::abort_check::in_child() {
            let spec = memory_source("mem://reader-late-join", &["a", "b"]);
            let registry = SourceRegistry::new();
            let first = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();
            // Both records delivered: the reader is in steady state, waiting
            // for an empty record.
            wait_until(|| first.filled().len() == 2);

            let _late = ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 2).unwrap();
            // Freeing a record lets the reader finish a round and notice it.
            take(&first, 4);
            return;
        }
        let output = crate::error::abort_check::run_in_child("reader::tests::test_late_registration_aborts");
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("source 'train:mem://reader-late-join' expects 1 consumers"),
            "{stderr}"
        );
    }

    #[test]
    fn test_handles_on_separate_threads() {
        let spec = memory_source("mem://reader-threads", &["0", "1", "2", "3"]).with_consumers(2);
        let registry = SourceRegistry::new();
        let handles = vec![
            ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 3).unwrap(),
            ReaderHandle::<RawRecord>::open_in(registry.clone(), &spec, 3).unwrap(),
        ];

        let seen: Vec<Vec<String>> = thread::scope(|scope| {
            let workers: Vec<_> = handles.iter().map(|h| scope.spawn(move || take(h, 4))).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(seen[0], ["0", "2", "0", "2"]);
        assert_eq!(seen[1], ["1", "3", "1", "3"]);
        drop(handles);
        assert!(Arc::strong_count(&registry) == 1 && registry.is_empty());
    }
}
