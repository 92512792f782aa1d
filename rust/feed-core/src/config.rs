// rust/feed-core/src/config.rs

//! Configuration for a data feed.
//!
//! Configuration is parsed from TOML, optionally overridden from `FEED_*`
//! environment variables, and validated before use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::db::Backend;
use crate::error::{FeedError, Result};
use crate::reader::SourceSpec;

// Top-level feed configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub source: SourceConfig,
    pub prefetch: PrefetchConfig,
    pub device: DeviceConfig,
    pub storage: StorageConfig,
}

/// Training phase of the consumers reading a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Every solver replica reads its own slice of the source.
    #[default]
    Train,
    /// A single consumer reads the whole source.
    Test,
}

/// Where records come from and how many consumers share them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Owner name; part of the source identity together with `path`.
    pub name: String,
    pub path: PathBuf,
    pub backend: Backend,
    pub phase: Phase,
    // Number of solver replicas consuming the source in the train phase.
    pub solver_count: usize,
    pub batch_size: usize,
    // Batches of records buffered per consumer channel.
    pub prefetch: usize,
}

/// Batch prefetching options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of batches cycling between the loader thread and the consumer.
    pub pool_size: usize,
    /// How long the consumer waits for a batch before treating the feed as
    /// stalled.
    pub starvation_timeout_ms: u64,
    pub output_labels: bool,
}

/// Accelerator staging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub enabled: bool,
    pub index: u32,
    pub capacity_bytes: usize,
}

// Database access options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Buffer size in bytes for record-file I/O.
    pub buffer_size: usize,
    // Whether to memory-map record files.
    pub use_mmap: bool,
    // File size (bytes) at or above which record files are memory-mapped.
    pub mmap_threshold: u64,
    // Maximum size (bytes) of an LMDB environment.
    pub lmdb_map_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "data".to_string(),
            path: PathBuf::from("./data/train.rec"),
            backend: Backend::RecordFile,
            phase: Phase::Train,
            solver_count: 1,
            batch_size: 32,
            prefetch: 4,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            starvation_timeout_ms: 30_000,
            output_labels: true,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            index: 0,
            capacity_bytes: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,      // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
            lmdb_map_size: 1024 * 1024 * 1024,
        }
    }
}

impl FromStr for FeedConfig {
    type Err = FeedError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| FeedError::config_with_source("failed to parse TOML config", e))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}

impl FeedConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FeedError::config_with_source(
                format!("failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `FEED_` followed by the section and field
    // name, e.g. `FEED_SOURCE_PATH`, `FEED_PREFETCH_POOL_SIZE`,
    // `FEED_DEVICE_ENABLED`. Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Source overrides
        if let Ok(val) = std::env::var("FEED_SOURCE_NAME") {
            self.source.name = val;
        }
        if let Ok(val) = std::env::var("FEED_SOURCE_PATH") {
            self.source.path = PathBuf::from(val);
        }
        if let Some(v) = env_parse("FEED_SOURCE_BACKEND") {
            self.source.backend = v;
        }
        if let Ok(val) = std::env::var("FEED_SOURCE_PHASE") {
            match val.to_lowercase().as_str() {
                "train" => self.source.phase = Phase::Train,
                "test" => self.source.phase = Phase::Test,
                _ => {} // ignore invalid values
            }
        }
        if let Some(v) = env_parse("FEED_SOURCE_SOLVER_COUNT") {
            self.source.solver_count = v;
        }
        if let Some(v) = env_parse("FEED_SOURCE_BATCH_SIZE") {
            self.source.batch_size = v;
        }
        if let Some(v) = env_parse("FEED_SOURCE_PREFETCH") {
            self.source.prefetch = v;
        }

        // Prefetch overrides
        if let Some(v) = env_parse("FEED_PREFETCH_POOL_SIZE") {
            self.prefetch.pool_size = v;
        }
        if let Some(v) = env_parse("FEED_PREFETCH_STARVATION_TIMEOUT_MS") {
            self.prefetch.starvation_timeout_ms = v;
        }
        if let Some(v) = env_parse("FEED_PREFETCH_OUTPUT_LABELS") {
            self.prefetch.output_labels = v;
        }

        // Device overrides
        if let Some(v) = env_parse("FEED_DEVICE_ENABLED") {
            self.device.enabled = v;
        }
        if let Some(v) = env_parse("FEED_DEVICE_INDEX") {
            self.device.index = v;
        }
        if let Some(v) = env_parse("FEED_DEVICE_CAPACITY_BYTES") {
            self.device.capacity_bytes = v;
        }

        // Storage overrides
        if let Some(v) = env_parse("FEED_STORAGE_BUFFER_SIZE") {
            self.storage.buffer_size = v;
        }
        if let Some(v) = env_parse("FEED_STORAGE_USE_MMAP") {
            self.storage.use_mmap = v;
        }
        if let Some(v) = env_parse("FEED_STORAGE_MMAP_THRESHOLD") {
            self.storage.mmap_threshold = v;
        }
        if let Some(v) = env_parse("FEED_STORAGE_LMDB_MAP_SIZE") {
            self.storage.lmdb_map_size = v;
        }

        self
    }

    /// Records owned by each consumer channel: one batch per prefetch slot.
    pub fn channel_depth(&self) -> usize {
        self.source.prefetch * self.source.batch_size
    }

    /// Consumers the source reader waits for before distributing records.
    pub fn expected_consumers(&self) -> usize {
        match self.source.phase {
            Phase::Train => self.source.solver_count,
            Phase::Test => 1,
        }
    }

    pub fn starvation_timeout(&self) -> Duration {
        Duration::from_millis(self.prefetch.starvation_timeout_ms)
    }

    /// Source description for opening a [`ReaderHandle`](crate::reader::ReaderHandle).
    pub fn source_spec(&self) -> SourceSpec {
        SourceSpec::new(&self.source.name, &self.source.path, self.source.backend)
            .with_consumers(self.expected_consumers())
            .with_storage(self.storage.clone())
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Source validation
        if self.source.name.is_empty() {
            return Err(FeedError::config("source.name must not be empty"));
        }
        if self.source.path.as_os_str().is_empty() {
            return Err(FeedError::config("source.path must not be empty"));
        }
        if self.source.solver_count == 0 {
            return Err(FeedError::config(
                "source.solver_count must be greater than 0",
            ));
        }
        if self.source.batch_size == 0 {
            return Err(FeedError::config("source.batch_size must be greater than 0"));
        }
        if self.source.prefetch == 0 {
            return Err(FeedError::config("source.prefetch must be greater than 0"));
        }

        // Prefetch validation
        if self.prefetch.pool_size == 0 {
            return Err(FeedError::config("prefetch.pool_size must be greater than 0"));
        }
        if self.prefetch.starvation_timeout_ms == 0 {
            return Err(FeedError::config(
                "prefetch.starvation_timeout_ms must be greater than 0",
            ));
        }

        // Device validation
        if self.device.enabled && self.device.capacity_bytes == 0 {
            return Err(FeedError::config(
                "device.capacity_bytes must be greater than 0 when the device is enabled",
            ));
        }

        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(FeedError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }
        if self.source.backend == Backend::Lmdb && self.storage.lmdb_map_size == 0 {
            return Err(FeedError::config(
                "storage.lmdb_map_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();

        assert_eq!(config.source.name, "data");
        assert_eq!(config.source.backend, Backend::RecordFile);
        assert_eq!(config.source.phase, Phase::Train);
        assert_eq!(config.source.solver_count, 1);
        assert_eq!(config.source.batch_size, 32);
        assert_eq!(config.source.prefetch, 4);

        assert_eq!(config.prefetch.pool_size, 3);
        assert_eq!(config.prefetch.starvation_timeout_ms, 30_000);
        assert!(config.prefetch.output_labels);

        assert!(!config.device.enabled);
        assert_eq!(config.device.index, 0);

        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 1024 * 1024);
    }

    #[test]
    fn test_default_validates() {
        assert!(FeedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: FeedConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [source]
            name = "imagenet"
            path = "/data/imagenet.lmdb"
            backend = "lmdb"
            phase = "test"
            solver_count = 4
            batch_size = 64
            prefetch = 2

            [prefetch]
            pool_size = 5
            starvation_timeout_ms = 1000
            output_labels = false

            [device]
            enabled = true
            index = 2
            capacity_bytes = 4096

            [storage]
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152
            lmdb_map_size = 1048576
        "#;

        let config: FeedConfig = toml.parse().unwrap();

        assert_eq!(config.source.name, "imagenet");
        assert_eq!(config.source.path, PathBuf::from("/data/imagenet.lmdb"));
        assert_eq!(config.source.backend, Backend::Lmdb);
        assert_eq!(config.source.phase, Phase::Test);
        assert_eq!(config.source.solver_count, 4);
        assert_eq!(config.source.batch_size, 64);
        assert_eq!(config.source.prefetch, 2);

        assert_eq!(config.prefetch.pool_size, 5);
        assert_eq!(config.starvation_timeout(), Duration::from_secs(1));
        assert!(!config.prefetch.output_labels);

        assert!(config.device.enabled);
        assert_eq!(config.device.index, 2);
        assert_eq!(config.device.capacity_bytes, 4096);

        assert_eq!(config.storage.buffer_size, 131072);
        assert!(!config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 2097152);
        assert_eq!(config.storage.lmdb_map_size, 1048576);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<FeedConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_str_unknown_backend() {
        let result: std::result::Result<FeedConfig, _> = "[source]\nbackend = \"leveldb\"".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_derived_values() {
        let mut config = FeedConfig::default();
        config.source.batch_size = 8;
        config.source.prefetch = 3;
        config.source.solver_count = 4;
        assert_eq!(config.channel_depth(), 24);
        assert_eq!(config.expected_consumers(), 4);

        config.source.phase = Phase::Test;
        assert_eq!(config.expected_consumers(), 1);
    }

    #[test]
    fn test_source_spec() {
        let mut config = FeedConfig::default();
        config.source.name = "train".to_string();
        config.source.path = PathBuf::from("/srv/a.rec");
        config.source.solver_count = 2;
        config.storage.use_mmap = false;

        let spec = config.source_spec();
        assert_eq!(spec.key().as_str(), "train:/srv/a.rec");
        assert_eq!(spec.consumers, 2);
        assert!(!spec.storage.use_mmap);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [source]
            path = "/tmp/records.rec"
            "#
        )
        .unwrap();

        let config = FeedConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source.path, PathBuf::from("/tmp/records.rec"));
    }

    #[test]
    fn test_from_file_not_found() {
        assert!(FeedConfig::from_file("/nonexistent/feed.toml").is_err());
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[source]\nbatch_size = 0").unwrap();
        assert!(FeedConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let cases: [fn(&mut FeedConfig); 7] = [
            |c| c.source.name.clear(),
            |c| c.source.solver_count = 0,
            |c| c.source.batch_size = 0,
            |c| c.source.prefetch = 0,
            |c| c.prefetch.pool_size = 0,
            |c| c.prefetch.starvation_timeout_ms = 0,
            |c| c.storage.buffer_size = 0,
        ];
        for break_config in cases {
            let mut config = FeedConfig::default();
            break_config(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_validate_device_capacity() {
        let mut config = FeedConfig::default();
        config.device.capacity_bytes = 0;
        assert!(config.validate().is_ok());
        config.device.enabled = true;
        assert!(config.validate().is_err());
    }

    // Helper to clear all FEED_ environment variables for test isolation
    fn clear_feed_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("FEED_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test since env
    // vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_feed_env_vars();

        std::env::set_var("FEED_SOURCE_PATH", "/env/train.rec");
        std::env::set_var("FEED_SOURCE_BACKEND", "memory");
        std::env::set_var("FEED_SOURCE_PHASE", "test");
        std::env::set_var("FEED_SOURCE_BATCH_SIZE", "16");
        std::env::set_var("FEED_PREFETCH_POOL_SIZE", "6");
        std::env::set_var("FEED_DEVICE_ENABLED", "true");
        std::env::set_var("FEED_STORAGE_USE_MMAP", "false");

        let config = FeedConfig::default().with_env_overrides();

        assert_eq!(config.source.path, PathBuf::from("/env/train.rec"));
        assert_eq!(config.source.backend, Backend::Memory);
        assert_eq!(config.source.phase, Phase::Test);
        assert_eq!(config.source.batch_size, 16);
        assert_eq!(config.prefetch.pool_size, 6);
        assert!(config.device.enabled);
        assert!(!config.storage.use_mmap);

        clear_feed_env_vars();

        // Invalid values are ignored
        std::env::set_var("FEED_SOURCE_BATCH_SIZE", "lots");
        std::env::set_var("FEED_SOURCE_BACKEND", "leveldb");
        let config = FeedConfig::default().with_env_overrides();
        assert_eq!(config.source.batch_size, 32);
        assert_eq!(config.source.backend, Backend::RecordFile);

        clear_feed_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = FeedConfig::default();
        original.source.backend = Backend::Memory;
        original.source.phase = Phase::Test;
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: FeedConfig = toml_str.parse().unwrap();

        assert_eq!(parsed.source.backend, Backend::Memory);
        assert_eq!(parsed.source.phase, Phase::Test);
        assert_eq!(parsed.prefetch.pool_size, original.prefetch.pool_size);
        assert_eq!(parsed.storage.lmdb_map_size, original.storage.lmdb_map_size);
    }
}
