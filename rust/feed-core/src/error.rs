// rust/feed-core/src/error.rs

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {

    #[error("Database error at '{path}': {message}")]
    Database {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Decode error: {message}")]
    Decode {
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Shape error: {message}")]
    Shape {
        message: String,
    },

    #[error("Failed to start worker '{name}'")]
    Worker {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue '{queue}' stayed empty for {waited:?}")]
    Starved {
        queue: String,
        waited: Duration,
    },
}

pub type Result<T> = std::result::Result<T, FeedError>;

// Convenience constructors
impl FeedError {

    pub fn database(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Database {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn database_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Database {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    pub fn worker(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Worker {
            name: name.into(),
            source,
        }
    }

    pub fn starved(queue: impl Into<String>, waited: Duration) -> Self {
        Self::Starved {
            queue: queue.into(),
            waited,
        }
    }
}

/// Terminates the process after an unrecoverable pipeline failure.
///
/// Background threads have no caller to report to, and a training loop that
/// keeps running on skipped or duplicated data is worse than no training
/// loop, so the fatal conditions of the feed end here.
#[cold]
pub fn fatal(message: impl Display) -> ! {
    tracing::error!("fatal: {message}");
    eprintln!("feed-core fatal error: {message}");
    std::process::abort()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_aborts_with_message() {
        if abort_check::in_child() {
            fatal("source 'x' broke");
        }
        let output = abort_check::run_in_child("error::tests::test_fatal_aborts_with_message");
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("feed-core fatal error: source 'x' broke"), "{stderr}");
    }

    #[test]
    fn test_database_error_display() {
        let err = FeedError::database("/data/train.rec", "database contains no records");
        let text = err.to_string();
        assert!(text.contains("/data/train.rec"));
        assert!(text.contains("no records"));
    }

    #[test]
    fn test_source_chain_is_preserved() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = FeedError::database_with_source("x.rec", "failed to open", io);
        assert!(err.source().is_some());

        let err = FeedError::worker("source:x", std::io::Error::other("spawn"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_starved_names_queue() {
        let err = FeedError::starved("data:train.rec/filled", Duration::from_millis(5));
        assert!(err.to_string().contains("data:train.rec/filled"));
    }
}
