//! Feed Probe
//!
//! Operator tool for the data feed: writes synthetic record databases and
//! drives replica feeds against them.
//!
//! # Usage
//!
//! ```bash
//! # Write 10k 3x32x32 records with 10 label classes
//! feed-probe generate --path data/train.rec --count 10000 --classes 10
//!
//! # Run 4 replicas for 200 batches each
//! feed-probe run --path data/train.rec --replicas 4 --batches 200
//!
//! # Run from a configuration file
//! feed-probe run --config feed.toml --replicas 2
//! ```

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_core::record::{Datum, Passthrough};
use feed_core::{Backend, DataFeed, Database, FeedConfig, FeedError, Mode, Tensor, ThreadContext};

/// Data feed probe
#[derive(Parser, Debug)]
#[command(name = "feed-probe")]
#[command(about = "Generate record databases and drive replica feeds against them")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a database of synthetic Datum records
    Generate(GenerateArgs),
    /// Run replica feeds against a database and report what each saw
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct GenerateArgs {
    /// Database backend (memory, record_file, lmdb)
    #[arg(long, default_value = "record_file")]
    backend: Backend,

    /// Database path
    #[arg(long)]
    path: PathBuf,

    /// Number of records
    #[arg(long, default_value = "1000")]
    count: usize,

    #[arg(long, default_value = "3")]
    channels: u32,

    #[arg(long, default_value = "32")]
    height: u32,

    #[arg(long, default_value = "32")]
    width: u32,

    /// Number of label classes; records are labelled with their index when unset
    #[arg(long)]
    classes: Option<u32>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database backend, when no configuration file is given
    #[arg(long, default_value = "record_file")]
    backend: Backend,

    /// Database path, when no configuration file is given
    #[arg(long)]
    path: Option<PathBuf>,

    /// Batch size, when no configuration file is given
    #[arg(long, default_value = "32")]
    batch_size: usize,

    /// Stage batches on this device index
    #[arg(long)]
    device: Option<u32>,

    /// Number of replica feeds sharing the source
    #[arg(short, long, default_value = "1")]
    replicas: usize,

    /// Batches each replica consumes
    #[arg(short, long, default_value = "100")]
    batches: usize,

    /// Labels to print per replica
    #[arg(long, default_value = "16")]
    show_labels: usize,
}

/// What one replica observed.
#[derive(Debug)]
struct ReplicaReport {
    replica: usize,
    batches: usize,
    elapsed: Duration,
    labels: Vec<i32>,
}

impl ReplicaReport {
    fn batches_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.batches as f64 / secs
        } else {
            0.0
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Generate(args) => {
            let written = generate(&args)?;
            tracing::info!("Wrote {} records to {}", written, args.path.display());
        }
        Command::Run(args) => {
            let config = run_config(&args)?;
            tracing::info!("Source: {}", config.source.path.display());
            tracing::info!("  Backend: {}", config.source.backend);
            tracing::info!("  Replicas: {}", config.source.solver_count);
            tracing::info!("  Batch size: {}", config.source.batch_size);

            let reports = run(&config, args.batches)?;
            for report in &reports {
                let shown = &report.labels[..report.labels.len().min(args.show_labels)];
                println!(
                    "replica {}: {} batches in {:.2?} ({:.1} batches/s), labels {:?}",
                    report.replica,
                    report.batches,
                    report.elapsed,
                    report.batches_per_sec(),
                    shown
                );
            }
        }
    }

    Ok(())
}

/// Writes `args.count` synthetic records and returns the number written.
fn generate(args: &GenerateArgs) -> feed_core::Result<usize> {
    if args.classes == Some(0) {
        return Err(FeedError::config("--classes must be greater than 0"));
    }

    let db = Database::open(args.backend, &args.path, Mode::New, &Default::default())?;
    let mut writer = db.writer()?;
    let sample_len = (args.channels * args.height * args.width) as usize;
    for index in 0..args.count {
        let data = (0..sample_len).map(|i| (index + i) as u8).collect();
        let label = match args.classes {
            Some(classes) => (index % classes as usize) as i32,
            None => index as i32,
        };
        let datum = Datum::new(args.channels, args.height, args.width, data, label);
        writer.put(&datum.to_bytes()?)?;
    }
    writer.commit()?;
    Ok(args.count)
}

fn run_config(args: &RunArgs) -> feed_core::Result<FeedConfig> {
    let mut config = match &args.config {
        Some(path) => FeedConfig::from_file(path)?,
        None => {
            let mut config = FeedConfig::default();
            config.source.backend = args.backend;
            config.source.batch_size = args.batch_size;
            if let Some(path) = &args.path {
                config.source.path = path.clone();
            }
            config
        }
    }
    .with_env_overrides();

    config.source.solver_count = args.replicas;
    if let Some(index) = args.device {
        config.device.enabled = true;
        config.device.index = index;
    }
    config.validate()?;
    Ok(config)
}

/// Opens one feed per replica, each on its own thread, and consumes
/// `batches` batches from each.
///
/// Replicas register one after another so replica `i` receives the `i`-th
/// slice of every round.
fn run(config: &FeedConfig, batches: usize) -> feed_core::Result<Vec<ReplicaReport>> {
    let replicas = config.source.solver_count;
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(replicas);

    for replica in 0..replicas {
        let (replica_config, tx) = (config.clone(), tx.clone());
        let (opened_tx, opened_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("replica-{replica}"))
            .spawn(move || {
                // Feed threads started below inherit the replica's context.
                let _context = ThreadContext {
                    seed: replica as u64,
                    solver_count: replicas,
                    root_solver: replica == 0,
                }
                .install();
                let started = Instant::now();
                let feed = match DataFeed::open::<Datum, _>(&replica_config, Passthrough) {
                    Ok(feed) => feed,
                    Err(e) => {
                        let _ = opened_tx.send(());
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = opened_tx.send(());

                let mut data = Tensor::new(1);
                let mut labels = Tensor::new(4);
                let mut seen = Vec::new();
                for _ in 0..batches {
                    if replica_config.prefetch.output_labels {
                        feed.forward(&mut data, Some(&mut labels));
                        seen.extend(labels.host_i32s());
                    } else {
                        feed.forward(&mut data, None);
                    }
                }
                let _ = tx.send(Ok(ReplicaReport {
                    replica,
                    batches,
                    elapsed: started.elapsed(),
                    labels: seen,
                }));
            })
            .map_err(|e| FeedError::worker(format!("replica-{replica}"), e))?;
        handles.push(handle);

        // Open returns once the replica's first record has arrived, which
        // follows its registration.
        let _ = opened_rx.recv_timeout(config.starvation_timeout());
    }
    drop(tx);

    let mut reports = Vec::with_capacity(replicas);
    for result in rx {
        reports.push(result?);
    }
    for handle in handles {
        if handle.join().is_err() {
            tracing::warn!("replica thread panicked");
        }
    }
    reports.sort_by_key(|report| report.replica);
    Ok(reports)
}
