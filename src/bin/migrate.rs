//! CardinalSin Migrate Binary
//!
//! Copies the last `--last` of history from a remote-read endpoint into a
//! local TSDB directory.

use cardinalsin_migrate::clock::{BoundedClock, Clock};
use cardinalsin_migrate::config::{
    MigrationConfig, ReaderConfig, TsdbConfig, DEFAULT_READ_URL,
};
use cardinalsin_migrate::pipeline::Migration;
use cardinalsin_migrate::reader::Reader;
use cardinalsin_migrate::telemetry::{LogFormat, Telemetry};
use cardinalsin_migrate::tsdb::{LocalTsdb, WalConfig, WalSyncMode};
use cardinalsin_migrate::writer::Writer;
use cardinalsin_migrate::{Error, Result};

use clap::Parser;
use pprof::protos::Message;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CardinalSin Migrate
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Remote read endpoint of the source
    #[arg(long, env = "MIGRATE_READ_URL", default_value = DEFAULT_READ_URL)]
    read: String,

    /// Destination TSDB directory
    #[arg(long, env = "MIGRATE_WRITE_DIR", default_value = "data")]
    write: PathBuf,

    /// Check label and sample ordering of every fetched series
    #[arg(long)]
    check: bool,

    /// How far back to start migrating
    #[arg(long, default_value = "15d", value_parser = humantime::parse_duration)]
    last: Duration,

    /// Retention of the destination TSDB
    #[arg(long, default_value = "15d", value_parser = humantime::parse_duration)]
    tsdb_retention: Duration,

    /// Write a CPU profile of the run to this file
    #[arg(long)]
    cpuprofile: Option<PathBuf>,

    /// Batches that may wait between reader and writer
    #[arg(long, default_value = "100")]
    queue_capacity: usize,

    /// Width of one fetch/write slice
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    slice: Duration,

    /// How often progress is logged
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    progress_interval: Duration,

    /// WAL sync mode: every_write, interval_100ms, interval_1s, on_rotation, none
    #[arg(long, env = "WAL_SYNC_MODE", default_value = "every_write")]
    wal_sync_mode: String,

    /// Time span of one persisted TSDB block
    #[arg(long, default_value = "2h", value_parser = humantime::parse_duration)]
    block_range: Duration,

    /// Continue from the checkpoint left by an interrupted run
    #[arg(long)]
    resume: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let format = match args.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = Telemetry::init_for_component("cardinalsin-migrate", &args.log_level, format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Migration failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Interrupt received, committing queued batches before exit");
        on_signal.cancel();
    });

    let wal_sync_mode: WalSyncMode = args
        .wal_sync_mode
        .parse()
        .map_err(|e| Error::Config(format!("invalid WAL_SYNC_MODE: {e}")))?;

    let profile = args.cpuprofile.as_deref().map(CpuProfile::start).transpose()?;

    let clock: Arc<dyn Clock> = Arc::new(BoundedClock::default());
    let tsdb_config = TsdbConfig {
        dir: args.write.clone(),
        retention: args.tsdb_retention,
        block_range: args.block_range,
        wal: WalConfig {
            sync_mode: wal_sync_mode,
            ..Default::default()
        },
    };
    info!(
        dir = %tsdb_config.dir.display(),
        retention = %humantime::format_duration(tsdb_config.retention),
        block_range = %humantime::format_duration(tsdb_config.block_range),
        wal_sync_mode = %args.wal_sync_mode,
        "Opening destination TSDB"
    );
    let tsdb = LocalTsdb::open(tsdb_config, clock.clone()).await?;

    let reader = Reader::new(ReaderConfig {
        strict: args.check,
        ..ReaderConfig::new(&args.read)?
    })?;
    info!(url = %reader.url(), strict = args.check, "Reading from source");

    let migration = Migration::new(
        MigrationConfig {
            last: args.last,
            slice: args.slice,
            queue_capacity: args.queue_capacity,
            progress_interval: args.progress_interval,
            checkpoint_dir: args.resume.then(|| args.write.clone()),
        },
        clock,
    );

    let writer = Arc::new(Writer::new(Arc::new(tsdb)));
    let result = migration.run(Arc::new(reader), writer, cancel).await;

    if let Some(profile) = profile {
        if let Err(e) = profile.finish() {
            warn!(error = %e, "Writing CPU profile failed");
        }
    }

    let report = result?;
    if report.cancelled {
        info!(committed_end = %report.committed_end, "Migration interrupted");
    }
    Ok(())
}

/// CPU profile sampled for the lifetime of the run
struct CpuProfile {
    guard: pprof::ProfilerGuard<'static>,
    file: std::fs::File,
    path: PathBuf,
}

impl CpuProfile {
    fn start(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::create(path)?;
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(100)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .map_err(|e| Error::Config(format!("failed to start CPU profiler: {e}")))?;
        info!(path = %path.display(), "CPU profiling enabled");
        Ok(Self {
            guard,
            file,
            path: path.to_path_buf(),
        })
    }

    fn finish(mut self) -> Result<()> {
        let profile = self
            .guard
            .report()
            .build()
            .and_then(|report| report.pprof())
            .map_err(|e| Error::Internal(format!("building CPU profile: {e}")))?;

        let mut content = Vec::new();
        profile
            .encode(&mut content)
            .map_err(|e| Error::Serialization(format!("encoding CPU profile: {e}")))?;
        self.file.write_all(&content)?;
        info!(path = %self.path.display(), bytes = content.len(), "Wrote CPU profile");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
