//! The `catchup` CLI: the §6 external-interface surface wired to a live
//! `tokio-postgres` source connection and either a local or remote
//! `DataDirIo`.
//!
//! Mirrors the teacher's (`rcp`) own binary shape: a `clap` derive `Args`
//! struct with `help_heading` groups, `common::logging::init` for
//! structured output, and a thin `main` that translates parsed flags into
//! library calls and reports the one fatal error, if any, on exit.

mod pg;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use catchup::orchestrate::{CatchupReport, CatchupRequest};
use catchup::tablespace::TablespaceMap;
use catchup::types::BackupMode;
use clap::Parser;
use common::config::{OutputConfig, ThrottleConfig};
use remote::{DataDirIo, LocalIo, RemoteIo};

/// Environment variable carrying the source connection's password, the same
/// name `psql`/`pg_basebackup` read (no `--password` flag, so it never ends
/// up in `ps`'s argument listing).
const PGPASSWORD_VAR: &str = "PGPASSWORD";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "catchup",
    version,
    about = "Bring a destination PostgreSQL data directory up to date with a running source",
    long_about = "`catchup` brings a destination data directory into a state consistent with a \
running source instance, either by full copy (empty destination) or incremental \
reconciliation (DELTA or PTRACK). The result is a destination directory startable as an \
independent instance or as a physical replica.

EXAMPLES:
    # Full copy into an empty destination
    catchup --backup-mode=FULL --source-pgdata=/data/src --destination-pgdata=/data/dst \\
        --host=src.example.com --user=replicator

    # Incremental catchup against an existing destination
    catchup --backup-mode=DELTA --source-pgdata=/data/src --destination-pgdata=/data/dst \\
        --host=src.example.com --user=replicator --threads=8"
)]
struct Args {
    // Required.
    /// Backup mode: FULL (empty destination), DELTA (size/LSN compare), or
    /// PTRACK (server-reported changed-block maps)
    #[arg(long, value_name = "MODE", help_heading = "Required")]
    backup_mode: BackupMode,

    /// Source data directory. Required when the source is local (no
    /// `--source-remote-addr`); ignored for a remote source, which is
    /// enumerated over the `DataDirIo` channel instead
    #[arg(long, value_name = "PATH", help_heading = "Required")]
    source_pgdata: Option<PathBuf>,

    /// Destination data directory, always local
    #[arg(long, value_name = "PATH", help_heading = "Required")]
    destination_pgdata: PathBuf,

    // Transfer behavior.
    /// Number of parallel transfer-pool workers (C9); 0 = number of CPU cores
    #[arg(long, default_value_t = 0, value_name = "N", help_heading = "Transfer")]
    threads: usize,

    /// Stream WAL concurrently with file transfer. Always on: this core has
    /// no file-shipping fallback (§4.5). Accepted for command-line
    /// compatibility with tools that always pass it; its value is ignored
    #[arg(long, help_heading = "Transfer")]
    stream: bool,

    /// Map a source tablespace's absolute symlink target to a destination
    /// path. Repeatable: `--tablespace-mapping=SRC=DST`
    #[arg(long = "tablespace-mapping", value_name = "SRC=DST", help_heading = "Transfer")]
    tablespace_mapping: Vec<String>,

    /// Skip the finalizer's fsync pass
    #[arg(long, help_heading = "Transfer")]
    no_sync: bool,

    /// Maximum number of files the transfer pool may hold open at once (0 =
    /// unlimited)
    #[arg(long, default_value_t = 0, value_name = "N", help_heading = "Transfer")]
    max_open_files: usize,

    /// How long to wait for stop-backup and for streamed WAL to catch up to
    /// the stop LSN, in seconds
    #[arg(long, default_value_t = 300, value_name = "SECONDS", help_heading = "Transfer")]
    archive_timeout_sec: u64,

    // Remote source.
    /// Address (host:port) of a `catchup-remote` server exposing the source
    /// data directory. If set, the source is read over this channel instead
    /// of from `--source-pgdata` on the local filesystem
    #[arg(long, value_name = "HOST:PORT", help_heading = "Remote source")]
    source_remote_addr: Option<String>,

    // Source connection.
    /// Source database host
    #[arg(long, value_name = "HOST", help_heading = "Source connection")]
    host: Option<String>,

    /// Source database port
    #[arg(long, default_value_t = 5432, value_name = "PORT", help_heading = "Source connection")]
    port: u16,

    /// Source database user
    #[arg(long, value_name = "NAME", help_heading = "Source connection")]
    user: Option<String>,

    /// Source database name (the non-replication connection only; the
    /// replication-mode connection targets no particular database)
    #[arg(long, default_value = "postgres", value_name = "NAME", help_heading = "Source connection")]
    dbname: String,

    /// Pre-created physical replication slot name to stream WAL through
    #[arg(long, default_value = "catchup", value_name = "NAME", help_heading = "Source connection")]
    replication_slot: String,

    // Progress & output.
    /// Show a live progress bar on stderr while the transfer pool runs
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Print a byte/file-count summary when catchup finishes
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode: suppress non-error output
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,
}

fn conninfo(args: &Args, password: &Option<String>) -> String {
    let mut parts = vec![format!("port={}", args.port), format!("dbname={}", args.dbname)];
    if let Some(host) = &args.host {
        parts.push(format!("host={host}"));
    }
    if let Some(user) = &args.user {
        parts.push(format!("user={user}"));
    }
    if let Some(password) = password {
        parts.push(format!("password={password}"));
    }
    parts.join(" ")
}

fn replication_conninfo(args: &Args, password: &Option<String>) -> String {
    format!("{} replication=true", conninfo(args, password))
}

fn print_report(report: &CatchupReport) {
    println!(
        "catchup: {} read, {} written in {}",
        bytesize::ByteSize::b(report.bytes_read),
        bytesize::ByteSize::b(report.bytes_written),
        humantime::format_duration(report.elapsed),
    );
    println!(
        "  start LSN: {:X}, stop LSN: {:X}, recovery time: {}",
        report.start_lsn,
        report.stop_lsn,
        report.recovery_time.to_rfc3339(),
    );
    for warning in &report.warnings {
        tracing::warn!(?warning, "preflight warning");
    }
}

async fn connect(conninfo: &str) -> anyhow::Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::connect(conninfo, tokio_postgres::NoTls)
        .await
        .context("connecting to source database")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "source connection closed with an error");
        }
    });
    Ok(client)
}

async fn async_main(args: Args) -> anyhow::Result<CatchupReport> {
    let backup_mode = args.backup_mode;
    if !args.stream {
        tracing::debug!("--stream was not passed; WAL streaming runs unconditionally regardless");
    }
    let throttle_config = ThrottleConfig {
        max_open_files: args.max_open_files,
    };
    throttle_config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("validating throttle configuration")?;
    throttle::set_max_open_files(throttle_config.max_open_files);
    let tablespace_map = TablespaceMap::from_args(args.tablespace_mapping.iter().map(String::as_str))
        .context("parsing --tablespace-mapping")?;
    let password = std::env::var(PGPASSWORD_VAR).ok();
    let conninfo = conninfo(&args, &password);
    let repl_conninfo = replication_conninfo(&args, &password);

    let client = connect(&conninfo).await?;
    let source: Arc<dyn catchup::snapshot::SourceConnection> = Arc::new(
        pg::connection::PgSourceConnection::new(client, repl_conninfo.clone()),
    );

    let source_is_local = args.source_remote_addr.is_none();
    let source_io: Arc<dyn DataDirIo> = match &args.source_remote_addr {
        Some(addr) => Arc::new(
            RemoteIo::connect(addr.as_str())
                .await
                .with_context(|| format!("connecting to remote source at {addr}"))?,
        ),
        None => {
            let root = args
                .source_pgdata
                .clone()
                .context("--source-pgdata is required for a local source")?;
            Arc::new(LocalIo::new(root))
        }
    };

    let slot = args.replication_slot.clone();
    let wal_source_factory: catchup::orchestrate::WalSourceFactory =
        Box::new(move |start_lsn, _timeline| -> futures::future::BoxFuture<
            'static,
            anyhow::Result<Arc<dyn catchup::wal::ReplicationSource>>,
        > {
            Box::pin(async move {
                let (source, connection) =
                    pg::replication::PgReplicationSource::start(&repl_conninfo, &slot, start_lsn)
                        .await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::warn!(error = %e, "replication connection closed with an error");
                    }
                });
                Ok(Arc::new(source) as Arc<dyn catchup::wal::ReplicationSource>)
            })
        });

    let req = CatchupRequest {
        backup_mode,
        destination_pgdata: args.destination_pgdata.clone(),
        source_pgdata: args.source_pgdata.clone(),
        source_is_local,
        num_threads: if args.threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            args.threads
        },
        tablespace_map,
        sync: !args.no_sync,
        archive_timeout: Duration::from_secs(args.archive_timeout_sec),
        program_name: "catchup".to_string(),
        show_progress: args.progress,
        source,
        source_io,
        wal_source_factory,
        control_file_reader: Arc::new(pg::control_file::PgControlCodec),
        control_file_editor: Some(Arc::new(pg::control_file::PgControlCodec)),
        page_source: Arc::new(pg::page::PageLsnReader),
        wal_scanner: Some(Box::new(pg::wal_scanner::CommitTimestampScanner::new(
            args.destination_pgdata.join(catchup::wal::WAL_DIR),
        ))),
    };

    catchup::orchestrate::run_catchup(req).await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let output = OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    common::logging::init(&output);

    match async_main(args).await {
        Ok(report) => {
            tracing::info!(
                bytes_read = report.bytes_read,
                bytes_written = report.bytes_written,
                elapsed = ?report.elapsed,
                "catchup finished"
            );
            if !output.quiet && output.print_summary {
                print_report(&report);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "catchup failed");
            Err(e)
        }
    }
}
