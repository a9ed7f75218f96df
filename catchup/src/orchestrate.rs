//! Ties C5 through C10 together into one end-to-end catchup run: the
//! control flow described in §2 of the system overview, built from the
//! pieces each component module already implements. Component-level errors
//! stay typed (`thiserror`); this is the one place they get folded into
//! `anyhow::Error` at the orchestration boundary, matching the teacher's own
//! split between library and binary error handling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use remote::{DataDirIo, LocalIo};

use crate::control::ControlFileReader;
use crate::finalizer::{self, ControlFileEditor};
use crate::preflight::{self, PreflightWarning, TablespaceSources};
use crate::reaper;
use crate::scan;
use crate::snapshot::{SnapshotController, SourceConnection, WalStreamer};
use crate::tablespace::TablespaceMap;
use crate::topology;
use crate::transfer::{self, BytewiseCopier, DatafileCopier, PageSource, PriorEntry};
use crate::types::{BackupMode, CurrentOp, FileEntry, FileKind, BYTES_INVALID, FILE_NOT_FOUND};
use crate::wal::{self, DestinationWalStreamer, ReplicationSource};

/// Builds a connected `ReplicationSource` starting at the given LSN/timeline.
/// Boxed rather than a plain `async fn` type because the concrete adapter
/// (`tokio-postgres`'s replication mode, see `src/bin/pg/replication.rs`)
/// needs its own connection setup, which can only happen once the start LSN
/// returned by `start_backup` is known.
pub type WalSourceFactory = Box<
    dyn FnOnce(u64, u32) -> futures::future::BoxFuture<'static, anyhow::Result<Arc<dyn ReplicationSource>>>
        + Send,
>;

/// Everything one catchup invocation needs. The destination is always a
/// local data directory (the CLI has no `--destination-host`-equivalent
/// flag, unlike `--source-pgdata`'s local/remote choice, see `DESIGN.md`);
/// the source and every external collaborator are injected so the library
/// stays independent of `tokio-postgres`/a concrete wire codec.
pub struct CatchupRequest {
    pub backup_mode: BackupMode,
    pub destination_pgdata: PathBuf,
    /// Only consulted when `source_is_local`.
    pub source_pgdata: Option<PathBuf>,
    pub source_is_local: bool,
    pub num_threads: usize,
    pub tablespace_map: TablespaceMap,
    pub sync: bool,
    pub archive_timeout: Duration,
    pub program_name: String,
    /// Render a live progress bar on stderr while the transfer pool runs.
    /// The underlying `TlsProgress` counters are always maintained
    /// regardless of this flag; it only controls whether anything is drawn.
    pub show_progress: bool,

    pub source: Arc<dyn SourceConnection>,
    pub source_io: Arc<dyn DataDirIo>,
    /// Builds the replication connection once the start LSN is known
    /// (`start_backup` must complete first, so a fully-connected
    /// `ReplicationSource` can't be handed in ahead of time; see
    /// `DESIGN.md`). Called with the start LSN and timeline from
    /// `start_backup`'s result.
    pub wal_source_factory: WalSourceFactory,
    pub control_file_reader: Arc<dyn ControlFileReader>,
    pub control_file_editor: Option<Arc<dyn ControlFileEditor>>,
    pub page_source: Arc<dyn PageSource>,
    /// Scans streamed WAL for the latest commit timestamp (§4.5's recovery-time
    /// computation). `None` falls back unconditionally to the server's
    /// stop-backup invocation time, same as when no commit record is found.
    pub wal_scanner: Option<Box<dyn crate::wal::WalRecordScanner>>,
}

#[derive(Debug, Clone)]
pub struct CatchupReport {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
    pub start_lsn: u64,
    pub stop_lsn: u64,
    pub recovery_time: chrono::DateTime<chrono::Utc>,
    pub warnings: Vec<PreflightWarning>,
}

#[tracing::instrument(skip(req), fields(mode = %req.backup_mode))]
pub async fn run_catchup(req: CatchupRequest) -> anyhow::Result<CatchupReport> {
    let started = Instant::now();
    let dest_io: Arc<dyn DataDirIo> = Arc::new(LocalIo::new(&req.destination_pgdata));

    let mut destination_entries = scan::scan_local(&req.destination_pgdata).await?;
    let is_empty = destination_entries.is_empty();
    let has_backup_label = destination_entries
        .iter()
        .any(|e| e.relpath == Path::new(finalizer::BACKUP_LABEL_PATH));
    let control_file_bytes = if is_empty {
        None
    } else {
        Some(dest_io.read_control_file().await?)
    };
    let destination_state = crate::control::destination_state(
        is_empty,
        has_backup_label,
        control_file_bytes.as_deref(),
        req.control_file_reader.as_ref(),
    )
    .map_err(|e| anyhow::anyhow!(e))?;

    let mut source_entries = if req.source_is_local {
        let root = req
            .source_pgdata
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("source-pgdata is required for a local source"))?;
        scan::scan_local(root).await?
    } else {
        scan::scan_remote(req.source_io.as_ref()).await?
    };

    let tablespace_targets: Vec<PathBuf> = source_entries
        .iter()
        .filter_map(|e| match &e.kind {
            FileKind::Symlink { target } if e.relpath.parent() == Some(Path::new("pg_tblspc")) => {
                Some(target.clone())
            }
            _ => None,
        })
        .collect();
    let tablespace_sources = TablespaceSources {
        targets: &tablespace_targets,
        source_is_local: req.source_is_local,
    };

    let current_timeline = req.source.current_timeline().await?;
    let timeline_history_text = if current_timeline == 1 {
        None
    } else {
        req.source.timeline_history(current_timeline).await?
    };

    let preflight_report = preflight::run(
        req.backup_mode,
        &destination_state,
        req.source.as_ref(),
        dest_io.as_ref(),
        &req.tablespace_map,
        &tablespace_sources,
        timeline_history_text.as_deref(),
    )
    .await?;
    for warning in &preflight_report.warnings {
        tracing::warn!(?warning, "preflight warning");
    }

    let from_replica = req.source.is_replica().await?;
    let mut op = CurrentOp::new(req.backup_mode, current_timeline, from_replica);

    let mut controller = SnapshotController::new(req.source.as_ref(), req.archive_timeout);
    controller.start(&mut op, &req.program_name).await?;
    controller.begin_streaming()?;

    // pg_wal must exist before the streamer's first write; a FULL backup's
    // destination starts out empty, so this can't wait on C7 (which only
    // materializes directories present in the source tree).
    dest_io.mkdir(Path::new(wal::WAL_DIR)).await?;

    let start_lsn = op.start_lsn.expect("set by SnapshotController::start");
    let wal_source = (req.wal_source_factory)(start_lsn, op.current_timeline).await?;
    let streamer = Arc::new(DestinationWalStreamer::new(start_lsn, req.wal_scanner));
    let wal_task = {
        let streamer = streamer.clone();
        let dest_io = dest_io.clone();
        tokio::spawn(async move { streamer.run(wal_source.as_ref(), dest_io.as_ref()).await })
    };

    topology::replicate(dest_io.as_ref(), &source_entries, &req.tablespace_map).await?;

    let before_paths: Vec<PathBuf> = destination_entries
        .iter()
        .map(|e| e.relpath.clone())
        .collect();
    reaper::reap(req.backup_mode, &source_entries, &mut destination_entries);
    if req.backup_mode != BackupMode::Full {
        let kept: HashSet<&Path> = destination_entries.iter().map(|e| e.relpath.as_path()).collect();
        let mut removed: Vec<PathBuf> = before_paths
            .into_iter()
            .filter(|p| !kept.contains(p.as_path()))
            .collect();
        // Children before parents, same order C9/C10 expect the tree in.
        removed.sort_by(|a, b| b.cmp(a));
        for relpath in removed {
            dest_io.delete(&relpath).await?;
        }
    }

    // The control file is copied last, by the finalizer (C10), never by the
    // transfer pool (C9): §3's FileEntry invariant. Topology replication and
    // the reaper both needed it present in `source_entries` above (the
    // reaper must not treat the destination's own control file as
    // redundant); drop it now, just before building the list C9 dispatches
    // over.
    source_entries.retain(|e| e.relpath != Path::new(finalizer::CONTROL_FILE_PATH));

    let prior: Option<Vec<PriorEntry>> = (req.backup_mode != BackupMode::Full).then(|| {
        let mut entries: Vec<PriorEntry> = destination_entries
            .iter()
            .map(|e| PriorEntry {
                relpath: e.relpath.clone(),
                size: e.size,
            })
            .collect();
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        entries
    });

    let threshold_lsn = (req.backup_mode == BackupMode::Delta)
        .then(|| destination_state.redo.map(|r| r.lsn))
        .flatten();
    let datafile_copier = DatafileCopier {
        page_source: req.page_source.as_ref(),
        threshold_lsn,
    };
    let bytewise_copier = BytewiseCopier::default();
    let interrupt = AtomicBool::new(false);
    let handle = tokio::runtime::Handle::current();
    let progress = common::progress::TlsProgress::new();
    let total_entries = source_entries
        .iter()
        .filter(|e| matches!(e.kind, FileKind::Regular))
        .count() as u64;
    let progress_done = AtomicBool::new(false);
    let transfer_result = std::thread::scope(|scope| {
        if req.show_progress {
            scope.spawn(|| report_progress(&progress, total_entries, &progress_done));
        }
        let result = tokio::task::block_in_place(|| {
            transfer::run(
                &mut source_entries,
                prior.as_deref(),
                req.num_threads,
                req.source_io.as_ref(),
                dest_io.as_ref(),
                &datafile_copier,
                &bytewise_copier,
                &handle,
                &interrupt,
                &progress,
            )
        });
        progress_done.store(true, std::sync::atomic::Ordering::Release);
        result
    });
    transfer_result?;
    aggregate_transfer_bytes(&op, &source_entries);

    let stop = controller.stop(&mut op).await?;
    controller
        .wait_for_wal_catch_up(streamer.as_ref(), stop.stop_lsn)
        .await?;
    wal_task.await??;
    controller.finish(&mut op, streamer.as_ref(), &stop).await?;
    let non_exclusive_capable =
        req.source.server_version().await? >= preflight::MIN_REPLICA_SERVER_VERSION;
    controller
        .maybe_create_restore_point(&op, non_exclusive_capable, "catchup")
        .await?;

    finalizer::run(
        &op,
        &source_entries,
        &stop.backup_label,
        req.source_io.as_ref(),
        dest_io.as_ref(),
        req.control_file_editor.as_deref(),
        &finalizer::FinalizeOptions { sync: req.sync },
    )
    .await?;

    Ok(CatchupReport {
        bytes_read: op.bytes_read.load(std::sync::atomic::Ordering::Acquire),
        bytes_written: op.bytes_written.load(std::sync::atomic::Ordering::Acquire),
        elapsed: started.elapsed(),
        start_lsn: op.start_lsn.expect("set by SnapshotController::start"),
        stop_lsn: op.stop_lsn.expect("set by SnapshotController::stop"),
        recovery_time: op.recovery_time.expect("set by SnapshotController::finish"),
        warnings: preflight_report.warnings,
    })
}

/// Draws a bar over `total` entries until `done` is set, polling every 200ms.
/// Runs on its own OS thread (same shape as the teacher's `pbar_thread`) so it
/// never competes with the transfer pool or the tokio runtime for a slot.
fn report_progress(progress: &common::progress::TlsProgress, total: u64, done: &AtomicBool) {
    let bar = indicatif::ProgressBar::new(total);
    bar.set_style(
        indicatif::ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} files",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("=> "),
    );
    loop {
        let status = progress.get();
        bar.set_position(status.finished);
        if done.load(std::sync::atomic::Ordering::Acquire) {
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    bar.finish_and_clear();
}

fn aggregate_transfer_bytes(op: &CurrentOp, entries: &[FileEntry]) {
    for entry in entries {
        if !matches!(entry.kind, FileKind::Regular) {
            continue;
        }
        let read = entry.read_size();
        let write = match entry.write_size() {
            FILE_NOT_FOUND | BYTES_INVALID => 0,
            n => n,
        };
        op.add_transferred(read, write);
    }
}
