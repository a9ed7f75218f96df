//! C10 — finalizer.
//!
//! Runs only once C9 has finished successfully: copies the control file
//! (held back until now so its destination mtime is the last one written
//! among the mirrored source tree), writes the backup label C6 returned,
//! optionally patches min-recovery-point on a replica source, and fsyncs
//! the tree. No tablespace-map file is ever written — the symlinks C7
//! placed are authoritative (§4.9).

use std::path::Path;

use remote::DataDirIo;

use crate::types::{CurrentOp, FileEntry, FileKind};

pub const BACKUP_LABEL_PATH: &str = "backup_label";
pub const CONTROL_FILE_PATH: &str = "global/pg_control";

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Io(#[from] common::error::IoError),
    #[error("patching min-recovery-point: {0}")]
    ControlFilePatch(String),
}

/// Patches a destination control file's min-recovery-point to a given LSN.
/// Control-file layout and checksumming are out of scope for this subsystem
/// (§1); this is the seam a concrete `pg_control` codec plugs into.
pub trait ControlFileEditor: Send + Sync {
    fn set_min_recovery_point(&self, control_file: &[u8], lsn: u64) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizeOptions {
    /// `false` when the CLI was given `--no-sync`.
    pub sync: bool,
}

/// Runs the finalize step. `entries` is the source list used to select
/// which destination files get fsynced; it must not include the control
/// file itself (C9 never touches it, per the `FileEntry` invariant in §3).
pub async fn run(
    op: &CurrentOp,
    entries: &[FileEntry],
    backup_label: &[u8],
    source_io: &dyn DataDirIo,
    dest_io: &dyn DataDirIo,
    control_file_editor: Option<&dyn ControlFileEditor>,
    options: &FinalizeOptions,
) -> Result<(), FinalizeError> {
    let control_file = source_io.read_control_file().await?;
    let control_file = if op.from_replica {
        let stop_lsn = op.stop_lsn.expect("stop_lsn is set before the finalizer runs");
        match control_file_editor {
            Some(editor) => editor
                .set_min_recovery_point(&control_file, stop_lsn)
                .map_err(FinalizeError::ControlFilePatch)?,
            None => control_file,
        }
    } else {
        control_file
    };

    dest_io
        .write(Path::new(CONTROL_FILE_PATH), 0, &control_file)
        .await?;
    dest_io
        .write(Path::new(BACKUP_LABEL_PATH), 0, backup_label)
        .await?;

    if options.sync {
        sync_tree(entries, dest_io).await?;
    }
    Ok(())
}

async fn sync_tree(entries: &[FileEntry], dest_io: &dyn DataDirIo) -> Result<(), FinalizeError> {
    let start = std::time::Instant::now();
    for entry in entries {
        if matches!(entry.kind, FileKind::Regular) {
            dest_io.sync(&entry.relpath).await?;
        }
    }
    dest_io.sync(Path::new(CONTROL_FILE_PATH)).await?;
    tracing::info!(elapsed = ?start.elapsed(), "fsync of destination tree complete");
    Ok(())
}
