//! C1 — the file entry model, plus the process-wide `CurrentOp` state and
//! its supporting types (`RedoParams`, `BackupMode`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sentinel values for `FileEntry::write_size`. Real write sizes are always
/// smaller than either sentinel for any file this subsystem ever touches.
pub const FILE_NOT_FOUND: u64 = u64::MAX;
pub const BYTES_INVALID: u64 = u64::MAX - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink { target: PathBuf },
}

/// Immutable-after-scan description of one file, directory, or symlink in a
/// data directory. The claim flag and write-side outcomes are interior
/// mutability over otherwise-immutable scan data, so a `FileEntry` can be
/// shared read-only (`Arc<[FileEntry]>`) across the transfer pool's worker
/// threads (C9) while still letting exactly one worker record its outcome.
#[derive(Debug)]
pub struct FileEntry {
    pub relpath: PathBuf,
    pub kind: FileKind,
    pub size: u64,
    pub is_datafile: bool,
    pub is_cfs: bool,
    /// PTRACK changed-block bitmap; one bit per `BLOCK_SIZE`-sized block.
    /// Only ever populated for `is_datafile` entries scanned in PTRACK mode.
    pub changed_blocks: Option<Vec<bool>>,

    claimed: AtomicBool,
    read_size: std::sync::atomic::AtomicU64,
    write_size: std::sync::atomic::AtomicU64,
    exists_in_prev: AtomicBool,
    /// Size the destination entry with the same relpath had before this
    /// catchup started, set by C9's dispatch step when it finds a match in
    /// the (incremental-mode-only) destination list. Meaningless unless
    /// `exists_in_prev` is set.
    prior_size: std::sync::atomic::AtomicU64,
}

impl FileEntry {
    pub fn new(relpath: PathBuf, kind: FileKind, size: u64) -> Self {
        Self {
            relpath,
            kind,
            size,
            is_datafile: false,
            is_cfs: false,
            changed_blocks: None,
            claimed: AtomicBool::new(false),
            read_size: std::sync::atomic::AtomicU64::new(0),
            write_size: std::sync::atomic::AtomicU64::new(0),
            exists_in_prev: AtomicBool::new(false),
            prior_size: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn datafile(mut self, is_datafile: bool, is_cfs: bool) -> Self {
        self.is_datafile = is_datafile;
        self.is_cfs = is_cfs;
        self
    }

    pub fn with_changed_blocks(mut self, bitmap: Vec<bool>) -> Self {
        self.changed_blocks = Some(bitmap);
        self
    }

    /// Atomically claims this entry for the calling worker. Returns `true`
    /// iff the caller won the claim (invariant: at most one worker per
    /// entry, enforced by compare-and-set).
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn set_read_size(&self, n: u64) {
        self.read_size.store(n, Ordering::Release);
    }

    pub fn read_size(&self) -> u64 {
        self.read_size.load(Ordering::Acquire)
    }

    pub fn set_write_size(&self, n: u64) {
        self.write_size.store(n, Ordering::Release);
    }

    pub fn write_size(&self) -> u64 {
        self.write_size.load(Ordering::Acquire)
    }

    pub fn set_exists_in_prev(&self, value: bool) {
        self.exists_in_prev.store(value, Ordering::Release);
    }

    pub fn exists_in_prev(&self) -> bool {
        self.exists_in_prev.load(Ordering::Acquire)
    }

    pub fn set_prior_size(&self, n: u64) {
        self.prior_size.store(n, Ordering::Release);
    }

    pub fn prior_size(&self) -> u64 {
        self.prior_size.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Delta,
    Ptrack,
}

impl std::str::FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(Self::Full),
            "DELTA" => Ok(Self::Delta),
            "PTRACK" => Ok(Self::Ptrack),
            other => Err(format!("unknown backup mode: {other}")),
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Full => "FULL",
            Self::Delta => "DELTA",
            Self::Ptrack => "PTRACK",
        };
        write!(f, "{s}")
    }
}

/// (timeline, LSN, checkpoint-location) extracted from the destination
/// control file, populated before any destructive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoParams {
    pub timeline: u32,
    pub lsn: u64,
    pub checkpoint_location: u64,
}

/// Process-wide state for one catchup invocation. Constructed in C5,
/// mutated only by C6 and C10, read by all other components.
#[derive(Debug)]
pub struct CurrentOp {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub start_lsn: Option<u64>,
    pub stop_lsn: Option<u64>,
    pub current_timeline: u32,
    pub from_replica: bool,
    pub backup_mode: BackupMode,
    pub recovery_time: Option<chrono::DateTime<chrono::Utc>>,
    pub bytes_read: std::sync::atomic::AtomicU64,
    pub bytes_written: std::sync::atomic::AtomicU64,
}

impl CurrentOp {
    pub fn new(backup_mode: BackupMode, current_timeline: u32, from_replica: bool) -> Self {
        Self {
            start_time: chrono::Utc::now(),
            start_lsn: None,
            stop_lsn: None,
            current_timeline,
            from_replica,
            backup_mode,
            recovery_time: None,
            bytes_read: std::sync::atomic::AtomicU64::new(0),
            bytes_written: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn add_transferred(&self, read: u64, written: u64) {
        self.bytes_read.fetch_add(read, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let entry = FileEntry::new(PathBuf::from("base/1/100"), FileKind::Regular, 8192);
        assert!(entry.try_claim());
        assert!(!entry.try_claim());
        assert!(entry.is_claimed());
    }

    #[test]
    fn backup_mode_parses_case_insensitively() {
        assert_eq!("full".parse::<BackupMode>().unwrap(), BackupMode::Full);
        assert_eq!("Delta".parse::<BackupMode>().unwrap(), BackupMode::Delta);
        assert_eq!("PTRACK".parse::<BackupMode>().unwrap(), BackupMode::Ptrack);
        assert!("bogus".parse::<BackupMode>().is_err());
    }
}
