//! C9 — parallel transfer pool.
//!
//! True OS threads, not async tasks: the workers spend nearly all of their
//! time in blocking read/write syscalls (or, for a remote endpoint,
//! blocking on a bridged async call), so there is no benefit to cooperative
//! scheduling and a real cost to forcing this work through a single-threaded
//! executor's queue. Each worker bridges into the async `DataDirIo`/
//! `SourceConnection` calls with a borrowed `tokio::runtime::Handle`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use remote::DataDirIo;

use crate::types::{FileEntry, FileKind, BYTES_INVALID, FILE_NOT_FOUND};

/// Datafiles are copied in fixed `BLOCK_SIZE` chunks so PTRACK's changed-block
/// bitmap (populated per block by C2/C6) lines up with what's transferred.
pub const BLOCK_SIZE: u64 = 8192;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transferring {relpath}: {source}")]
    Entry {
        relpath: std::path::PathBuf,
        #[source]
        source: common::error::IoError,
    },
    #[error("catchup was interrupted")]
    Interrupted,
}

fn is_not_found(e: &common::error::IoError) -> bool {
    matches!(e, common::error::IoError::Path { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
}

/// Supplies the LSN recorded in a given block, so a `Copier` can decide
/// whether a block needs retransmission in incremental mode. Real
/// page-header parsing is out of scope; the default treats every block as
/// unconditionally needing transfer, and tests inject a fake.
pub trait PageSource: Send + Sync {
    fn block_lsn(&self, relpath: &Path, block_no: u64, data: &[u8]) -> Option<u64>;
}

/// Transfers every block of every datafile unconditionally - used when no
/// LSN-based skip logic applies (FULL mode, or non-datafile transfers).
pub struct NoSkipPageSource;

impl PageSource for NoSkipPageSource {
    fn block_lsn(&self, _relpath: &Path, _block_no: u64, _data: &[u8]) -> Option<u64> {
        None
    }
}

/// Copies one file from `source_io` to `dest_io`. Datafiles are copied block
/// by block so a PTRACK changed-block bitmap or an LSN threshold can skip
/// unchanged blocks; every other regular file is copied bytewise in large
/// chunks.
pub trait Copier: Send + Sync {
    fn copy(
        &self,
        entry: &FileEntry,
        source_io: &dyn DataDirIo,
        dest_io: &dyn DataDirIo,
        handle: &tokio::runtime::Handle,
    ) -> Result<(), TransferError>;
}

pub struct DatafileCopier<'a> {
    pub page_source: &'a dyn PageSource,
    pub threshold_lsn: Option<u64>,
}

impl Copier for DatafileCopier<'_> {
    fn copy(
        &self,
        entry: &FileEntry,
        source_io: &dyn DataDirIo,
        dest_io: &dyn DataDirIo,
        handle: &tokio::runtime::Handle,
    ) -> Result<(), TransferError> {
        let to_err = |e: common::error::IoError| TransferError::Entry {
            relpath: entry.relpath.clone(),
            source: e,
        };
        let num_blocks = entry.size.div_ceil(BLOCK_SIZE);
        let mut read_total = 0u64;
        let mut write_total = 0u64;

        for block_no in 0..num_blocks {
            let offset = block_no * BLOCK_SIZE;
            let len = BLOCK_SIZE.min(entry.size - offset) as u32;
            let data = match handle.block_on(source_io.read_range(&entry.relpath, offset, len)) {
                Ok(data) => data,
                Err(e) if block_no == 0 && is_not_found(&e) => {
                    entry.set_read_size(0);
                    entry.set_write_size(FILE_NOT_FOUND);
                    return Ok(());
                }
                Err(e) => return Err(to_err(e)),
            };
            read_total += data.len() as u64;

            // PTRACK and DELTA are mutually exclusive skip strategies, never
            // combined: a PTRACK bitmap says precisely which blocks changed;
            // without one (DELTA mode) a block is skipped only if it falls
            // within the destination's prior size AND its page LSN is at or
            // below the sync LSN.
            let skip = match &entry.changed_blocks {
                Some(bitmap) => !bitmap.get(block_no as usize).copied().unwrap_or(true),
                None => self.threshold_lsn.is_some_and(|threshold| {
                    let within_prior_size =
                        entry.exists_in_prev() && offset + data.len() as u64 <= entry.prior_size();
                    within_prior_size
                        && self
                            .page_source
                            .block_lsn(&entry.relpath, block_no, &data)
                            .is_some_and(|lsn| lsn <= threshold)
                }),
            };
            if skip {
                continue;
            }

            handle
                .block_on(dest_io.write(&entry.relpath, offset, &data))
                .map_err(to_err)?;
            write_total += data.len() as u64;
        }

        entry.set_read_size(read_total);
        entry.set_write_size(if write_total == 0 && num_blocks > 0 {
            BYTES_INVALID
        } else {
            write_total
        });
        Ok(())
    }
}

pub struct BytewiseCopier {
    pub chunk_size: u64,
}

impl Default for BytewiseCopier {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
        }
    }
}

impl Copier for BytewiseCopier {
    fn copy(
        &self,
        entry: &FileEntry,
        source_io: &dyn DataDirIo,
        dest_io: &dyn DataDirIo,
        handle: &tokio::runtime::Handle,
    ) -> Result<(), TransferError> {
        let to_err = |e: common::error::IoError| TransferError::Entry {
            relpath: entry.relpath.clone(),
            source: e,
        };
        let mut offset = 0u64;
        let mut total = 0u64;
        while offset < entry.size {
            let len = self.chunk_size.min(entry.size - offset) as u32;
            let data = match handle.block_on(source_io.read_range(&entry.relpath, offset, len)) {
                Ok(data) => data,
                Err(e) if offset == 0 && is_not_found(&e) => {
                    entry.set_read_size(0);
                    entry.set_write_size(FILE_NOT_FOUND);
                    return Ok(());
                }
                Err(e) => return Err(to_err(e)),
            };
            if data.is_empty() {
                break;
            }
            handle
                .block_on(dest_io.write(&entry.relpath, offset, &data))
                .map_err(to_err)?;
            total += data.len() as u64;
            offset += data.len() as u64;
        }
        entry.set_read_size(total);
        entry.set_write_size(total);
        Ok(())
    }
}

fn is_cfs_eligible(entry: &FileEntry) -> bool {
    entry.is_datafile && !entry.is_cfs
}

/// A destination entry's relpath and size, as needed by step 6 of the
/// per-entry dispatch (incremental modes only): enough to set
/// `exists_in_prev`/`prior_size` on the matching source entry without
/// requiring the full (non-`Clone`) `FileEntry` to be duplicated. Callers
/// build this from the post-reaper destination list, sorted ascending by
/// relpath so `run` can binary-search it.
#[derive(Debug, Clone)]
pub struct PriorEntry {
    pub relpath: std::path::PathBuf,
    pub size: u64,
}

/// Runs `entries` across `num_threads` real OS threads. Directories are
/// skipped (C7 already materialized them) and non-regular types are warned
/// about and skipped rather than failing the whole operation. Entries are
/// pre-sorted descending by size so the largest, slowest transfers start
/// first and the pool drains evenly rather than finishing on one straggling
/// multi-gigabyte datafile. `interrupt` is polled between entries so a
/// signal-driven cancellation aborts promptly. `prior` is the post-reaper
/// destination list (ascending by relpath, incremental modes only); when an
/// entry matches, its `exists_in_prev`/`prior_size` are recorded before
/// dispatch, same as `None` for a FULL backup.
#[allow(clippy::too_many_arguments)]
pub fn run(
    entries: &mut [FileEntry],
    prior: Option<&[PriorEntry]>,
    num_threads: usize,
    source_io: &dyn DataDirIo,
    dest_io: &dyn DataDirIo,
    datafile_copier: &dyn Copier,
    bytewise_copier: &dyn Copier,
    handle: &tokio::runtime::Handle,
    interrupt: &AtomicBool,
    progress: &common::progress::TlsProgress,
) -> Result<(), TransferError> {
    entries.sort_by(|a, b| b.size.cmp(&a.size));

    let cursor = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<TransferError>> = Mutex::new(None);
    let num_threads = num_threads.max(1);

    let set_first_error = |e: TransferError| {
        failed.store(true, Ordering::Release);
        let mut slot = first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    };

    std::thread::scope(|scope| {
        for _ in 0..num_threads {
            scope.spawn(|| loop {
                if failed.load(Ordering::Acquire) {
                    return;
                }
                if interrupt.load(Ordering::Acquire) {
                    set_first_error(TransferError::Interrupted);
                    return;
                }
                let idx = cursor.fetch_add(1, Ordering::AcqRel);
                let Some(entry) = entries.get(idx) else {
                    return;
                };
                if matches!(entry.kind, FileKind::Directory) {
                    continue;
                }
                if !entry.try_claim() {
                    continue;
                }
                if !matches!(entry.kind, FileKind::Regular) {
                    tracing::warn!(relpath = %entry.relpath.display(), "unexpected file type reached the transfer pool, skipping");
                    continue;
                }
                if let Some(prior) = prior {
                    if let Ok(idx) =
                        prior.binary_search_by(|p| p.relpath.as_path().cmp(&entry.relpath))
                    {
                        entry.set_exists_in_prev(true);
                        entry.set_prior_size(prior[idx].size);
                    }
                }
                let _permit = throttle::open_file_permit();
                let _progress_guard = progress.guard();
                let copier: &dyn Copier = if is_cfs_eligible(entry) {
                    datafile_copier
                } else {
                    bytewise_copier
                };
                match copier.copy(entry, source_io, dest_io, handle) {
                    Ok(()) => {
                        match entry.write_size() {
                            FILE_NOT_FOUND => {
                                tracing::warn!(relpath = %entry.relpath.display(), "source file vanished between scan and copy");
                            }
                            BYTES_INVALID => {
                                tracing::debug!(relpath = %entry.relpath.display(), "file unchanged, nothing written");
                            }
                            n => progress.add_bytes(n),
                        }
                    }
                    Err(e) => {
                        set_first_error(e);
                        return;
                    }
                }
            });
        }
    });

    match first_error.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileKind;
    use remote::LocalIo;
    use std::path::PathBuf;

    fn entry(relpath: &str, size: u64) -> FileEntry {
        FileEntry::new(PathBuf::from(relpath), FileKind::Regular, size)
    }

    #[tokio::test]
    async fn copies_every_entry_bytewise() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("a"), vec![7u8; 5000])
            .await
            .unwrap();
        tokio::fs::write(src.path().join("b"), vec![9u8; 100])
            .await
            .unwrap();

        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();

        let mut entries = vec![entry("a", 5000), entry("b", 100)];
        let copier = BytewiseCopier::default();
        throttle::set_max_open_files(0);

        let interrupt = AtomicBool::new(false);
        let progress = common::progress::TlsProgress::new();
        tokio::task::spawn_blocking(move || {
            run(
                &mut entries,
                None,
                4,
                &source_io,
                &dest_io,
                &copier,
                &copier,
                &handle,
                &interrupt,
                &progress,
            )
        })
        .await
        .unwrap()
        .unwrap();

        let a = tokio::fs::read(dst.path().join("a")).await.unwrap();
        let b = tokio::fs::read(dst.path().join("b")).await.unwrap();
        assert_eq!(a, vec![7u8; 5000]);
        assert_eq!(b, vec![9u8; 100]);
    }

    #[tokio::test]
    async fn datafile_copier_skips_unchanged_blocks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let mut data = vec![1u8; BLOCK_SIZE as usize * 2];
        data[BLOCK_SIZE as usize..].fill(2u8);
        tokio::fs::write(src.path().join("100"), &data).await.unwrap();
        tokio::fs::write(dst.path().join("100"), vec![0u8; data.len()])
            .await
            .unwrap();

        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();

        let mut e = entry("100", data.len() as u64);
        e.is_datafile = true;
        e = e.with_changed_blocks(vec![false, true]);
        let mut entries = vec![e];

        let page_source = NoSkipPageSource;
        let copier = DatafileCopier {
            page_source: &page_source,
            threshold_lsn: None,
        };

        let interrupt = AtomicBool::new(false);
        let progress = common::progress::TlsProgress::new();
        tokio::task::spawn_blocking(move || {
            run(
                &mut entries,
                None,
                1,
                &source_io,
                &dest_io,
                &copier,
                &copier,
                &handle,
                &interrupt,
                &progress,
            )
        })
        .await
        .unwrap()
        .unwrap();

        let written = tokio::fs::read(dst.path().join("100")).await.unwrap();
        assert_eq!(&written[..BLOCK_SIZE as usize], &vec![0u8; BLOCK_SIZE as usize][..]);
        assert_eq!(&written[BLOCK_SIZE as usize..], &vec![2u8; BLOCK_SIZE as usize][..]);
    }

    #[test]
    fn claim_prevents_double_processing() {
        let e = entry("x", 10);
        assert!(e.try_claim());
        assert!(!e.try_claim());
    }

    #[tokio::test]
    async fn datafile_copier_marks_fully_unchanged_file_bytes_invalid() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data = vec![1u8; BLOCK_SIZE as usize];
        tokio::fs::write(src.path().join("100"), &data).await.unwrap();

        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();

        let mut e = entry("100", data.len() as u64);
        e.is_datafile = true;
        e = e.with_changed_blocks(vec![false]);

        let page_source = NoSkipPageSource;
        let copier = DatafileCopier {
            page_source: &page_source,
            threshold_lsn: None,
        };

        let handle2 = handle.clone();
        tokio::task::spawn_blocking(move || {
            copier.copy(&e, &source_io, &dest_io, &handle2).unwrap();
            assert_eq!(e.write_size(), BYTES_INVALID);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn bytewise_copier_marks_vanished_source_file_not_found() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();

        let e = entry("missing", 100);
        let copier = BytewiseCopier::default();
        copier.copy(&e, &source_io, &dest_io, &handle).unwrap();
        assert_eq!(e.write_size(), FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn interrupt_flag_aborts_the_pool() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("a"), vec![1u8; 10])
            .await
            .unwrap();

        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();
        let mut entries = vec![entry("a", 10)];
        let copier = BytewiseCopier::default();
        let interrupt = AtomicBool::new(true);

        let progress = common::progress::TlsProgress::new();
        let err = tokio::task::spawn_blocking(move || {
            run(
                &mut entries,
                None,
                1,
                &source_io,
                &dest_io,
                &copier,
                &copier,
                &handle,
                &interrupt,
                &progress,
            )
        })
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, TransferError::Interrupted));
    }

    #[tokio::test]
    async fn dispatch_records_exists_in_prev_and_prior_size_from_destination_list() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("a"), vec![1u8; 10])
            .await
            .unwrap();

        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();
        let mut entries = vec![entry("a", 10)];
        let prior = vec![PriorEntry {
            relpath: PathBuf::from("a"),
            size: 7,
        }];
        let copier = BytewiseCopier::default();
        let interrupt = AtomicBool::new(false);

        let progress = common::progress::TlsProgress::new();
        tokio::task::spawn_blocking(move || {
            run(
                &mut entries,
                Some(&prior),
                1,
                &source_io,
                &dest_io,
                &copier,
                &copier,
                &handle,
                &interrupt,
                &progress,
            )
            .unwrap();
            assert!(entries[0].exists_in_prev());
            assert_eq!(entries[0].prior_size(), 7);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn progress_reaches_one_started_and_finished_per_entry() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("a"), vec![1u8; 10])
            .await
            .unwrap();
        tokio::fs::write(src.path().join("b"), vec![2u8; 20])
            .await
            .unwrap();

        let source_io = LocalIo::new(src.path());
        let dest_io = LocalIo::new(dst.path());
        let handle = tokio::runtime::Handle::current();
        let mut entries = vec![entry("a", 10), entry("b", 20)];
        let copier = BytewiseCopier::default();
        let interrupt = AtomicBool::new(false);
        let progress = common::progress::TlsProgress::new();

        let progress = tokio::task::spawn_blocking(move || {
            run(
                &mut entries,
                None,
                2,
                &source_io,
                &dest_io,
                &copier,
                &copier,
                &handle,
                &interrupt,
                &progress,
            )
            .unwrap();
            progress
        })
        .await
        .unwrap();

        let status = progress.get();
        assert_eq!(status.started, 2);
        assert_eq!(status.finished, 2);
        assert_eq!(status.bytes_copied, 30);
    }
}
