//! C8 — reaper.
//!
//! Incremental-mode-only: prunes destination-only files that no longer
//! exist on the source before C9 runs, so the transfer pool never has to
//! special-case deletions. A no-op in FULL mode — there is nothing on the
//! destination yet for it to prune.

use std::path::Path;

use crate::types::{BackupMode, FileEntry};

/// `pg_filenode.map` is rewritten by every checkpoint and is always
/// retransmitted regardless of source/destination comparison, so pruning it
/// here would be immediately undone by C9 - skip it rather than reason about
/// its (irrelevant) presence on either side.
const ALWAYS_REDUNDANT: &str = "pg_filenode.map";

/// Removes entries from `destination` that are redundant: absent from
/// `source`, or the filename-to-oid map file (always redundant, so it gets
/// re-copied fresh by C9 regardless of whether it changed). Mutates
/// `destination` in place. Both lists must already be sorted ascending by
/// relpath (C2's invariant); `destination` ends up sorted descending,
/// matching the order C9 deletes files on disk (children before parents).
pub fn reap(mode: BackupMode, source: &[FileEntry], destination: &mut Vec<FileEntry>) {
    if mode == BackupMode::Full {
        return;
    }

    destination.retain(|dest_entry| {
        !is_always_redundant(&dest_entry.relpath) && source_contains(source, &dest_entry.relpath)
    });
    destination.sort_by(|a, b| b.relpath.cmp(&a.relpath));
}

fn is_always_redundant(relpath: &Path) -> bool {
    relpath.file_name().and_then(|n| n.to_str()) == Some(ALWAYS_REDUNDANT)
}

fn source_contains(source: &[FileEntry], relpath: &Path) -> bool {
    source
        .binary_search_by(|e| e.relpath.as_path().cmp(relpath))
        .is_ok()
}
