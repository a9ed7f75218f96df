//! C2 — directory scanner.
//!
//! Two entry points, keyed by host: [`scan_local`] walks the filesystem
//! directly (and additionally follows tablespace symlinks so their targets
//! are traversed too); [`scan_remote`] drives the same traversal through a
//! [`remote::DataDirIo`] capability. Both produce a list sorted ascending by
//! relative path - §4.1's ordering invariant.

use std::path::{Path, PathBuf};

use common::error::IoResult;
use remote::protocol::{EntryKind, RemoteEntry};
use remote::{DataDirIo, LocalIo};

use crate::types::{FileEntry, FileKind};

/// Files the scanner never reports: runtime-only or temporary files that
/// have no place in a copied data directory.
const SKIP_NAMES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "pg_internal.init",
    "backup_label.old",
    "tablespace_map.old",
];

const TABLESPACES_DIR: &str = "pg_tblspc";

fn should_skip(relpath: &Path) -> bool {
    let Some(name) = relpath.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    SKIP_NAMES.contains(&name) || name.starts_with("pgstat.tmp")
}

/// A file under `base/` or `global/` whose name is a plain numeric OID is a
/// datafile in PostgreSQL's on-disk layout (ignoring fork suffixes, which
/// this subsystem does not need to distinguish).
fn is_datafile(relpath: &Path) -> bool {
    let Some(parent) = relpath.parent().and_then(|p| p.to_str()) else {
        return false;
    };
    if !(parent == "global" || parent.starts_with("base/")) {
        return false;
    }
    relpath
        .file_name()
        .and_then(|n| n.to_str())
        .map(|name| {
            let stem = name.split(['.', '_']).next().unwrap_or(name);
            !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit())
        })
        .unwrap_or(false)
}

fn to_file_entry(entry: RemoteEntry, relpath_prefix: &Path) -> FileEntry {
    let relpath = relpath_prefix.join(&entry.relpath);
    let kind = match entry.kind {
        EntryKind::Regular => FileKind::Regular,
        EntryKind::Directory => FileKind::Directory,
        EntryKind::Symlink => FileKind::Symlink {
            target: entry.symlink_target.unwrap_or_default(),
        },
    };
    let is_data = entry.kind == EntryKind::Regular && is_datafile(&relpath);
    FileEntry::new(relpath, kind, entry.size).datafile(is_data, false)
}

fn finish(mut entries: Vec<FileEntry>) -> Vec<FileEntry> {
    entries.retain(|e| !should_skip(&e.relpath));
    entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
    entries
}

/// Scans a local data directory, following tablespace symlinks under
/// `pg_tblspc/` so their external targets are traversed too (their entries
/// are reported with relative paths rooted at the symlink, e.g.
/// `pg_tblspc/16384/PG_16_.../1/100`).
pub async fn scan_local(root: &Path) -> IoResult<Vec<FileEntry>> {
    let io = LocalIo::new(root);
    let mut entries: Vec<FileEntry> = io
        .list()
        .await?
        .into_iter()
        .map(|e| to_file_entry(e, Path::new("")))
        .collect();

    let tablespace_links: Vec<(PathBuf, PathBuf)> = entries
        .iter()
        .filter_map(|e| match &e.kind {
            FileKind::Symlink { target }
                if e.relpath.parent() == Some(Path::new(TABLESPACES_DIR)) =>
            {
                Some((e.relpath.clone(), target.clone()))
            }
            _ => None,
        })
        .collect();

    for (relpath, target) in tablespace_links {
        if !target.is_absolute() || !target.is_dir() {
            continue;
        }
        let sub_io = LocalIo::new(&target);
        let sub_entries = sub_io
            .list()
            .await?
            .into_iter()
            .map(|e| to_file_entry(e, &relpath));
        entries.extend(sub_entries);
    }

    Ok(finish(entries))
}

/// Scans a data directory through the remote capability. Tablespace-symlink
/// traversal is not attempted here: the capability is rooted at a single
/// directory on the remote host, and following an arbitrary absolute target
/// would require opening a second capability connection rooted elsewhere.
/// C5's tablespace-mapping check still runs; an unmapped tablespace on a
/// remote source is a preflight warning rather than a hard failure (§4.4),
/// which is the spec's own accommodation for this gap.
pub async fn scan_remote(io: &dyn DataDirIo) -> IoResult<Vec<FileEntry>> {
    let entries = io
        .list()
        .await?
        .into_iter()
        .map(|e| to_file_entry(e, Path::new("")))
        .collect();
    Ok(finish(entries))
}
