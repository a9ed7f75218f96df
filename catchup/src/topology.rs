//! C7 — topology replicator.
//!
//! Recreates the destination's directory and tablespace-symlink skeleton
//! from the scanned source list (C2) before any file content is
//! transferred, so C9's workers never have to create a parent directory
//! themselves.

use std::path::{Path, PathBuf};

use common::error::{IoError, IoResult};
use remote::DataDirIo;

use crate::tablespace::TablespaceMap;
use crate::types::{FileEntry, FileKind};

// Directory permission mode (owner-only rwx, matching PostgreSQL's own
// PG_DIR_MODE) is applied by `LocalIo::mkdir` itself.

pub async fn replicate(
    destination_io: &dyn DataDirIo,
    entries: &[FileEntry],
    tablespace_map: &TablespaceMap,
) -> IoResult<()> {
    // Entries arrive sorted ascending by relpath (C2's invariant), which
    // already guarantees a parent directory's entry precedes its children.
    for entry in entries {
        match &entry.kind {
            FileKind::Directory => {
                destination_io.mkdir(&entry.relpath).await?;
            }
            FileKind::Symlink { target } => {
                if is_tablespace_link(&entry.relpath) {
                    let resolved = tablespace_map.resolve(target);
                    if !resolved.is_absolute() {
                        return Err(IoError::Remote(format!(
                            "tablespace link {} resolves to a non-absolute path {}",
                            entry.relpath.display(),
                            resolved.display()
                        )));
                    }
                    mkdir_absolute(&resolved).await?;
                    destination_io.symlink(&entry.relpath, &resolved).await?;
                } else {
                    destination_io.symlink(&entry.relpath, target).await?;
                }
            }
            FileKind::Regular => {}
        }
    }
    Ok(())
}

/// Creates a tablespace's resolved target directory directly on the local
/// filesystem, since it lives outside the destination data directory that
/// `destination_io` is rooted at (§4.6: "create the target directory with
/// the source mode").
async fn mkdir_absolute(target: &Path) -> IoResult<()> {
    let target = target.to_path_buf();
    tokio::fs::create_dir_all(&target)
        .await
        .map_err(|e| IoError::Path {
            path: target.clone(),
            source: e,
        })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| IoError::Path {
                path: target,
                source: e,
            })?;
    }
    Ok(())
}

fn is_tablespace_link(relpath: &Path) -> bool {
    relpath.parent() == Some(Path::new("pg_tblspc"))
}
