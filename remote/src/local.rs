//! `DataDirIo` implementation backed directly by the local filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::error::{IoError, IoResult};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::io::{io_err, DataDirIo};
use crate::protocol::{EntryKind, RemoteEntry};

pub struct LocalIo {
    root: PathBuf,
}

impl LocalIo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, relpath: &Path) -> PathBuf {
        self.root.join(relpath)
    }

    fn scan_into(dir: &Path, root: &Path, out: &mut Vec<RemoteEntry>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let relpath = path
                .strip_prefix(root)
                .expect("scanned path must be under root")
                .to_path_buf();
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                let target = std::fs::read_link(&path)?;
                out.push(RemoteEntry {
                    relpath,
                    kind: EntryKind::Symlink,
                    size: 0,
                    symlink_target: Some(target),
                });
            } else if file_type.is_dir() {
                out.push(RemoteEntry {
                    relpath,
                    kind: EntryKind::Directory,
                    size: 0,
                    symlink_target: None,
                });
                Self::scan_into(&path, root, out)?;
            } else {
                let size = entry.metadata()?.len();
                out.push(RemoteEntry {
                    relpath,
                    kind: EntryKind::Regular,
                    size,
                    symlink_target: None,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DataDirIo for LocalIo {
    async fn list(&self) -> IoResult<Vec<RemoteEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            Self::scan_into(&root, &root, &mut out).map_err(|e| io_err(&root, e))?;
            Ok(out)
        })
        .await
        .map_err(|e| IoError::Remote(e.to_string()))?
    }

    async fn read_range(&self, relpath: &Path, offset: u64, len: u32) -> IoResult<Vec<u8>> {
        let path = self.full_path(relpath);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(&path, e))?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        while total < buf.len() {
            let n = tokio::io::AsyncReadExt::read(&mut file, &mut buf[total..])
                .await
                .map_err(|e| io_err(&path, e))?;
            if n == 0 {
                buf.truncate(total);
                break;
            }
            total += n;
        }
        Ok(buf)
    }

    async fn write(&self, relpath: &Path, offset: u64, data: &[u8]) -> IoResult<()> {
        let path = self.full_path(relpath);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(&path, e))?;
        file.write_all(data).await.map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    async fn mkdir(&self, relpath: &Path) -> IoResult<()> {
        let path = self.full_path(relpath);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }

    async fn symlink(&self, relpath: &Path, target: &Path) -> IoResult<()> {
        let path = self.full_path(relpath);
        #[cfg(unix)]
        tokio::fs::symlink(target, &path)
            .await
            .map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    async fn readlink(&self, relpath: &Path) -> IoResult<PathBuf> {
        let path = self.full_path(relpath);
        tokio::fs::read_link(&path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn delete(&self, relpath: &Path) -> IoResult<()> {
        let path = self.full_path(relpath);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| io_err(&path, e))?;
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }

    async fn sync(&self, relpath: &Path) -> IoResult<()> {
        let path = self.full_path(relpath);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        file.sync_all().await.map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    async fn check_postmaster(&self) -> IoResult<bool> {
        let pid_path = self.full_path(Path::new("postmaster.pid"));
        let contents = match tokio::fs::read_to_string(&pid_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(&pid_path, e)),
        };
        let pid: i32 = contents
            .lines()
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| IoError::Remote(format!("malformed postmaster.pid: {pid_path:?}")))?;
        let alive = tokio::task::spawn_blocking(move || {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
        })
        .await
        .map_err(|e| IoError::Remote(e.to_string()))?;
        Ok(alive)
    }

    async fn read_control_file(&self) -> IoResult<Vec<u8>> {
        let path = self.full_path(Path::new("global/pg_control"));
        tokio::fs::read(&path).await.map_err(|e| io_err(&path, e))
    }
}
