//! The `DataDirIo` capability: every way C2/C7/C8/C9/C10 touch a data
//! directory goes through this trait, so the same code works against a
//! local directory or one on a remote host without branching on which.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::error::{IoError, IoResult};

use crate::protocol::RemoteEntry;

#[async_trait]
pub trait DataDirIo: Send + Sync {
    /// Recursively lists every entry under the data directory root.
    async fn list(&self) -> IoResult<Vec<RemoteEntry>>;

    /// Reads `len` bytes starting at `offset` from `relpath`.
    async fn read_range(&self, relpath: &Path, offset: u64, len: u32) -> IoResult<Vec<u8>>;

    /// Writes `data` at `offset` into `relpath`, creating the file if absent.
    async fn write(&self, relpath: &Path, offset: u64, data: &[u8]) -> IoResult<()>;

    async fn mkdir(&self, relpath: &Path) -> IoResult<()>;

    async fn symlink(&self, relpath: &Path, target: &Path) -> IoResult<()>;

    async fn readlink(&self, relpath: &Path) -> IoResult<PathBuf>;

    async fn delete(&self, relpath: &Path) -> IoResult<()>;

    /// fsyncs the file (or directory) at `relpath`.
    async fn sync(&self, relpath: &Path) -> IoResult<()>;

    /// Reports whether a postmaster process is currently running against
    /// this data directory, per `postmaster.pid` (see C5 preflight checks).
    async fn check_postmaster(&self) -> IoResult<bool>;

    /// Reads the raw bytes of `global/pg_control`.
    async fn read_control_file(&self) -> IoResult<Vec<u8>>;
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> IoError {
    IoError::at(path.to_path_buf(), source)
}
