//! Wire types for the `DataDirIo` capability protocol.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
}

/// A single entry as reported by a directory listing. Kept deliberately
/// smaller than `catchup::FileEntry` - the capability layer only reports
/// what a filesystem can tell it; the caller attaches checksum/LSN context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub relpath: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub symlink_target: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    List,
    ReadRange { relpath: PathBuf, offset: u64, len: u32 },
    Write { relpath: PathBuf, offset: u64, data: Vec<u8> },
    Mkdir { relpath: PathBuf },
    Symlink { relpath: PathBuf, target: PathBuf },
    Readlink { relpath: PathBuf },
    Delete { relpath: PathBuf },
    Sync { relpath: PathBuf },
    CheckPostmaster,
    ReadControlFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    List(Vec<RemoteEntry>),
    Data(Vec<u8>),
    Path(PathBuf),
    PostmasterAlive(bool),
    Ok,
    Err(String),
}
