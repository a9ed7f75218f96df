//! WAL streamer driving C6's STREAMING state.
//!
//! Pulls bytes off the database's physical-replication sub-protocol and
//! writes them into the destination WAL directory, tracking the flushed
//! LSN watermark C6 waits on. Parsing WAL record contents - including
//! finding commit-timestamp records - is out of scope for this subsystem
//! (§1); [`WalRecordScanner`] is the seam a concrete WAL codec plugs into.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use remote::DataDirIo;

use crate::snapshot::WalStreamer;

/// PostgreSQL's default WAL segment size.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
pub const WAL_DIR: &str = "pg_wal";

/// Scans streamed WAL bytes for the latest commit-timestamp record between
/// two LSNs.
pub trait WalRecordScanner: Send + Sync {
    fn latest_commit_timestamp(
        &self,
        start_lsn: u64,
        stop_lsn: u64,
    ) -> Option<chrono::DateTime<chrono::Utc>>;
}

/// Everything the streamer needs from a live physical-replication
/// connection: the next chunk of WAL bytes, keyed by the LSN it starts at.
/// `None` signals end-of-stream. Implemented against `tokio-postgres`'s
/// replication mode outside this crate; tests drive a fake.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    async fn recv(&self) -> Option<(u64, Vec<u8>)>;
}

/// Writes streamed WAL into the destination WAL directory and reports the
/// flushed-LSN watermark via [`WalStreamer`].
pub struct DestinationWalStreamer {
    flushed_lsn: AtomicU64,
    scanner: Option<Box<dyn WalRecordScanner>>,
}

impl DestinationWalStreamer {
    pub fn new(start_lsn: u64, scanner: Option<Box<dyn WalRecordScanner>>) -> Self {
        Self {
            flushed_lsn: AtomicU64::new(start_lsn),
            scanner,
        }
    }

    /// Runs until `source` reports end-of-stream, writing each chunk to its
    /// segment file in the destination WAL directory and advancing the
    /// flushed-LSN watermark after each successful write.
    pub async fn run(
        &self,
        source: &dyn ReplicationSource,
        dest_io: &dyn DataDirIo,
    ) -> common::error::IoResult<()> {
        while let Some((lsn, bytes)) = source.recv().await {
            let segment = segment_path(lsn);
            dest_io
                .write(&segment, segment_offset(lsn), &bytes)
                .await?;
            self.flushed_lsn.store(lsn + bytes.len() as u64, Ordering::Release);
        }
        Ok(())
    }
}

fn segment_path(lsn: u64) -> PathBuf {
    let segment_no = lsn / WAL_SEGMENT_SIZE;
    PathBuf::from(WAL_DIR).join(format!("{segment_no:016X}"))
}

fn segment_offset(lsn: u64) -> u64 {
    lsn % WAL_SEGMENT_SIZE
}

#[async_trait]
impl WalStreamer for DestinationWalStreamer {
    async fn flushed_lsn(&self) -> u64 {
        self.flushed_lsn.load(Ordering::Acquire)
    }

    async fn latest_commit_timestamp(
        &self,
        start_lsn: u64,
        stop_lsn: u64,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        self.scanner
            .as_ref()
            .and_then(|s| s.latest_commit_timestamp(start_lsn, stop_lsn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::LocalIo;
    use std::sync::Mutex;

    struct FakeReplicationSource {
        chunks: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    #[async_trait]
    impl ReplicationSource for FakeReplicationSource {
        async fn recv(&self) -> Option<(u64, Vec<u8>)> {
            self.chunks.lock().unwrap().pop()
        }
    }

    #[tokio::test]
    async fn writes_chunks_into_segment_files_and_advances_watermark() {
        let dest = tempfile::tempdir().unwrap();
        let dest_io = LocalIo::new(dest.path());
        dest_io.mkdir(std::path::Path::new(WAL_DIR)).await.unwrap();

        let source = FakeReplicationSource {
            chunks: Mutex::new(vec![(8, vec![9u8; 4]), (0, vec![1u8; 8])]),
        };
        let streamer = DestinationWalStreamer::new(0, None);
        streamer.run(&source, &dest_io).await.unwrap();

        assert_eq!(streamer.flushed_lsn().await, 12);
        let segment = tokio::fs::read(dest.path().join(WAL_DIR).join(format!("{:016X}", 0)))
            .await
            .unwrap();
        assert_eq!(&segment[..8], &[1u8; 8][..]);
        assert_eq!(&segment[8..12], &[9u8; 4][..]);
    }

    #[tokio::test]
    async fn falls_back_to_no_commit_timestamp_without_a_scanner() {
        let streamer = DestinationWalStreamer::new(0, None);
        assert_eq!(streamer.latest_commit_timestamp(0, 100).await, None);
    }
}
