//! C6 — online-snapshot controller.
//!
//! Drives the state machine in §4.5 against a live source connection:
//! `INIT → STARTED → STREAMING → STOP_SENT → STOP_DONE → WAL_CAUGHT_UP →
//! DONE`, with `FAILED` reachable from any non-terminal state.

use async_trait::async_trait;

use crate::types::CurrentOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Init,
    Started,
    Streaming,
    StopSent,
    StopDone,
    WalCaughtUp,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("source connection error: {0}")]
    Connection(String),
    #[error("timed out waiting for stop-backup after {0:?}")]
    StopBackupTimeout(std::time::Duration),
    #[error("timed out waiting for WAL to catch up to stop LSN {0:X}")]
    WalCatchUpTimeout(u64),
    #[error("transition attempted from terminal state {0:?}")]
    InvalidTransition(SnapshotState),
}

/// Result of a non-exclusive start-backup request.
#[derive(Debug, Clone)]
pub struct StartBackupResult {
    pub start_lsn: u64,
    pub timeline: u32,
}

/// Result of a non-exclusive stop-backup request.
#[derive(Debug, Clone)]
pub struct StopBackupResult {
    pub stop_lsn: u64,
    pub snapshot_txid: u64,
    pub backup_label: Vec<u8>,
    pub tablespace_map: Vec<u8>,
    pub invocation_time: chrono::DateTime<chrono::Utc>,
}

/// Everything C5/C6 need from the live source database. Implemented against
/// `tokio-postgres` in production; `FakeSourceConnection` below is the test
/// double the state machine's unit tests drive instead of a live server.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    async fn system_identifier(&self) -> Result<u64, SnapshotError>;
    async fn server_version(&self) -> Result<u32, SnapshotError>;
    async fn is_replica(&self) -> Result<bool, SnapshotError>;
    async fn is_superuser(&self) -> Result<bool, SnapshotError>;
    async fn ptrack_version(&self) -> Result<Option<String>, SnapshotError>;
    async fn is_ptrack_enabled(&self) -> Result<bool, SnapshotError>;
    async fn current_timeline(&self) -> Result<u32, SnapshotError>;
    async fn timeline_history(&self, timeline: u32) -> Result<Option<String>, SnapshotError>;

    async fn start_backup(&self, label: &str) -> Result<StartBackupResult, SnapshotError>;
    async fn stop_backup(&self) -> Result<StopBackupResult, SnapshotError>;
    async fn create_restore_point(&self, name: &str) -> Result<(), SnapshotError>;
}

/// Reports on the concurrently-running WAL stream into the destination WAL
/// directory. WAL parsing/replication-protocol internals are out of scope;
/// this trait only exposes what the controller needs to know about progress.
#[async_trait]
pub trait WalStreamer: Send + Sync {
    async fn flushed_lsn(&self) -> u64;
    /// Latest commit timestamp seen in streamed WAL between `start_lsn` and
    /// `stop_lsn`, if any such record has been streamed.
    async fn latest_commit_timestamp(
        &self,
        start_lsn: u64,
        stop_lsn: u64,
    ) -> Option<chrono::DateTime<chrono::Utc>>;
}

pub struct SnapshotController<'a> {
    state: SnapshotState,
    source: &'a dyn SourceConnection,
    archive_timeout: std::time::Duration,
}

impl<'a> SnapshotController<'a> {
    pub fn new(source: &'a dyn SourceConnection, archive_timeout: std::time::Duration) -> Self {
        Self {
            state: SnapshotState::Init,
            source,
            archive_timeout,
        }
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    fn fail(&mut self) -> SnapshotState {
        self.state = SnapshotState::Failed;
        self.state
    }

    /// INIT → STARTED.
    pub async fn start(&mut self, op: &mut CurrentOp, program_name: &str) -> Result<(), SnapshotError> {
        if self.state != SnapshotState::Init {
            return Err(SnapshotError::InvalidTransition(self.state));
        }
        let label = format!("{} with {}", op.start_time.to_rfc3339(), program_name);
        let result = match self.source.start_backup(&label).await {
            Ok(result) => result,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        op.start_lsn = Some(result.start_lsn);
        op.current_timeline = result.timeline;
        self.state = SnapshotState::Started;
        Ok(())
    }

    /// STARTED → STREAMING. The caller is responsible for actually spawning
    /// the WAL streamer thread; this only records the state transition.
    pub fn begin_streaming(&mut self) -> Result<(), SnapshotError> {
        if self.state != SnapshotState::Started {
            return Err(SnapshotError::InvalidTransition(self.state));
        }
        self.state = SnapshotState::Streaming;
        Ok(())
    }

    /// STREAMING → STOP_SENT → STOP_DONE. Called once C9 has completed
    /// successfully.
    pub async fn stop(&mut self, op: &mut CurrentOp) -> Result<StopBackupResult, SnapshotError> {
        if self.state != SnapshotState::Streaming {
            return Err(SnapshotError::InvalidTransition(self.state));
        }
        self.state = SnapshotState::StopSent;
        let result = match tokio::time::timeout(self.archive_timeout, self.source.stop_backup()).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.fail();
                return Err(e);
            }
            Err(_) => {
                self.fail();
                return Err(SnapshotError::StopBackupTimeout(self.archive_timeout));
            }
        };
        op.stop_lsn = Some(result.stop_lsn);
        self.state = SnapshotState::StopDone;
        Ok(result)
    }

    /// STOP_DONE → WAL_CAUGHT_UP: blocks until the streamer reports a
    /// flushed position ≥ stop LSN, bounded by `archive_timeout`.
    pub async fn wait_for_wal_catch_up(
        &mut self,
        streamer: &dyn WalStreamer,
        stop_lsn: u64,
    ) -> Result<(), SnapshotError> {
        if self.state != SnapshotState::StopDone {
            return Err(SnapshotError::InvalidTransition(self.state));
        }
        let deadline = tokio::time::Instant::now() + self.archive_timeout;
        loop {
            if streamer.flushed_lsn().await >= stop_lsn {
                self.state = SnapshotState::WalCaughtUp;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                self.fail();
                return Err(SnapshotError::WalCatchUpTimeout(stop_lsn));
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// WAL_CAUGHT_UP → DONE: sets `CurrentOp.recovery_time` from the latest
    /// commit timestamp seen in streamed WAL, falling back to the server's
    /// stop-backup invocation time.
    pub async fn finish(
        &mut self,
        op: &mut CurrentOp,
        streamer: &dyn WalStreamer,
        stop: &StopBackupResult,
    ) -> Result<(), SnapshotError> {
        if self.state != SnapshotState::WalCaughtUp {
            return Err(SnapshotError::InvalidTransition(self.state));
        }
        let start_lsn = op.start_lsn.expect("start_lsn set by start()");
        op.recovery_time = match streamer
            .latest_commit_timestamp(start_lsn, stop.stop_lsn)
            .await
        {
            Some(ts) => Some(ts),
            None => Some(stop.invocation_time),
        };
        self.state = SnapshotState::Done;
        Ok(())
    }

    /// Replica-source specialization (§4.5): skip creating a restore point
    /// only when the source is itself a replica AND the server is
    /// non-exclusive-capable (it already tracks its own restore point in
    /// that case). In every other case - a master source, or a replica
    /// source talking to an older, exclusive-only server - create one, but
    /// only if the connected role is superuser.
    pub async fn maybe_create_restore_point(
        &self,
        op: &CurrentOp,
        non_exclusive_capable: bool,
        name: &str,
    ) -> Result<(), SnapshotError> {
        if op.from_replica && non_exclusive_capable {
            return Ok(());
        }
        if self.source.is_superuser().await? {
            self.source.create_restore_point(name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSourceConnection {
        pub system_identifier: u64,
        pub server_version: u32,
        pub replica: bool,
        pub superuser: bool,
        pub ptrack_version: Option<String>,
        pub ptrack_enabled: bool,
        pub current_timeline: u32,
        pub histories: std::collections::HashMap<u32, String>,
        pub restore_points: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SourceConnection for FakeSourceConnection {
        async fn system_identifier(&self) -> Result<u64, SnapshotError> {
            Ok(self.system_identifier)
        }
        async fn server_version(&self) -> Result<u32, SnapshotError> {
            Ok(self.server_version)
        }
        async fn is_replica(&self) -> Result<bool, SnapshotError> {
            Ok(self.replica)
        }
        async fn is_superuser(&self) -> Result<bool, SnapshotError> {
            Ok(self.superuser)
        }
        async fn ptrack_version(&self) -> Result<Option<String>, SnapshotError> {
            Ok(self.ptrack_version.clone())
        }
        async fn is_ptrack_enabled(&self) -> Result<bool, SnapshotError> {
            Ok(self.ptrack_enabled)
        }
        async fn current_timeline(&self) -> Result<u32, SnapshotError> {
            Ok(self.current_timeline)
        }
        async fn timeline_history(&self, timeline: u32) -> Result<Option<String>, SnapshotError> {
            Ok(self.histories.get(&timeline).cloned())
        }
        async fn start_backup(&self, _label: &str) -> Result<StartBackupResult, SnapshotError> {
            Ok(StartBackupResult {
                start_lsn: 0x1000,
                timeline: self.current_timeline,
            })
        }
        async fn stop_backup(&self) -> Result<StopBackupResult, SnapshotError> {
            Ok(StopBackupResult {
                stop_lsn: 0x2000,
                snapshot_txid: 42,
                backup_label: b"START WAL LOCATION: 0/1000\n".to_vec(),
                tablespace_map: Vec::new(),
                invocation_time: chrono::Utc::now(),
            })
        }
        async fn create_restore_point(&self, name: &str) -> Result<(), SnapshotError> {
            self.restore_points.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    pub struct FakeWalStreamer {
        pub flushed_lsn: std::sync::atomic::AtomicU64,
        pub commit_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[async_trait]
    impl WalStreamer for FakeWalStreamer {
        async fn flushed_lsn(&self) -> u64 {
            self.flushed_lsn.load(std::sync::atomic::Ordering::Acquire)
        }
        async fn latest_commit_timestamp(
            &self,
            _start_lsn: u64,
            _stop_lsn: u64,
        ) -> Option<chrono::DateTime<chrono::Utc>> {
            self.commit_timestamp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::types::BackupMode;

    #[tokio::test]
    async fn drives_state_machine_to_done() {
        let source = FakeSourceConnection {
            current_timeline: 1,
            ..Default::default()
        };
        let mut op = CurrentOp::new(BackupMode::Full, 1, false);
        let mut controller = SnapshotController::new(&source, std::time::Duration::from_secs(5));

        controller.start(&mut op, "catchup").await.unwrap();
        assert_eq!(controller.state(), SnapshotState::Started);
        assert_eq!(op.start_lsn, Some(0x1000));

        controller.begin_streaming().unwrap();
        assert_eq!(controller.state(), SnapshotState::Streaming);

        let stop = controller.stop(&mut op).await.unwrap();
        assert_eq!(op.stop_lsn, Some(0x2000));
        assert_eq!(controller.state(), SnapshotState::StopDone);

        let streamer = FakeWalStreamer {
            flushed_lsn: std::sync::atomic::AtomicU64::new(0x2000),
            commit_timestamp: None,
        };
        controller
            .wait_for_wal_catch_up(&streamer, stop.stop_lsn)
            .await
            .unwrap();
        assert_eq!(controller.state(), SnapshotState::WalCaughtUp);

        controller.finish(&mut op, &streamer, &stop).await.unwrap();
        assert_eq!(controller.state(), SnapshotState::Done);
        assert_eq!(op.recovery_time, Some(stop.invocation_time));
    }

    #[tokio::test]
    async fn wal_catch_up_times_out() {
        let source = FakeSourceConnection::default();
        let mut op = CurrentOp::new(BackupMode::Full, 1, false);
        let mut controller =
            SnapshotController::new(&source, std::time::Duration::from_millis(60));
        controller.start(&mut op, "catchup").await.unwrap();
        controller.begin_streaming().unwrap();
        controller.stop(&mut op).await.unwrap();

        let streamer = FakeWalStreamer {
            flushed_lsn: std::sync::atomic::AtomicU64::new(0),
            commit_timestamp: None,
        };
        let err = controller
            .wait_for_wal_catch_up(&streamer, 0x2000)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::WalCatchUpTimeout(_)));
        assert_eq!(controller.state(), SnapshotState::Failed);
    }

    #[tokio::test]
    async fn out_of_order_transition_is_rejected() {
        let source = FakeSourceConnection::default();
        let mut op = CurrentOp::new(BackupMode::Full, 1, false);
        let mut controller = SnapshotController::new(&source, std::time::Duration::from_secs(5));
        let err = controller.stop(&mut op).await.unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidTransition(SnapshotState::Init)));
    }

    #[tokio::test]
    async fn restore_point_is_skipped_only_for_a_non_exclusive_capable_replica() {
        let source = FakeSourceConnection {
            superuser: true,
            ..Default::default()
        };
        let controller = SnapshotController::new(&source, std::time::Duration::from_secs(5));

        let replica_op = CurrentOp::new(BackupMode::Full, 1, true);
        controller
            .maybe_create_restore_point(&replica_op, true, "catchup")
            .await
            .unwrap();
        assert!(source.restore_points.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_point_is_created_for_a_master_source_when_superuser() {
        let source = FakeSourceConnection {
            superuser: true,
            ..Default::default()
        };
        let controller = SnapshotController::new(&source, std::time::Duration::from_secs(5));

        let master_op = CurrentOp::new(BackupMode::Full, 1, false);
        controller
            .maybe_create_restore_point(&master_op, true, "catchup")
            .await
            .unwrap();
        assert_eq!(
            source.restore_points.lock().unwrap().as_slice(),
            ["catchup"]
        );
    }

    #[tokio::test]
    async fn restore_point_is_created_for_an_exclusive_only_replica_when_superuser() {
        let source = FakeSourceConnection {
            superuser: true,
            ..Default::default()
        };
        let controller = SnapshotController::new(&source, std::time::Duration::from_secs(5));

        let replica_op = CurrentOp::new(BackupMode::Full, 1, true);
        controller
            .maybe_create_restore_point(&replica_op, false, "catchup")
            .await
            .unwrap();
        assert_eq!(
            source.restore_points.lock().unwrap().as_slice(),
            ["catchup"]
        );
    }

    #[tokio::test]
    async fn restore_point_is_not_created_without_superuser() {
        let source = FakeSourceConnection::default();
        let controller = SnapshotController::new(&source, std::time::Duration::from_secs(5));

        let master_op = CurrentOp::new(BackupMode::Full, 1, false);
        controller
            .maybe_create_restore_point(&master_op, true, "catchup")
            .await
            .unwrap();
        assert!(source.restore_points.lock().unwrap().is_empty());
    }
}
