//! C5 — preflight checker.
//!
//! Runs every check in §4.4 in order and aborts on the first failure; the
//! variants of [`PreflightError`] carry exactly the wording the end-to-end
//! scenarios in §8 expect, so the CLI layer can print them verbatim.

use remote::DataDirIo;

use crate::tablespace::TablespaceMap;
use crate::timeline::TimelineHistory;
use crate::types::{BackupMode, RedoParams};
use crate::snapshot::SourceConnection;

/// Minimum source server version (as `server_version_num`, e.g. `150000` for
/// 15.0) that a from-replica backup is permitted against.
pub const MIN_REPLICA_SERVER_VERSION: u32 = 90600;

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("destination data directory is not empty; FULL backups require an empty destination")]
    DestinationNotEmptyForFull,
    #[error("destination data directory is empty; {0} backups require a prior FULL backup as their base")]
    DestinationEmptyForIncremental(BackupMode),
    #[error("destination postmaster.pid is present but could not be parsed")]
    PostmasterPidUnparseable,
    #[error("destination postmaster appears to be running; refusing to catch up a live data directory")]
    PostmasterRunning,
    #[error("destination contains a stale backup_label from a previous, unfinished backup")]
    StaleBackupLabel,
    #[error("destination was not cleanly shut down; its control file does not report a clean shutdown state")]
    NotCleanlyShutDown,
    #[error("system identifier mismatch: source is {source:#x}, destination is {destination:#x}")]
    SystemIdentifierMismatch { source: u64, destination: u64 },
    #[error("PTRACK mode requires the ptrack extension, but it is not installed on the source")]
    PtrackNotInstalled,
    #[error("PTRACK mode requires the ptrack extension to be enabled (ptrack.map_size > 0)")]
    PtrackNotEnabled,
    #[error(
        "--from-replica requires source server version >= {MIN_REPLICA_SERVER_VERSION}, found {0}"
    )]
    ReplicaServerTooOld(u32),
    #[error("tablespace {0} has no destination mapping and the source is local; pass --tablespace-mapping")]
    TablespaceMappingIncomplete(std::path::PathBuf),
    #[error("tablespace mapping target {0} is not empty; FULL backups require empty tablespace targets")]
    TablespaceTargetNotEmpty(std::path::PathBuf),
    #[error("destination timeline {dest_timeline} at LSN {dest_lsn:X} is not reachable from source timeline {source_timeline}")]
    TimelineMismatch {
        dest_timeline: u32,
        dest_lsn: u64,
        source_timeline: u32,
    },
    #[error(transparent)]
    Io(#[from] common::error::IoError),
}

/// Non-fatal findings surfaced alongside a successful preflight pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightWarning {
    /// A tablespace symlink target on a remote source has no destination
    /// mapping. Fatal for a local source ([`PreflightError::TablespaceMappingIncomplete`]);
    /// only a warning here because the remote capability cannot resolve the
    /// target to check it without a second connection (§4.4).
    UnmappedRemoteTablespace(std::path::PathBuf),
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub warnings: Vec<PreflightWarning>,
}

/// Whether the destination directory, as scanned, looks like a previously
/// completed, cleanly shut down PostgreSQL data directory.
#[derive(Debug, Clone, Copy)]
pub struct DestinationState {
    pub is_empty: bool,
    pub has_backup_label: bool,
    pub cleanly_shut_down: bool,
    pub system_identifier: Option<u64>,
    pub redo: Option<RedoParams>,
}

/// Absolute paths of tablespace symlink targets found in `pg_tblspc/` during
/// the scan (C2), paired with whether the source is local.
pub struct TablespaceSources<'a> {
    pub targets: &'a [std::path::PathBuf],
    pub source_is_local: bool,
}

pub async fn run(
    mode: BackupMode,
    destination: &DestinationState,
    source: &dyn SourceConnection,
    destination_io: &dyn DataDirIo,
    tablespace_map: &TablespaceMap,
    tablespace_sources: &TablespaceSources<'_>,
    timeline_history_text: Option<&str>,
) -> Result<PreflightReport, PreflightError> {
    check_destination_emptiness(mode, destination)?;
    check_postmaster(destination_io).await?;
    check_stale_backup_label(destination)?;
    check_clean_shutdown(mode, destination)?;
    check_system_identifier(source, destination).await?;
    if mode == BackupMode::Ptrack {
        check_ptrack_prerequisites(source).await?;
    }
    check_replica_version(source).await?;
    let mut report = PreflightReport::default();
    check_tablespace_mapping(tablespace_map, tablespace_sources, &mut report)?;
    if mode == BackupMode::Full {
        check_tablespace_targets_empty(tablespace_map, tablespace_sources).await?;
    }
    check_timeline(source, destination, timeline_history_text).await?;
    Ok(report)
}

fn check_destination_emptiness(
    mode: BackupMode,
    destination: &DestinationState,
) -> Result<(), PreflightError> {
    match (mode, destination.is_empty) {
        (BackupMode::Full, false) => Err(PreflightError::DestinationNotEmptyForFull),
        (BackupMode::Delta | BackupMode::Ptrack, true) => {
            Err(PreflightError::DestinationEmptyForIncremental(mode))
        }
        _ => Ok(()),
    }
}

async fn check_postmaster(destination_io: &dyn DataDirIo) -> Result<(), PreflightError> {
    match destination_io.check_postmaster().await {
        Ok(true) => Err(PreflightError::PostmasterRunning),
        Ok(false) => Ok(()),
        Err(e) => {
            if is_unparseable(&e) {
                Err(PreflightError::PostmasterPidUnparseable)
            } else {
                Err(e.into())
            }
        }
    }
}

fn is_unparseable(e: &common::error::IoError) -> bool {
    matches!(e, common::error::IoError::Remote(msg) if msg.contains("pid"))
}

fn check_stale_backup_label(destination: &DestinationState) -> Result<(), PreflightError> {
    if destination.has_backup_label {
        return Err(PreflightError::StaleBackupLabel);
    }
    Ok(())
}

fn check_clean_shutdown(
    mode: BackupMode,
    destination: &DestinationState,
) -> Result<(), PreflightError> {
    if mode != BackupMode::Full && !destination.cleanly_shut_down {
        return Err(PreflightError::NotCleanlyShutDown);
    }
    Ok(())
}

async fn check_system_identifier(
    source: &dyn SourceConnection,
    destination: &DestinationState,
) -> Result<(), PreflightError> {
    let Some(dest_id) = destination.system_identifier else {
        return Ok(());
    };
    let source_id = source
        .system_identifier()
        .await
        .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?;
    if source_id != dest_id {
        return Err(PreflightError::SystemIdentifierMismatch {
            source: source_id,
            destination: dest_id,
        });
    }
    Ok(())
}

async fn check_ptrack_prerequisites(source: &dyn SourceConnection) -> Result<(), PreflightError> {
    let version = source
        .ptrack_version()
        .await
        .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?;
    if version.is_none() {
        return Err(PreflightError::PtrackNotInstalled);
    }
    let enabled = source
        .is_ptrack_enabled()
        .await
        .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?;
    if !enabled {
        return Err(PreflightError::PtrackNotEnabled);
    }
    Ok(())
}

async fn check_replica_version(source: &dyn SourceConnection) -> Result<(), PreflightError> {
    let is_replica = source
        .is_replica()
        .await
        .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?;
    if !is_replica {
        return Ok(());
    }
    let version = source
        .server_version()
        .await
        .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?;
    if version < MIN_REPLICA_SERVER_VERSION {
        return Err(PreflightError::ReplicaServerTooOld(version));
    }
    Ok(())
}

fn check_tablespace_mapping(
    tablespace_map: &TablespaceMap,
    sources: &TablespaceSources<'_>,
    report: &mut PreflightReport,
) -> Result<(), PreflightError> {
    for target in sources.targets {
        if tablespace_map.contains(target) {
            continue;
        }
        if sources.source_is_local {
            return Err(PreflightError::TablespaceMappingIncomplete(target.clone()));
        }
        report
            .warnings
            .push(PreflightWarning::UnmappedRemoteTablespace(target.clone()));
    }
    Ok(())
}

/// FULL mode requires every mapped tablespace target directory to be empty
/// (§4.4): a FULL backup builds a destination tree from scratch, so a
/// non-empty mapped target would silently mix in leftover files from a
/// previous, unrelated use of that directory.
async fn check_tablespace_targets_empty(
    tablespace_map: &TablespaceMap,
    sources: &TablespaceSources<'_>,
) -> Result<(), PreflightError> {
    for target in sources.targets {
        let resolved = tablespace_map.resolve(target);
        let mut dir = match tokio::fs::read_dir(&resolved).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(PreflightError::Io(common::error::IoError::Path {
                    path: resolved.to_path_buf(),
                    source: e,
                }))
            }
        };
        let next = dir
            .next_entry()
            .await
            .map_err(|e| PreflightError::Io(common::error::IoError::Path {
                path: resolved.to_path_buf(),
                source: e,
            }))?;
        if next.is_some() {
            return Err(PreflightError::TablespaceTargetNotEmpty(resolved.to_path_buf()));
        }
    }
    Ok(())
}

/// Timeline validation is skipped entirely when the source is on timeline 1
/// (§4.4): there is no history to reconcile against yet.
async fn check_timeline(
    source: &dyn SourceConnection,
    destination: &DestinationState,
    timeline_history_text: Option<&str>,
) -> Result<(), PreflightError> {
    let source_timeline = source
        .current_timeline()
        .await
        .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?;
    if source_timeline == 1 {
        return Ok(());
    }
    let Some(redo) = destination.redo else {
        return Ok(());
    };
    let history = match timeline_history_text {
        Some(text) => TimelineHistory::parse(text)
            .map_err(|e| PreflightError::Io(common::error::IoError::Remote(e.to_string())))?,
        None => TimelineHistory::default(),
    };
    if !history.satisfies(redo.timeline, redo.lsn, source_timeline) {
        return Err(PreflightError::TimelineMismatch {
            dest_timeline: redo.timeline,
            dest_lsn: redo.lsn,
            source_timeline,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fakes::FakeSourceConnection;
    use std::path::PathBuf;

    fn empty_destination() -> DestinationState {
        DestinationState {
            is_empty: true,
            has_backup_label: false,
            cleanly_shut_down: true,
            system_identifier: None,
            redo: None,
        }
    }

    #[test]
    fn full_mode_rejects_nonempty_destination() {
        let destination = DestinationState {
            is_empty: false,
            ..empty_destination()
        };
        assert!(matches!(
            check_destination_emptiness(BackupMode::Full, &destination),
            Err(PreflightError::DestinationNotEmptyForFull)
        ));
    }

    #[test]
    fn delta_mode_rejects_empty_destination() {
        let destination = empty_destination();
        assert!(matches!(
            check_destination_emptiness(BackupMode::Delta, &destination),
            Err(PreflightError::DestinationEmptyForIncremental(BackupMode::Delta))
        ));
    }

    #[test]
    fn stale_backup_label_is_rejected() {
        let destination = DestinationState {
            has_backup_label: true,
            ..empty_destination()
        };
        assert!(matches!(
            check_stale_backup_label(&destination),
            Err(PreflightError::StaleBackupLabel)
        ));
    }

    #[tokio::test]
    async fn ptrack_mode_requires_installed_and_enabled_extension() {
        let source = FakeSourceConnection {
            ptrack_version: None,
            ..Default::default()
        };
        assert!(matches!(
            check_ptrack_prerequisites(&source).await,
            Err(PreflightError::PtrackNotInstalled)
        ));

        let source = FakeSourceConnection {
            ptrack_version: Some("2.1".to_string()),
            ptrack_enabled: false,
            ..Default::default()
        };
        assert!(matches!(
            check_ptrack_prerequisites(&source).await,
            Err(PreflightError::PtrackNotEnabled)
        ));
    }

    #[tokio::test]
    async fn replica_mode_rejects_old_server() {
        let source = FakeSourceConnection {
            replica: true,
            server_version: 90400,
            ..Default::default()
        };
        assert!(matches!(
            check_replica_version(&source).await,
            Err(PreflightError::ReplicaServerTooOld(90400))
        ));
    }

    #[test]
    fn local_source_fails_on_unmapped_tablespace() {
        let map = TablespaceMap::new();
        let target = PathBuf::from("/srv/ts1");
        let targets = vec![target.clone()];
        let sources = TablespaceSources {
            targets: &targets,
            source_is_local: true,
        };
        let mut report = PreflightReport::default();
        assert!(matches!(
            check_tablespace_mapping(&map, &sources, &mut report),
            Err(PreflightError::TablespaceMappingIncomplete(_))
        ));
    }

    #[test]
    fn remote_source_only_warns_on_unmapped_tablespace() {
        let map = TablespaceMap::new();
        let target = PathBuf::from("/srv/ts1");
        let targets = vec![target.clone()];
        let sources = TablespaceSources {
            targets: &targets,
            source_is_local: false,
        };
        let mut report = PreflightReport::default();
        check_tablespace_mapping(&map, &sources, &mut report).unwrap();
        assert_eq!(
            report.warnings,
            vec![PreflightWarning::UnmappedRemoteTablespace(target)]
        );
    }

    #[test]
    fn local_source_accepts_a_target_nested_under_a_mapped_source() {
        let map = TablespaceMap::from_args(["/srv/ts1=/srv/ts1b"]).unwrap();
        let targets = vec![PathBuf::from("/srv/ts1/PG_16_202501010000")];
        let sources = TablespaceSources {
            targets: &targets,
            source_is_local: true,
        };
        let mut report = PreflightReport::default();
        check_tablespace_mapping(&map, &sources, &mut report).unwrap();
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn full_mode_rejects_nonempty_mapped_tablespace_target() {
        let dest = tempfile::tempdir().unwrap();
        tokio::fs::write(dest.path().join("leftover"), b"x")
            .await
            .unwrap();
        let mut map = TablespaceMap::new();
        map.parse_entry(&format!("/srv/ts1={}", dest.path().display()))
            .unwrap();
        let targets = vec![PathBuf::from("/srv/ts1")];
        let sources = TablespaceSources {
            targets: &targets,
            source_is_local: true,
        };
        let err = check_tablespace_targets_empty(&map, &sources)
            .await
            .unwrap_err();
        assert!(matches!(err, PreflightError::TablespaceTargetNotEmpty(_)));
    }

    #[tokio::test]
    async fn full_mode_allows_empty_or_missing_mapped_tablespace_target() {
        let dest = tempfile::tempdir().unwrap();
        let missing = dest.path().join("does-not-exist-yet");
        let mut map = TablespaceMap::new();
        map.parse_entry(&format!("/srv/ts1={}", dest.path().display()))
            .unwrap();
        map.parse_entry(&format!("/srv/ts2={}", missing.display()))
            .unwrap();
        let targets = vec![PathBuf::from("/srv/ts1"), PathBuf::from("/srv/ts2")];
        let sources = TablespaceSources {
            targets: &targets,
            source_is_local: true,
        };
        check_tablespace_targets_empty(&map, &sources)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn timeline_check_skipped_on_source_timeline_one() {
        let source = FakeSourceConnection {
            current_timeline: 1,
            ..Default::default()
        };
        let destination = DestinationState {
            redo: Some(RedoParams {
                timeline: 5,
                lsn: 999,
                checkpoint_location: 999,
            }),
            ..empty_destination()
        };
        check_timeline(&source, &destination, None).await.unwrap();
    }

    #[tokio::test]
    async fn timeline_check_rejects_unreachable_destination_timeline() {
        let source = FakeSourceConnection {
            current_timeline: 4,
            ..Default::default()
        };
        let destination = DestinationState {
            redo: Some(RedoParams {
                timeline: 2,
                lsn: 300,
                checkpoint_location: 300,
            }),
            ..empty_destination()
        };
        let history = "2\t0/1\tbranch\n";
        let err = check_timeline(&source, &destination, Some(history))
            .await
            .unwrap_err();
        assert!(matches!(err, PreflightError::TimelineMismatch { .. }));
    }
}
