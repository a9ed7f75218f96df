//! `WalRecordScanner` that looks for commit-timestamp records in WAL already
//! written to the destination's WAL directory.
//!
//! Full WAL parsing - every resource manager, records split across page
//! boundaries - is out of scope for this subsystem; this scan only reads
//! `XLogRecord` headers far enough to find transaction-commit records and
//! pull their `xact_time` field, which is all C6's recovery-time fallback
//! needs.

use std::path::{Path, PathBuf};

use catchup::wal::{WalRecordScanner, WAL_SEGMENT_SIZE};
use chrono::{DateTime, TimeZone, Utc};

const RM_XACT_ID: u8 = 1;
const XLR_RMGR_INFO_MASK: u8 = 0xF0;
const XLOG_XACT_COMMIT: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 24;
/// Seconds between the Unix epoch and PostgreSQL's own epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub struct CommitTimestampScanner {
    wal_dir: PathBuf,
}

impl CommitTimestampScanner {
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
        }
    }

    fn segment_path(&self, segment_no: u64) -> PathBuf {
        self.wal_dir.join(format!("{segment_no:016X}"))
    }
}

fn pg_timestamp_to_utc(micros_since_2000: i64) -> Option<DateTime<Utc>> {
    let secs = PG_EPOCH_OFFSET_SECS + micros_since_2000.div_euclid(1_000_000);
    let nanos = micros_since_2000.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32).single()
}

fn scan_segment(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let mut offset = 0usize;
    let mut latest = None;
    while offset + RECORD_HEADER_LEN <= bytes.len() {
        let tot_len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        if tot_len < RECORD_HEADER_LEN {
            break;
        }
        let info = bytes[offset + 16];
        let rmid = bytes[offset + 17];
        if rmid == RM_XACT_ID && (info & XLR_RMGR_INFO_MASK) == XLOG_XACT_COMMIT {
            if let Some(body) = bytes.get(offset + RECORD_HEADER_LEN..offset + RECORD_HEADER_LEN + 8) {
                let micros = i64::from_le_bytes(body.try_into().unwrap());
                if let Some(ts) = pg_timestamp_to_utc(micros) {
                    latest = Some(ts);
                }
            }
        }
        let aligned = tot_len.div_ceil(8) * 8;
        if aligned == 0 {
            break;
        }
        offset += aligned;
    }
    latest
}

impl WalRecordScanner for CommitTimestampScanner {
    fn latest_commit_timestamp(&self, start_lsn: u64, stop_lsn: u64) -> Option<DateTime<Utc>> {
        if stop_lsn < start_lsn {
            return None;
        }
        let first_segment = start_lsn / WAL_SEGMENT_SIZE;
        let last_segment = stop_lsn / WAL_SEGMENT_SIZE;
        let mut latest = None;
        for segment_no in first_segment..=last_segment {
            let path = self.segment_path(segment_no);
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if let Some(ts) = scan_segment(&bytes) {
                latest = Some(ts);
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_record(xact_time_micros: i64) -> Vec<u8> {
        let mut record = vec![0u8; RECORD_HEADER_LEN + 8];
        let tot_len = record.len() as u32;
        record[0..4].copy_from_slice(&tot_len.to_le_bytes());
        record[16] = XLOG_XACT_COMMIT;
        record[17] = RM_XACT_ID;
        record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + 8]
            .copy_from_slice(&xact_time_micros.to_le_bytes());
        record
    }

    #[test]
    fn finds_the_latest_commit_timestamp_in_a_segment() {
        let mut segment = commit_record(0);
        segment.extend(commit_record(5_000_000));
        let ts = scan_segment(&segment).unwrap();
        assert_eq!(ts, pg_timestamp_to_utc(5_000_000).unwrap());
    }

    #[test]
    fn ignores_non_commit_records() {
        let mut record = commit_record(1_000_000);
        record[17] = 0; // not RM_XACT_ID
        assert!(scan_segment(&record).is_none());
    }

    #[test]
    fn missing_segment_files_are_skipped_rather_than_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = CommitTimestampScanner::new(dir.path());
        assert_eq!(scanner.latest_commit_timestamp(0, WAL_SEGMENT_SIZE), None);
    }
}
