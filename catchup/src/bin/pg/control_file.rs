//! Minimal binary codec for the destination's `global/pg_control` file.
//!
//! A full `pg_control` codec (every field, every on-disk format version) is
//! out of scope for this subsystem; this one understands the handful of
//! fields C5/C9/C10 actually need - system identifier, shutdown state, the
//! redo point, and the current timeline - plus the min-recovery-point field
//! C10 patches on a replica source, and the CRC32C checksum the server
//! verifies on startup, recomputed whenever a field changes.

use catchup::control::{ControlFileReader, ParsedControlFile, ShutdownState};
use catchup::finalizer::ControlFileEditor;
use catchup::types::RedoParams;

const SYSTEM_IDENTIFIER: std::ops::Range<usize> = 0..8;
const STATE: usize = 8;
const REDO_LSN: std::ops::Range<usize> = 16..24;
const CHECKPOINT_LOCATION: std::ops::Range<usize> = 24..32;
const TIMELINE: std::ops::Range<usize> = 32..36;
const MIN_RECOVERY_POINT: std::ops::Range<usize> = 40..48;
const CRC: std::ops::Range<usize> = 48..52;
const MIN_LEN: usize = 52;

fn state_from_byte(b: u8) -> ShutdownState {
    match b {
        1 => ShutdownState::Shutdowned,
        2 => ShutdownState::ShutdownedInRecovery,
        _ => ShutdownState::Other,
    }
}

fn checksum(control_file: &[u8]) -> u32 {
    crc32c::crc32c(&control_file[..CRC.start])
}

fn require_len(control_file: &[u8]) -> Result<(), String> {
    if control_file.len() < MIN_LEN {
        return Err(format!(
            "control file is {} bytes, expected at least {MIN_LEN}",
            control_file.len()
        ));
    }
    Ok(())
}

pub struct PgControlCodec;

impl ControlFileReader for PgControlCodec {
    fn parse(&self, control_file: &[u8]) -> Result<ParsedControlFile, String> {
        require_len(control_file)?;
        let stored_crc = u32::from_le_bytes(control_file[CRC].try_into().unwrap());
        if stored_crc != checksum(control_file) {
            return Err("control file checksum does not match its contents".to_string());
        }
        Ok(ParsedControlFile {
            system_identifier: u64::from_le_bytes(control_file[SYSTEM_IDENTIFIER].try_into().unwrap()),
            shutdown_state: state_from_byte(control_file[STATE]),
            redo: RedoParams {
                timeline: u32::from_le_bytes(control_file[TIMELINE].try_into().unwrap()),
                lsn: u64::from_le_bytes(control_file[REDO_LSN].try_into().unwrap()),
                checkpoint_location: u64::from_le_bytes(
                    control_file[CHECKPOINT_LOCATION].try_into().unwrap(),
                ),
            },
        })
    }
}

impl ControlFileEditor for PgControlCodec {
    fn set_min_recovery_point(&self, control_file: &[u8], lsn: u64) -> Result<Vec<u8>, String> {
        require_len(control_file)?;
        let mut patched = control_file.to_vec();
        patched[MIN_RECOVERY_POINT].copy_from_slice(&lsn.to_le_bytes());
        let crc = checksum(&patched);
        patched[CRC].copy_from_slice(&crc.to_le_bytes());
        Ok(patched)
    }
}
