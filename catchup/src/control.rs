//! Bridges a destination's raw `global/pg_control` bytes into the fields
//! C5 needs. Parsing the control file's binary layout and verifying its CRC
//! are out of scope for this subsystem; [`ControlFileReader`] is the seam a
//! concrete `pg_control` codec plugs into.

use crate::preflight::DestinationState;
use crate::types::RedoParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Shutdowned,
    ShutdownedInRecovery,
    Other,
}

impl ShutdownState {
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Shutdowned | Self::ShutdownedInRecovery)
    }
}

/// The handful of fields C5/C9/C10 need out of a parsed control file.
#[derive(Debug, Clone, Copy)]
pub struct ParsedControlFile {
    pub system_identifier: u64,
    pub shutdown_state: ShutdownState,
    pub redo: RedoParams,
}

pub trait ControlFileReader: Send + Sync {
    fn parse(&self, control_file: &[u8]) -> Result<ParsedControlFile, String>;
}

/// Builds the preflight `DestinationState` for a non-empty destination.
/// `has_backup_label` and `is_empty` are derived straight from the scan (C2);
/// only the control-file-derived fields need a [`ControlFileReader`].
pub fn destination_state(
    is_empty: bool,
    has_backup_label: bool,
    control_file: Option<&[u8]>,
    reader: &dyn ControlFileReader,
) -> Result<DestinationState, String> {
    let Some(control_file) = control_file else {
        return Ok(DestinationState {
            is_empty,
            has_backup_label,
            cleanly_shut_down: true,
            system_identifier: None,
            redo: None,
        });
    };
    let parsed = reader.parse(control_file)?;
    Ok(DestinationState {
        is_empty,
        has_backup_label,
        cleanly_shut_down: parsed.shutdown_state.is_clean(),
        system_identifier: Some(parsed.system_identifier),
        redo: Some(parsed.redo),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeReader(ParsedControlFile);

    impl ControlFileReader for FakeReader {
        fn parse(&self, _control_file: &[u8]) -> Result<ParsedControlFile, String> {
            Ok(self.0)
        }
    }

    #[test]
    fn empty_destination_has_no_control_file_to_read() {
        let reader = FakeReader(ParsedControlFile {
            system_identifier: 1,
            shutdown_state: ShutdownState::Shutdowned,
            redo: RedoParams {
                timeline: 1,
                lsn: 0,
                checkpoint_location: 0,
            },
        });
        let state = destination_state(true, false, None, &reader).unwrap();
        assert!(state.is_empty);
        assert!(state.system_identifier.is_none());
    }

    #[test]
    fn non_clean_shutdown_state_is_surfaced() {
        let reader = FakeReader(ParsedControlFile {
            system_identifier: 42,
            shutdown_state: ShutdownState::Other,
            redo: RedoParams {
                timeline: 2,
                lsn: 100,
                checkpoint_location: 100,
            },
        });
        let state = destination_state(false, false, Some(b"raw"), &reader).unwrap();
        assert!(!state.cleanly_shut_down);
        assert_eq!(state.system_identifier, Some(42));
    }
}
