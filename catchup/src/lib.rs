//! catchup - bring a PostgreSQL data directory up to date with a running
//! source, without a full re-copy when one isn't needed.
//!
//! A catchup run is a single end-to-end operation built from ten
//! components, each in its own module:
//!
//! - [`types`] - the file entry model, backup modes, and the process-wide
//!   `CurrentOp` state shared across the run.
//! - [`scan`] - walks a local or remote data directory into a sorted list
//!   of `FileEntry`.
//! - [`tablespace`] - parses `--tablespace-mapping` arguments and resolves
//!   tablespace symlink targets.
//! - [`timeline`] - parses and validates timeline history files.
//! - [`preflight`] - the checks that must pass before anything is written:
//!   destination state, server version, timeline lineage.
//! - [`snapshot`] - drives the non-exclusive start/stop-backup protocol
//!   and the state machine that tracks it.
//! - [`wal`] - streams WAL from the source into the destination's WAL
//!   directory and tracks the flushed-LSN watermark.
//! - [`topology`] - mirrors the source tree's directories, symlinks, and
//!   tablespace mappings onto the destination before any file is copied.
//! - [`reaper`] - removes destination files that no longer exist on the
//!   source (DELTA/PTRACK only; a no-op for FULL).
//! - [`transfer`] - the parallel transfer pool that copies or partially
//!   updates every regular file.
//! - [`finalizer`] - writes the control file and backup label once the
//!   transfer completes, and fsyncs the tree.
//! - [`control`] - bridges a destination's raw control file bytes into the
//!   fields the other components need.
//! - [`orchestrate`] - wires the above into one end-to-end run and returns
//!   a summary report.
//!
//! Connecting to a real source server, streaming replication bytes off
//! the wire, and parsing `pg_control`/WAL record contents are all modeled
//! as injectable traits (`SourceConnection`, `ReplicationSource`,
//! `ControlFileReader`, `ControlFileEditor`, `WalRecordScanner`,
//! `PageSource`) rather than implemented directly in this crate; the
//! binary wires concrete implementations to them.

pub mod control;
pub mod finalizer;
pub mod orchestrate;
pub mod preflight;
pub mod reaper;
pub mod scan;
pub mod snapshot;
pub mod tablespace;
pub mod timeline;
pub mod topology;
pub mod transfer;
pub mod types;
pub mod wal;
