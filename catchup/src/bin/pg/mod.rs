//! Concrete adapters wiring `catchup`'s injectable traits to a live
//! `tokio-postgres` connection and to the handful of on-disk formats this
//! subsystem reads directly (the control file, data-page headers, streamed
//! WAL). Kept out of the library crate because none of it is exercised by
//! anything other than the `catchup` binary itself (§1's Out of scope list:
//! data-page codecs, WAL parsing, and the replication-protocol client are
//! external collaborators, not part of the core).

pub mod connection;
pub mod control_file;
pub mod page;
pub mod replication;
pub mod wal_scanner;
