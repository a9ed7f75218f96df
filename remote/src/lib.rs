//! The "local vs. remote host" data-directory capability.
//!
//! Every component that touches a PostgreSQL data directory (the directory
//! scanner, the topology replicator, the reaper, the transfer pool, the
//! finalizer) does so through the [`DataDirIo`] trait rather than calling
//! `std::fs` directly, so the same code runs whether the source or
//! destination lives on the local machine or across the network.
//!
//! [`LocalIo`] talks to the filesystem directly. [`RemoteIo`] proxies every
//! call over a plain TCP connection, framed with `tokio_util`'s
//! length-delimited codec and `bincode` - the same framing idiom as the
//! teacher's QUIC-based transport, minus QUIC itself: this subsystem's
//! remote capability is deliberately just a control/data channel, not a
//! full deployment system (no SSH auto-deploy, no TLS, no certificate
//! pinning - see `DESIGN.md`).

pub mod client;
pub mod io;
pub mod local;
pub mod protocol;
pub mod server;
pub mod streams;

pub use client::RemoteIo;
pub use io::DataDirIo;
pub use local::LocalIo;
