//! `ReplicationSource` against the server's physical-replication sub-protocol.
//!
//! Parsing WAL record contents is out of scope for this subsystem; this
//! adapter only pulls `XLogData` byte chunks off the wire and acknowledges
//! keepalives, handing the raw bytes to `catchup::wal::DestinationWalStreamer`.

use bytes::Bytes;
use catchup::wal::ReplicationSource;
use futures::{Sink, StreamExt};
use tokio::sync::Mutex;
use tokio_postgres::replication::ReplicationStream;
use tokio_postgres::types::PgLsn;

pub struct PgReplicationSource {
    stream: Mutex<std::pin::Pin<Box<ReplicationStream>>>,
}

impl PgReplicationSource {
    /// `conninfo` must request replication mode (`replication=true`).
    /// `slot` is a pre-created physical replication slot name.
    pub async fn start(
        conninfo: &str,
        slot: &str,
        start_lsn: u64,
    ) -> anyhow::Result<(
        Self,
        tokio_postgres::Connection<tokio_postgres::Socket, tokio_postgres::tls::NoTlsStream>,
    )> {
        let (client, connection) = tokio_postgres::connect(conninfo, tokio_postgres::NoTls).await?;
        let query = format!(
            "START_REPLICATION SLOT {slot} PHYSICAL {}",
            PgLsn::from(start_lsn)
        );
        let copy_stream = client.copy_both_simple::<Bytes>(&query).await?;
        let stream = ReplicationStream::new(copy_stream);
        Ok((
            Self {
                stream: Mutex::new(Box::pin(stream)),
            },
            connection,
        ))
    }
}

#[async_trait::async_trait]
impl ReplicationSource for PgReplicationSource {
    async fn recv(&self) -> Option<(u64, Vec<u8>)> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.as_mut().next().await? {
                Ok(message) => match message {
                    tokio_postgres::replication::ReplicationMessage::XLogData(data) => {
                        return Some((data.wal_start(), data.into_data().to_vec()));
                    }
                    tokio_postgres::replication::ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                        if keepalive.reply() == 1 {
                            let update = tokio_postgres::replication::StandbyStatusUpdate::new(
                                keepalive.wal_end(),
                                keepalive.wal_end(),
                                keepalive.wal_end(),
                                chrono::Utc::now(),
                                0,
                            );
                            let _ = std::pin::Pin::new(&mut *stream).as_mut().start_send(update);
                        }
                        continue;
                    }
                    _ => continue,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "replication stream ended with an error");
                    return None;
                }
            }
        }
    }
}
