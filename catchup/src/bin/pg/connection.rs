//! `SourceConnection` against a live `tokio-postgres` connection.
//!
//! Every method here is a single round trip; the online-snapshot controller
//! (`catchup::snapshot`) owns all sequencing and error recovery, so this
//! adapter stays a thin SQL translation layer.

use catchup::snapshot::{SnapshotError, SourceConnection, StartBackupResult, StopBackupResult};
use tokio_postgres::Client;

fn conn_err(e: tokio_postgres::Error) -> SnapshotError {
    SnapshotError::Connection(e.to_string())
}

pub struct PgSourceConnection {
    client: Client,
    /// Connection string used to open a fresh replication-mode connection
    /// for `TIMELINE_HISTORY`, which the main connection cannot issue.
    replication_conninfo: String,
}

impl PgSourceConnection {
    pub fn new(client: Client, replication_conninfo: String) -> Self {
        Self {
            client,
            replication_conninfo,
        }
    }
}

#[async_trait::async_trait]
impl SourceConnection for PgSourceConnection {
    async fn system_identifier(&self) -> Result<u64, SnapshotError> {
        let row = self
            .client
            .query_one("SELECT system_identifier FROM pg_control_system()", &[])
            .await
            .map_err(conn_err)?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn server_version(&self) -> Result<u32, SnapshotError> {
        let row = self
            .client
            .query_one("SELECT current_setting('server_version_num')::int", &[])
            .await
            .map_err(conn_err)?;
        Ok(row.get::<_, i32>(0) as u32)
    }

    async fn is_replica(&self) -> Result<bool, SnapshotError> {
        let row = self
            .client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .map_err(conn_err)?;
        Ok(row.get(0))
    }

    async fn is_superuser(&self) -> Result<bool, SnapshotError> {
        let row = self
            .client
            .query_one("SELECT current_setting('is_superuser') = 'on'", &[])
            .await
            .map_err(conn_err)?;
        Ok(row.get(0))
    }

    async fn ptrack_version(&self) -> Result<Option<String>, SnapshotError> {
        let row = self
            .client
            .query_opt(
                "SELECT extversion FROM pg_extension WHERE extname = 'ptrack'",
                &[],
            )
            .await
            .map_err(conn_err)?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn is_ptrack_enabled(&self) -> Result<bool, SnapshotError> {
        let row = self
            .client
            .query_one(
                "SELECT coalesce((SELECT setting != '0' FROM pg_settings WHERE name = 'ptrack.map_size'), false)",
                &[],
            )
            .await
            .map_err(conn_err)?;
        Ok(row.get(0))
    }

    async fn current_timeline(&self) -> Result<u32, SnapshotError> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .await
            .map_err(conn_err)?;
        Ok(row.get::<_, i32>(0) as u32)
    }

    async fn timeline_history(&self, timeline: u32) -> Result<Option<String>, SnapshotError> {
        if timeline == 1 {
            return Ok(None);
        }
        let (repl_client, repl_conn) = tokio_postgres::connect(
            &self.replication_conninfo,
            tokio_postgres::NoTls,
        )
        .await
        .map_err(conn_err)?;
        tokio::spawn(async move {
            if let Err(e) = repl_conn.await {
                tracing::warn!(error = %e, "replication connection for timeline history closed with an error");
            }
        });
        let rows = repl_client
            .simple_query(&format!("TIMELINE_HISTORY {timeline}"))
            .await
            .map_err(conn_err)?;
        for row in rows {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = row {
                if let Some(content) = row.get("content") {
                    return Ok(Some(content.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn start_backup(&self, label: &str) -> Result<StartBackupResult, SnapshotError> {
        let row = self
            .client
            .query_one(
                "SELECT lsn FROM pg_backup_start(label := $1, fast := true)",
                &[&label],
            )
            .await
            .map_err(conn_err)?;
        let start_lsn = parse_lsn(row.get(0));
        let timeline = self.current_timeline().await?;
        Ok(StartBackupResult {
            start_lsn,
            timeline,
        })
    }

    async fn stop_backup(&self) -> Result<StopBackupResult, SnapshotError> {
        let snapshot_row = self
            .client
            .query_one("SELECT pg_current_xact_id()::text::bigint", &[])
            .await
            .map_err(conn_err)?;
        let snapshot_txid = snapshot_row.get::<_, i64>(0) as u64;

        let row = self
            .client
            .query_one("SELECT lsn, labelfile, spcmapfile FROM pg_backup_stop()", &[])
            .await
            .map_err(conn_err)?;
        let stop_lsn = parse_lsn(row.get(0));
        let backup_label: String = row.get(1);
        let tablespace_map: String = row.get(2);
        Ok(StopBackupResult {
            stop_lsn,
            snapshot_txid,
            backup_label: backup_label.into_bytes(),
            tablespace_map: tablespace_map.into_bytes(),
            invocation_time: chrono::Utc::now(),
        })
    }

    async fn create_restore_point(&self, name: &str) -> Result<(), SnapshotError> {
        self.client
            .query_one("SELECT pg_create_restore_point($1)", &[&name])
            .await
            .map_err(conn_err)?;
        Ok(())
    }
}

/// Parses a `pg_lsn` textual value (`"16/B374D848"`) into its 64-bit form.
fn parse_lsn(text: tokio_postgres::types::PgLsn) -> u64 {
    text.into()
}
