//! Postgres-backed inbox store.
//!
//! The claim is one unique-constraint insert: the first worker to see an
//! `event_id` wins the row, concurrent workers observe `processing`, and a
//! `processed` row permanently blocks further handler invocations. Rows from
//! failed attempts are reclaimed on redelivery.

use async_trait::async_trait;
use courier_core::error::Error;
use courier_core::inbox::{ClaimOutcome, InboxStatus, InboxStore};
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_TABLE: &str = "courier_inbox";

/// DDL for the inbox table, for embedding in the application's migrations.
pub fn schema_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
    event_id     UUID PRIMARY KEY,
    subject      TEXT NOT NULL,
    stream       TEXT NOT NULL,
    stream_seq   BIGINT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'processing',
    deliveries   INTEGER NOT NULL DEFAULT 1,
    received_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed_at TIMESTAMPTZ,
    last_error   TEXT
);
CREATE INDEX IF NOT EXISTS {table}_sweep_idx ON {table} (status, received_at);
"#
    )
}

fn storage_error(what: impl std::fmt::Display, err: sqlx::Error) -> Error {
    Error::connection(format!("inbox storage, {what}: {err}"))
}

#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
    table: String,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_table(pool, DEFAULT_TABLE)
    }

    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn claim(
        &self,
        event_id: Uuid,
        subject: &str,
        stream: &str,
        stream_seq: u64,
    ) -> Result<ClaimOutcome, Error> {
        let insert = format!(
            "INSERT INTO {} (event_id, subject, stream, stream_seq, status, deliveries, received_at) \
             VALUES ($1, $2, $3, $4, 'processing', 1, now()) \
             ON CONFLICT (event_id) DO NOTHING",
            self.table
        );
        let inserted = sqlx::query(&insert)
            .bind(event_id)
            .bind(subject)
            .bind(stream)
            .bind(stream_seq as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("claim insert", e))?;
        if inserted.rows_affected() == 1 {
            debug!(event_id = %event_id, "inbox row claimed");
            return Ok(ClaimOutcome::New);
        }

        // The row exists; a failed attempt may be reclaimed, anything else
        // is either done or owned by another worker.
        let reclaim = format!(
            "UPDATE {} SET status = 'processing', deliveries = deliveries + 1 \
             WHERE event_id = $1 AND status = 'failed'",
            self.table
        );
        let reclaimed = sqlx::query(&reclaim)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("claim reclaim", e))?;
        if reclaimed.rows_affected() == 1 {
            debug!(event_id = %event_id, "failed inbox row reclaimed");
            return Ok(ClaimOutcome::New);
        }

        let select = format!("SELECT status FROM {} WHERE event_id = $1", self.table);
        let row = sqlx::query(&select)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("claim status read", e))?;
        match row {
            // Row vanished between statements (sweep); treat as fresh.
            None => {
                self.claim_retry(event_id, subject, stream, stream_seq).await
            }
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| storage_error("status column", e))?;
                match InboxStatus::parse(&status)? {
                    InboxStatus::Processed => Ok(ClaimOutcome::Processed),
                    InboxStatus::Failed => Ok(ClaimOutcome::InProgress),
                    InboxStatus::Processing | InboxStatus::Received => Ok(ClaimOutcome::InProgress),
                }
            }
        }
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET status = 'processed', processed_at = now(), last_error = NULL \
             WHERE event_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("mark processed", e))?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', last_error = $2 WHERE event_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(event_id)
            .bind(last_error)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("mark failed", e))?;
        Ok(())
    }

    async fn sweep(&self, older_than: OffsetDateTime) -> Result<u64, Error> {
        let sql = format!(
            "DELETE FROM {} WHERE status = 'processed' AND processed_at < $1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("sweep", e))?;
        Ok(result.rows_affected())
    }
}

impl PgInboxStore {
    async fn claim_retry(
        &self,
        event_id: Uuid,
        subject: &str,
        stream: &str,
        stream_seq: u64,
    ) -> Result<ClaimOutcome, Error> {
        let insert = format!(
            "INSERT INTO {} (event_id, subject, stream, stream_seq, status, deliveries, received_at) \
             VALUES ($1, $2, $3, $4, 'processing', 1, now()) \
             ON CONFLICT (event_id) DO NOTHING",
            self.table
        );
        let inserted = sqlx::query(&insert)
            .bind(event_id)
            .bind(subject)
            .bind(stream)
            .bind(stream_seq as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("claim reinsert", e))?;
        if inserted.rows_affected() == 1 {
            Ok(ClaimOutcome::New)
        } else {
            Ok(ClaimOutcome::InProgress)
        }
    }
}
