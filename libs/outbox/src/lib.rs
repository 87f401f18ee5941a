//! Postgres-backed outbox store.
//!
//! The table is owned by the application's schema management; [`schema_sql`]
//! prints the expected shape. Staging happens inside the caller's
//! transaction via [`PgOutboxTx`], so an event row commits or rolls back
//! together with the business writes that produced it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use courier_core::error::Error;
use courier_core::outbox::{
    NewOutboxRecord, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore, OutboxTx,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_TABLE: &str = "courier_outbox";

/// DDL for the outbox table, for embedding in the application's migrations.
pub fn schema_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
    id              BIGSERIAL PRIMARY KEY,
    event_id        UUID NOT NULL UNIQUE,
    subject         TEXT NOT NULL,
    payload         BYTEA NOT NULL,
    headers         JSONB NOT NULL DEFAULT '{{}}',
    status          TEXT NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS {table}_due_idx ON {table} (status, next_attempt_at);
"#
    )
}

fn headers_to_json(headers: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::to_value(headers).unwrap_or_else(|_| serde_json::json!({}))
}

fn headers_from_json(value: serde_json::Value) -> BTreeMap<String, String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, Error> {
    let status: String = get(row, "status")?;
    Ok(OutboxRecord {
        id: get(row, "id")?,
        event_id: get(row, "event_id")?,
        subject: get(row, "subject")?,
        payload: get(row, "payload")?,
        headers: headers_from_json(get(row, "headers")?),
        status: OutboxStatus::parse(&status)?,
        attempts: get(row, "attempts")?,
        last_error: get(row, "last_error")?,
        created_at: get(row, "created_at")?,
        next_attempt_at: get(row, "next_attempt_at")?,
    })
}

fn get<'r, T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>>(
    row: &'r PgRow,
    column: &str,
) -> Result<T, Error> {
    row.try_get(column)
        .map_err(|e| storage_error(format!("column {column}"), e))
}

fn storage_error(what: impl std::fmt::Display, err: sqlx::Error) -> Error {
    Error::connection(format!("outbox storage, {what}: {err}"))
}

/// Stages rows into a live transaction.
pub struct PgOutboxTx<'t, 'c> {
    tx: &'t mut Transaction<'c, Postgres>,
    table: String,
}

impl<'t, 'c> PgOutboxTx<'t, 'c> {
    pub fn new(tx: &'t mut Transaction<'c, Postgres>) -> Self {
        Self::with_table(tx, DEFAULT_TABLE)
    }

    pub fn with_table(tx: &'t mut Transaction<'c, Postgres>, table: impl Into<String>) -> Self {
        Self {
            tx,
            table: table.into(),
        }
    }
}

#[async_trait]
impl OutboxTx for PgOutboxTx<'_, '_> {
    async fn stage(&mut self, record: NewOutboxRecord) -> Result<(), Error> {
        let sql = format!(
            "INSERT INTO {} (event_id, subject, payload, headers, status, attempts, created_at, next_attempt_at) \
             VALUES ($1, $2, $3, $4, 'pending', 0, $5, $5)",
            self.table
        );
        let now = OffsetDateTime::now_utc();
        sqlx::query(&sql)
            .bind(record.event_id)
            .bind(&record.subject)
            .bind(&record.payload)
            .bind(headers_to_json(&record.headers))
            .bind(now)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::publish(
                    format!("event {} is already staged", record.event_id),
                ),
                e => storage_error("stage row", e),
            })?;
        debug!(event_id = %record.event_id, subject = %record.subject, "outbox row staged");
        Ok(())
    }
}

/// Relay-facing store over a connection pool.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    table: String,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_table(pool, DEFAULT_TABLE)
    }

    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Resets `failed` rows back to `pending` for administrative replay.
    pub async fn replay_failed(&self) -> Result<u64, Error> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', attempts = 0, last_error = NULL, next_attempt_at = now() \
             WHERE status = 'failed'",
            self.table
        );
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("replay failed rows", e))?;
        Ok(result.rows_affected())
    }

    /// Administrative backfill: re-publishes everything created since `ts`,
    /// including rows already published (the broker's dedup window decides
    /// whether downstream sees duplicates).
    pub async fn replay_since(&self, ts: OffsetDateTime) -> Result<u64, Error> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', attempts = 0, last_error = NULL, next_attempt_at = now() \
             WHERE created_at >= $1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(ts)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("replay since timestamp", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(
        &self,
        limit: u32,
        now: OffsetDateTime,
    ) -> Result<Vec<OutboxRecord>, Error> {
        // SKIP LOCKED keeps concurrent relay workers off each other's rows;
        // flipping status in the same statement makes the claim atomic.
        let sql = format!(
            "UPDATE {table} SET status = 'publishing' \
             WHERE id IN ( \
                 SELECT id FROM {table} \
                 WHERE status = 'pending' AND next_attempt_at <= $1 \
                 ORDER BY next_attempt_at \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, event_id, subject, payload, headers, status, attempts, last_error, \
                       created_at, next_attempt_at",
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("claim batch", e))?;
        rows.iter().map(row_to_record).collect()
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET status = 'published', last_error = NULL WHERE event_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("mark published", e))?;
        Ok(())
    }

    async fn reschedule(
        &self,
        event_id: Uuid,
        attempts: i32,
        next_attempt_at: OffsetDateTime,
        last_error: &str,
    ) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', attempts = $2, next_attempt_at = $3, last_error = $4 \
             WHERE event_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(event_id)
            .bind(attempts)
            .bind(next_attempt_at)
            .bind(last_error)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("reschedule", e))?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', attempts = attempts + 1, last_error = $2 \
             WHERE event_id = $1",
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

    async fn stats(&self) -> Result<OutboxStats, Error> {
        let sql = format!(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'pending')::BIGINT AS pending, \
                 COUNT(*) FILTER (WHERE status = 'failed')::BIGINT AS failed, \
                 COALESCE(EXTRACT(EPOCH FROM (now() - MIN(created_at) FILTER (WHERE status = 'pending')))::BIGINT, 0) AS oldest \
             FROM {}",
            self.table
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error("stats", e))?;
        Ok(OutboxStats {
            pending: row.try_get("pending").unwrap_or(0),
            failed: row.try_get("failed").unwrap_or(0),
            oldest_pending_seconds: row.try_get("oldest").unwrap_or(0),
        })
    }
}
