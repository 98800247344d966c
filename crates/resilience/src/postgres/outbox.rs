use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use fluxora_core::{EntryId, ResilienceError, ResilienceResult};

use crate::outbox::{OutboxEntry, OutboxStatus, OutboxStore};

use super::{decode_error, is_unique_violation, map_sqlx_error};

const OUTBOX_COLUMNS: &str = r#"
    sequence, id, topic, partition_key, payload, headers, created_at,
    status, attempts, last_error, dispatched_at
"#;

/// Outbox table in Postgres.
///
/// Business code writes entries with [`PostgresOutboxStore::enqueue_in_tx`]
/// inside its own transaction; the relay reads them through [`OutboxStore`].
///
/// `sequence` is a `BIGSERIAL`, handed out at insert time. Writers of the same
/// partition key take a transaction-scoped advisory lock before inserting, so
/// within a partition sequence order is also commit order and the relay never
/// sees entry N+1 before entry N.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Insert an entry as part of the caller's transaction. The entry is only
    /// visible to the relay once the caller commits.
    ///
    /// Holds the partition's advisory lock until the caller's transaction
    /// ends; other writers to the same partition wait for it.
    #[instrument(skip(tx, entry), fields(entry_id = %entry.id, topic = %entry.topic), err)]
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        entry: &OutboxEntry,
    ) -> ResilienceResult<EntryId> {
        insert_entry(&mut **tx, entry).await
    }
}

async fn insert_entry(conn: &mut PgConnection, entry: &OutboxEntry) -> ResilienceResult<EntryId> {
    let headers = serde_json::to_value(&entry.headers)
        .map_err(|e| ResilienceError::storage(format!("encode outbox headers: {}", e)))?;

    if let Some(key) = &entry.partition_key {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("lock_outbox_partition", e))?;
    }

    sqlx::query(
        r#"
        INSERT INTO outbox_entries (
            id, topic, partition_key, payload, headers, created_at, status, attempts
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(&entry.topic)
    .bind(&entry.partition_key)
    .bind(&entry.payload)
    .bind(headers)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            ResilienceError::invalid_state(format!("outbox entry {} already exists", entry.id))
        } else {
            map_sqlx_error("insert_outbox_entry", e)
        }
    })?;

    Ok(entry.id)
}

fn parse_status(raw: &str) -> ResilienceResult<OutboxStatus> {
    match raw {
        "pending" => Ok(OutboxStatus::Pending),
        "dispatched" => Ok(OutboxStatus::Dispatched),
        "failed" => Ok(OutboxStatus::Failed),
        other => Err(decode_error("outbox", format!("unknown status `{}`", other))),
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> ResilienceResult<OutboxEntry> {
    let decode = |e: sqlx::Error| decode_error("outbox", e);
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let sequence: i64 = row.try_get("sequence").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let headers: serde_json::Value = row.try_get("headers").map_err(decode)?;
    let headers: BTreeMap<String, String> =
        serde_json::from_value(headers).map_err(|e| decode_error("outbox", e))?;

    Ok(OutboxEntry {
        id: EntryId::from_uuid(id),
        topic: row.try_get("topic").map_err(decode)?,
        partition_key: row.try_get("partition_key").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        headers,
        created_at: row.try_get("created_at").map_err(decode)?,
        sequence: sequence as u64,
        status: parse_status(&status)?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        dispatched_at: row.try_get("dispatched_at").map_err(decode)?,
    })
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, topic = %entry.topic), err)]
    async fn enqueue(&self, entry: OutboxEntry) -> ResilienceResult<EntryId> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_enqueue", e))?;
        let id = insert_entry(&mut *tx, &entry).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_enqueue", e))?;
        Ok(id)
    }

    #[instrument(skip(self), fields(pending = tracing::field::Empty), err)]
    async fn fetch_pending(&self, limit: usize) -> ResilienceResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_entries WHERE status = 'pending' ORDER BY sequence ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        Span::current().record("pending", rows.len());
        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn get(&self, id: EntryId) -> ResilienceResult<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_entries WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_outbox_entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn mark_dispatched(&self, id: EntryId, attempts: u32, at: DateTime<Utc>) -> ResilienceResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'dispatched', attempts = $2, dispatched_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempts as i32)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dispatched", e))?;

        expect_row(result.rows_affected(), id)
    }

    #[instrument(skip(self, error), fields(entry_id = %id), err)]
    async fn record_attempts(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_entries SET attempts = $2, last_error = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(attempts as i32)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_attempts", e))?;

        expect_row(result.rows_affected(), id)
    }

    #[instrument(skip(self, error), fields(entry_id = %id), err)]
    async fn mark_failed(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'failed', attempts = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempts as i32)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        expect_row(result.rows_affected(), id)
    }

    #[instrument(skip(self), err)]
    async fn purge_dispatched(&self, before: DateTime<Utc>) -> ResilienceResult<usize> {
        let result = sqlx::query(
            "DELETE FROM outbox_entries WHERE status = 'dispatched' AND dispatched_at < $1",
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_dispatched", e))?;

        Ok(result.rows_affected() as usize)
    }
}

fn expect_row(affected: u64, id: EntryId) -> ResilienceResult<()> {
    if affected == 0 {
        return Err(ResilienceError::not_found(format!("outbox entry {}", id)));
    }
    Ok(())
}
