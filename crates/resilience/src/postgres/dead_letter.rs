use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use fluxora_core::{EntryId, ResilienceError, ResilienceResult};

use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterOrigin, DeadLetterStatus, DeadLetterStore};

use super::{decode_error, map_sqlx_error};

const DEAD_LETTER_COLUMNS: &str = r#"
    id, source, origin, payload, partition_key, headers, error, attempts,
    first_seen_at, last_attempt_at, dead_lettered_at, resolved_reason, resolved_at,
    replay_attempts, last_replay_error
"#;

#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn parse_origin(raw: &str) -> ResilienceResult<DeadLetterOrigin> {
    match raw {
        "consumer" => Ok(DeadLetterOrigin::Consumer),
        "outbox" => Ok(DeadLetterOrigin::Outbox),
        "job" => Ok(DeadLetterOrigin::Job),
        other => Err(decode_error("dead letter", format!("unknown origin `{}`", other))),
    }
}

fn resolution(status: &DeadLetterStatus) -> (Option<&str>, Option<DateTime<Utc>>) {
    match status {
        DeadLetterStatus::Parked => (None, None),
        DeadLetterStatus::Resolved { reason, resolved_at } => (Some(reason.as_str()), Some(*resolved_at)),
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> ResilienceResult<DeadLetterEntry> {
    let decode = |e: sqlx::Error| decode_error("dead letter", e);
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let origin: String = row.try_get("origin").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let replay_attempts: i32 = row.try_get("replay_attempts").map_err(decode)?;
    let headers: serde_json::Value = row.try_get("headers").map_err(decode)?;
    let headers: BTreeMap<String, String> =
        serde_json::from_value(headers).map_err(|e| decode_error("dead letter", e))?;
    let resolved_reason: Option<String> = row.try_get("resolved_reason").map_err(decode)?;
    let resolved_at: Option<DateTime<Utc>> = row.try_get("resolved_at").map_err(decode)?;

    let status = match (resolved_reason, resolved_at) {
        (Some(reason), Some(resolved_at)) => DeadLetterStatus::Resolved { reason, resolved_at },
        _ => DeadLetterStatus::Parked,
    };

    Ok(DeadLetterEntry {
        id: EntryId::from_uuid(id),
        source: row.try_get("source").map_err(decode)?,
        origin: parse_origin(&origin)?,
        payload: row.try_get("payload").map_err(decode)?,
        partition_key: row.try_get("partition_key").map_err(decode)?,
        headers,
        error: row.try_get("error").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        first_seen_at: row.try_get("first_seen_at").map_err(decode)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(decode)?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(decode)?,
        status,
        replay_attempts: replay_attempts.max(0) as u32,
        last_replay_error: row.try_get("last_replay_error").map_err(decode)?,
    })
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, source = %entry.source), err)]
    async fn insert(&self, entry: DeadLetterEntry) -> ResilienceResult<bool> {
        let headers = serde_json::to_value(&entry.headers)
            .map_err(|e| ResilienceError::storage(format!("encode dead letter headers: {}", e)))?;
        let (resolved_reason, resolved_at) = resolution(&entry.status);

        let result = sqlx::query(
            r#"
            INSERT INTO dead_letter_entries (
                id, source, origin, payload, partition_key, headers, error, attempts,
                first_seen_at, last_attempt_at, dead_lettered_at, resolved_reason, resolved_at,
                replay_attempts, last_replay_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(&entry.source)
        .bind(entry.origin.as_str())
        .bind(&entry.payload)
        .bind(&entry.partition_key)
        .bind(headers)
        .bind(&entry.error)
        .bind(entry.attempts as i32)
        .bind(entry.first_seen_at)
        .bind(entry.last_attempt_at)
        .bind(entry.dead_lettered_at)
        .bind(resolved_reason)
        .bind(resolved_at)
        .bind(entry.replay_attempts as i32)
        .bind(&entry.last_replay_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn get(&self, id: EntryId) -> ResilienceResult<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_entries WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &DeadLetterFilter) -> ResilienceResult<Vec<DeadLetterEntry>> {
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(i64::MAX);
        let offset = i64::try_from(filter.offset).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letter_entries
            WHERE ($1::text IS NULL OR source = $1)
                AND ($2::text IS NULL OR origin = $2)
                AND ($3 OR resolved_at IS NULL)
            ORDER BY dead_lettered_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.source.as_deref())
        .bind(filter.origin.map(|o| o.as_str()))
        .bind(filter.include_resolved)
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id), err)]
    async fn update(&self, entry: &DeadLetterEntry) -> ResilienceResult<()> {
        let (resolved_reason, resolved_at) = resolution(&entry.status);
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET error = $2,
                attempts = $3,
                last_attempt_at = $4,
                resolved_reason = $5,
                resolved_at = $6,
                replay_attempts = $7,
                last_replay_error = $8
            WHERE id = $1
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(&entry.error)
        .bind(entry.attempts as i32)
        .bind(entry.last_attempt_at)
        .bind(resolved_reason)
        .bind(resolved_at)
        .bind(entry.replay_attempts as i32)
        .bind(&entry.last_replay_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(ResilienceError::not_found(format!("dead letter entry {}", entry.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn remove(&self, id: EntryId) -> ResilienceResult<bool> {
        let result = sqlx::query("DELETE FROM dead_letter_entries WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_dead_letter", e))?;

        Ok(result.rows_affected() == 1)
    }
}
