use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use fluxora_core::{ResilienceError, ResilienceResult, TransactionId};

use crate::saga::{SagaLog, SagaLogEvent, SagaLogRecord};

use super::{decode_error, is_unique_violation, map_sqlx_error};

/// Saga outcome log in Postgres.
///
/// One stream per transaction id. Appends check the stream head inside a
/// transaction; the primary key on `(transaction_id, sequence)` catches a
/// concurrent writer that slips in between.
#[derive(Debug, Clone)]
pub struct PostgresSagaLog {
    pool: Arc<PgPool>,
}

impl PostgresSagaLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

async fn stream_head(tx: &mut Transaction<'_, Postgres>, id: TransactionId) -> ResilienceResult<u64> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(sequence), 0) AS head FROM saga_log WHERE transaction_id = $1",
    )
    .bind(id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("saga_stream_head", e))?;

    let head: i64 = row.try_get("head").map_err(|e| decode_error("saga log", e))?;
    Ok(head.max(0) as u64)
}

#[async_trait]
impl SagaLog for PostgresSagaLog {
    #[instrument(
        skip(self, record),
        fields(
            transaction_id = %record.transaction_id,
            sequence = record.sequence,
            kind = record.event.kind()
        ),
        err
    )]
    async fn append(&self, record: SagaLogRecord) -> ResilienceResult<()> {
        let event = serde_json::to_value(&record.event)
            .map_err(|e| ResilienceError::storage(format!("encode saga record: {}", e)))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let head = stream_head(&mut tx, record.transaction_id).await?;
        if record.sequence != head + 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(ResilienceError::invalid_state(format!(
                "saga {} log conflict: expected sequence {}, got {}",
                record.transaction_id,
                head + 1,
                record.sequence
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO saga_log (transaction_id, sequence, recorded_at, kind, event)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.transaction_id.as_uuid())
        .bind(record.sequence as i64)
        .bind(record.recorded_at)
        .bind(record.event.kind())
        .bind(event)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ResilienceError::invalid_state(format!(
                    "saga {} log conflict: sequence {} already exists",
                    record.transaction_id, record.sequence
                ))
            } else {
                map_sqlx_error("insert_saga_record", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id), err)]
    async fn load(&self, transaction_id: TransactionId) -> ResilienceResult<Vec<SagaLogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, recorded_at, event
            FROM saga_log
            WHERE transaction_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(transaction_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_saga_log", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| decode_error("saga log", e);
                let sequence: i64 = row.try_get("sequence").map_err(decode)?;
                let event: serde_json::Value = row.try_get("event").map_err(decode)?;
                let event: SagaLogEvent =
                    serde_json::from_value(event).map_err(|e| decode_error("saga log", e))?;
                Ok(SagaLogRecord {
                    transaction_id,
                    sequence: sequence.max(0) as u64,
                    recorded_at: row.try_get("recorded_at").map_err(decode)?,
                    event,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn in_flight(&self) -> ResilienceResult<Vec<TransactionId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT s.transaction_id
            FROM saga_log s
            WHERE NOT EXISTS (
                SELECT 1 FROM saga_log t
                WHERE t.transaction_id = s.transaction_id
                    AND t.kind IN ('completed', 'aborted')
            )
            ORDER BY s.transaction_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("saga_in_flight", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("transaction_id")
                    .map(TransactionId::from_uuid)
                    .map_err(|e| decode_error("saga log", e))
            })
            .collect()
    }
}
