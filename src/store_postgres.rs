#![cfg(feature = "postgres")]

use async_trait::async_trait;
use tokio_postgres::row::Row;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::store::{CancelOutcome, EventStore, InsertOutcome};
use crate::types::{
    DeliveryStatus, EventId, IdempotencyKey, Lifecycle, NewEvent, TransactionId, WebhookEvent,
};

const COLUMNS: &str = "id, idempotency_key, event_type, payload, transaction_id, status, \
     retry_count, max_retries, next_retry_at, delivered_at, last_error, \
     created_at, updated_at, is_deleted";

/// Postgres-backed event store.
///
/// The claim is a plain conditional UPDATE; zero affected rows means a
/// lost race. The partial unique index on `idempotency_key` enforces
/// the one-live-row invariant at the storage layer, so concurrent
/// double-admission degrades to `InsertOutcome::Conflict`.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_events (
                    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    idempotency_key TEXT NOT NULL CHECK (length(idempotency_key) > 0),
                    event_type TEXT NOT NULL CHECK (length(event_type) > 0),
                    payload BYTEA NOT NULL CHECK (length(payload) > 0),
                    transaction_id TEXT,
                    status TEXT NOT NULL CHECK (
                        status IN ('PENDING', 'PROCESSING', 'DELIVERED', 'FAILED', 'CANCELLED')
                    ),
                    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                    max_retries INTEGER NOT NULL DEFAULT 5 CHECK (max_retries BETWEEN 1 AND 10),
                    next_retry_at BIGINT,
                    delivered_at BIGINT,
                    last_error TEXT,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    is_deleted BOOLEAN NOT NULL DEFAULT FALSE
                );
                CREATE UNIQUE INDEX IF NOT EXISTS webhook_events_live_key
                    ON webhook_events (idempotency_key) WHERE NOT is_deleted;
                CREATE INDEX IF NOT EXISTS webhook_events_due
                    ON webhook_events (status, next_retry_at) WHERE NOT is_deleted;
                CREATE INDEX IF NOT EXISTS webhook_events_transaction
                    ON webhook_events (transaction_id, created_at);
                CREATE INDEX IF NOT EXISTS webhook_events_event_type
                    ON webhook_events (event_type, created_at);",
            )
            .await
            .map_err(backend)?;

        Ok(Self { client })
    }
}

fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn event_from_row(row: &Row) -> Result<WebhookEvent, StoreError> {
    let status_text: String = row.try_get("status").map_err(backend)?;
    let status = DeliveryStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Backend(format!("unknown status {status_text:?}")))?;

    Ok(WebhookEvent {
        id: EventId(row.try_get::<_, i64>("id").map_err(backend)?),
        idempotency_key: IdempotencyKey(row.try_get("idempotency_key").map_err(backend)?),
        event_type: row.try_get("event_type").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        transaction_id: row
            .try_get::<_, Option<String>>("transaction_id")
            .map_err(backend)?
            .map(TransactionId),
        status,
        retry_count: row.try_get::<_, i32>("retry_count").map_err(backend)? as u32,
        max_retries: row.try_get::<_, i32>("max_retries").map_err(backend)? as u32,
        next_retry_at: row
            .try_get::<_, Option<i64>>("next_retry_at")
            .map_err(backend)?
            .map(|v| v as u64),
        delivered_at: row
            .try_get::<_, Option<i64>>("delivered_at")
            .map_err(backend)?
            .map(|v| v as u64),
        last_error: row.try_get("last_error").map_err(backend)?,
        created_at: row.try_get::<_, i64>("created_at").map_err(backend)? as u64,
        updated_at: row.try_get::<_, i64>("updated_at").map_err(backend)? as u64,
        lifecycle: if row.try_get::<_, bool>("is_deleted").map_err(backend)? {
            Lifecycle::Deleted
        } else {
            Lifecycle::Active
        },
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert(&self, new: NewEvent, now_ms: u64) -> Result<InsertOutcome, StoreError> {
        let now = now_ms as i64;
        let tx = new.transaction_id.as_ref().map(|t| t.0.as_str());
        let inserted = self
            .client
            .query_opt(
                &format!(
                    "INSERT INTO webhook_events
                         (idempotency_key, event_type, payload, transaction_id, status,
                          retry_count, max_retries, next_retry_at, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, 'PENDING', 0, $5, $6, $6, $6)
                     ON CONFLICT (idempotency_key) WHERE NOT is_deleted DO NOTHING
                     RETURNING {COLUMNS}"
                ),
                &[
                    &new.idempotency_key.as_str(),
                    &new.event_type,
                    &new.payload,
                    &tx,
                    &(new.max_retries as i32),
                    &now,
                ],
            )
            .await
            .map_err(backend)?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(event_from_row(&row)?));
        }

        // Lost an admission race; the winning row must exist.
        match self.find_by_key(&new.idempotency_key).await? {
            Some(existing) => Ok(InsertOutcome::Conflict(existing)),
            None => Err(StoreError::Backend(format!(
                "conflicting insert for key {:?} but no live row",
                new.idempotency_key.as_str()
            ))),
        }
    }

    async fn get(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM webhook_events WHERE id = $1"),
                &[&id.0],
            )
            .await
            .map_err(backend)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events
                     WHERE idempotency_key = $1 AND NOT is_deleted"
                ),
                &[&key.as_str()],
            )
            .await
            .map_err(backend)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn due_events(
        &self,
        now_ms: u64,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events
                     WHERE NOT is_deleted
                       AND status IN ('PENDING', 'FAILED')
                       AND retry_count < max_retries
                       AND next_retry_at IS NOT NULL
                       AND next_retry_at <= $1
                     ORDER BY next_retry_at ASC, created_at ASC
                     LIMIT $2"
                ),
                &[&(now_ms as i64), &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn claim(&self, id: EventId, now_ms: u64) -> Result<Option<WebhookEvent>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "UPDATE webhook_events
                     SET status = 'PROCESSING', next_retry_at = NULL, updated_at = $2
                     WHERE id = $1
                       AND NOT is_deleted
                       AND status IN ('PENDING', 'FAILED')
                       AND retry_count < max_retries
                     RETURNING {COLUMNS}"
                ),
                &[&id.0, &(now_ms as i64)],
            )
            .await
            .map_err(backend)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn mark_delivered(&self, id: EventId, now_ms: u64) -> Result<WebhookEvent, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "UPDATE webhook_events
                     SET status = 'DELIVERED', delivered_at = $2,
                         next_retry_at = NULL, updated_at = $2
                     WHERE id = $1 AND status = 'PROCESSING'
                     RETURNING {COLUMNS}"
                ),
                &[&id.0, &(now_ms as i64)],
            )
            .await
            .map_err(backend)?;

        match row {
            Some(row) => event_from_row(&row),
            None => match self.get(id).await? {
                Some(current) => Err(StoreError::IllegalTransition {
                    id,
                    from: current.status,
                    to: DeliveryStatus::Delivered,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn record_failure(
        &self,
        id: EventId,
        error: &str,
        next_retry_at: Option<u64>,
        now_ms: u64,
    ) -> Result<WebhookEvent, StoreError> {
        let to = if next_retry_at.is_some() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::Failed
        };
        let row = self
            .client
            .query_opt(
                &format!(
                    "UPDATE webhook_events
                     SET status = $2, retry_count = retry_count + 1,
                         next_retry_at = $3, last_error = $4, updated_at = $5
                     WHERE id = $1 AND status = 'PROCESSING'
                     RETURNING {COLUMNS}"
                ),
                &[
                    &id.0,
                    &to.as_str(),
                    &next_retry_at.map(|v| v as i64),
                    &error,
                    &(now_ms as i64),
                ],
            )
            .await
            .map_err(backend)?;

        match row {
            Some(row) => event_from_row(&row),
            None => match self.get(id).await? {
                Some(current) => Err(StoreError::IllegalTransition {
                    id,
                    from: current.status,
                    to,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn cancel(&self, id: EventId, now_ms: u64) -> Result<CancelOutcome, StoreError> {
        let affected = self
            .client
            .execute(
                "UPDATE webhook_events
                 SET status = 'CANCELLED', next_retry_at = NULL, updated_at = $2
                 WHERE id = $1 AND status IN ('PENDING', 'FAILED')",
                &[&id.0, &(now_ms as i64)],
            )
            .await
            .map_err(backend)?;

        if affected == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        match self.get(id).await? {
            Some(current) => match current.status {
                DeliveryStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
                DeliveryStatus::Processing => Ok(CancelOutcome::InFlight),
                from => Err(StoreError::IllegalTransition {
                    id,
                    from,
                    to: DeliveryStatus::Cancelled,
                }),
            },
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn redrive_failed(&self, limit: usize, now_ms: u64) -> Result<u64, StoreError> {
        self.client
            .execute(
                "UPDATE webhook_events
                 SET retry_count = 0, next_retry_at = $2, updated_at = $2
                 WHERE id IN (
                     SELECT id FROM webhook_events
                     WHERE NOT is_deleted AND status = 'FAILED'
                     ORDER BY created_at ASC
                     LIMIT $1
                 )",
                &[&(limit as i64), &(now_ms as i64)],
            )
            .await
            .map_err(backend)
    }

    async fn clear_transaction_refs(
        &self,
        tx: &TransactionId,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        self.client
            .execute(
                "UPDATE webhook_events
                 SET transaction_id = NULL, updated_at = $2
                 WHERE transaction_id = $1",
                &[&tx.as_str(), &(now_ms as i64)],
            )
            .await
            .map_err(backend)
    }

    async fn referenced_transactions(&self) -> Result<Vec<TransactionId>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT transaction_id FROM webhook_events
                 WHERE NOT is_deleted AND transaction_id IS NOT NULL
                 ORDER BY transaction_id",
                &[],
            )
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map(TransactionId)
                    .map_err(backend)
            })
            .collect()
    }

    async fn sweep(&self, cutoff_ms: u64, now_ms: u64) -> Result<u64, StoreError> {
        self.client
            .execute(
                "UPDATE webhook_events
                 SET is_deleted = TRUE, updated_at = $2
                 WHERE NOT is_deleted
                   AND status IN ('DELIVERED', 'FAILED', 'CANCELLED')
                   AND COALESCE(
                         CASE WHEN status = 'DELIVERED' THEN delivered_at END,
                         updated_at
                       ) < $1",
                &[&(cutoff_ms as i64), &(now_ms as i64)],
            )
            .await
            .map_err(backend)
    }

    async fn purge(&self, cutoff_ms: u64) -> Result<u64, StoreError> {
        self.client
            .execute(
                "DELETE FROM webhook_events WHERE is_deleted AND updated_at < $1",
                &[&(cutoff_ms as i64)],
            )
            .await
            .map_err(backend)
    }

    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events
                     WHERE status = $1 AND (NOT is_deleted OR $2)
                     ORDER BY created_at ASC, id ASC
                     LIMIT $3"
                ),
                &[&status.as_str(), &include_deleted, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn list_by_transaction(
        &self,
        tx: &TransactionId,
        include_deleted: bool,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events
                     WHERE transaction_id = $1 AND (NOT is_deleted OR $2)
                     ORDER BY created_at DESC, id DESC"
                ),
                &[&tx.as_str(), &include_deleted],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn list_by_event_type(
        &self,
        event_type: &str,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events
                     WHERE event_type = $1 AND (NOT is_deleted OR $2)
                     ORDER BY created_at DESC, id DESC
                     LIMIT $3"
                ),
                &[&event_type, &include_deleted, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn count_by_status(&self, status: DeliveryStatus) -> Result<u64, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM webhook_events
                 WHERE NOT is_deleted AND status = $1",
                &[&status.as_str()],
            )
            .await
            .map_err(backend)?;
        Ok(row.try_get::<_, i64>(0).map_err(backend)? as u64)
    }

    async fn stalled_processing(
        &self,
        older_than_ms: u64,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events
                     WHERE NOT is_deleted AND status = 'PROCESSING' AND updated_at < $1
                     ORDER BY updated_at ASC, id ASC"
                ),
                &[&(older_than_ms as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(event_from_row).collect()
    }
}
