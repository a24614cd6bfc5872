//! Repository for the live delivery queue table.
//!
//! Owns every state transition that must survive a crash: enqueue, the
//! atomic claim, completion, retry rescheduling, retention cleanup, and
//! the stuck-delivery reset that is the sole crash-recovery mechanism.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryStatus, QueueCounts},
};

const DELIVERY_COLUMNS: &str = "id, subscription_id, webhook_id, event_data, payload, status, \
                                attempts, max_attempts, next_retry, last_attempt, \
                                response_status, response_time, error_message, created_at, \
                                completed_at";

/// Repository for delivery database operations.
#[derive(Clone)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a delivery in its initial state.
    ///
    /// The insert always writes `status = 'pending'`, `attempts = 0`, and
    /// `next_retry = NULL` regardless of what the caller put in the struct,
    /// so a replayed or hand-built delivery cannot skip the queue.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or constraints are violated.
    pub async fn create(&self, delivery: &Delivery) -> Result<DeliveryId> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO deliveries (
                id, subscription_id, webhook_id, event_data, payload,
                status, attempts, max_attempts, next_retry, created_at
            ) VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NULL, $7)
            RETURNING id
            "#,
        )
        .bind(delivery.id.0)
        .bind(delivery.subscription_id.0)
        .bind(delivery.webhook_id.0)
        .bind(&delivery.event)
        .bind(&delivery.payload)
        .bind(delivery.max_attempts)
        .bind(delivery.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(DeliveryId(id))
    }

    /// Atomically claims the oldest eligible delivery.
    ///
    /// Selects the oldest `pending` row whose `next_retry` is null or due,
    /// flips it to `processing`, and stamps `last_attempt`, all inside one
    /// transaction with `FOR UPDATE SKIP LOCKED`, so two concurrent callers
    /// can never claim the same row. Returns `None` when nothing is
    /// eligible.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM deliveries
            WHERE status = 'pending'
              AND (next_retry IS NULL OR next_retry <= $1)
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            UPDATE deliveries
            SET status = 'processing', last_attempt = $1
            WHERE id = $2
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(delivery))
    }

    /// Updates a delivery's status.
    ///
    /// Stamps `completed_at` when the new status is `Completed` and records
    /// the error message when one is provided.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = $1,
                completed_at = CASE WHEN $1 = 'completed' THEN NOW() ELSE completed_at END,
                error_message = COALESCE($2, error_message)
            WHERE id = $3
            "#,
        )
        .bind(status.to_string())
        .bind(error)
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Reschedules a delivery for a future retry.
    ///
    /// Returns the row to `pending` with the given absolute attempt count
    /// (not a delta) and next-retry time, making it eligible for the claim
    /// pool once `next_retry` passes.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_retry_schedule(
        &self,
        id: DeliveryId,
        next_retry: DateTime<Utc>,
        attempts: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'pending', next_retry = $1, attempts = $2
            WHERE id = $3
            "#,
        )
        .bind(next_retry)
        .bind(attempts)
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records the response details of the most recent attempt.
    ///
    /// Informational bookkeeping only; does not affect the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_response(
        &self,
        id: DeliveryId,
        response_status: Option<i32>,
        response_time_ms: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET response_status = $1, response_time = $2
            WHERE id = $3
            "#,
        )
        .bind(response_status)
        .bind(response_time_ms)
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns delivery counts grouped by status.
    ///
    /// Statuses with no rows default to zero.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn counts_by_status(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM deliveries
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {},
            }
        }

        Ok(counts)
    }

    /// Deletes completed deliveries older than the cutoff.
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM deliveries
            WHERE status = 'completed' AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds deliveries stuck in `processing` past the staleness threshold.
    ///
    /// A row whose `last_attempt` predates `now - threshold` was claimed by
    /// a worker that never reported back, presumed crashed.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_stuck(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Result<Vec<Delivery>> {
        let deliveries = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM deliveries
            WHERE status = 'processing' AND last_attempt < $1
            ORDER BY last_attempt ASC
            "#
        ))
        .bind(now - threshold)
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Returns stuck deliveries to the claim pool.
    ///
    /// Flips orphaned `processing` rows back to `pending` with
    /// `next_retry = NULL` so they are immediately eligible. Returns the
    /// number of rows reset. This is the sole crash-recovery mechanism.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reset_stuck(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'pending', next_retry = NULL
            WHERE status = 'processing' AND last_attempt < $1
            "#,
        )
        .bind(now - threshold)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a delivery by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM deliveries
            WHERE id = $1
            "#
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
