//! Repository for the dead letter archive.
//!
//! Entries are written once when a delivery exhausts its retries and are
//! never mutated afterwards. The table is independent from `deliveries`
//! so aggressive pruning of the live queue never loses forensic history.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeadLetterEntry, DeadLetterFilter, DeadLetterStats, DeliveryId},
};

const ENTRY_COLUMNS: &str = "id, subscription_id, webhook_id, event_data, payload, \
                             failure_reason, failed_at, attempts, last_error";

const DEFAULT_FILTER_LIMIT: i64 = 100;

/// Repository for dead letter queue operations.
#[derive(Clone)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Archives a permanently failed delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, including when an entry for the
    /// same delivery id already exists.
    pub async fn create(&self, entry: &DeadLetterEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (
                id, subscription_id, webhook_id, event_data, payload,
                failure_reason, failed_at, attempts, last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.subscription_id.0)
        .bind(entry.webhook_id.0)
        .bind(&entry.event)
        .bind(&entry.payload)
        .bind(&entry.failure_reason)
        .bind(entry.failed_at)
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds archived entries matching the filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM dead_letter_queue
            WHERE ($1::uuid IS NULL OR webhook_id = $1)
              AND ($2::uuid IS NULL OR subscription_id = $2)
            ORDER BY failed_at DESC
            LIMIT $3
            "#
        ))
        .bind(filter.webhook_id.map(|id| id.0))
        .bind(filter.subscription_id.map(|id| id.0))
        .bind(filter.limit.unwrap_or(DEFAULT_FILTER_LIMIT))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Removes a single archived entry.
    ///
    /// Returns whether an entry was actually deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: DeliveryId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM dead_letter_queue
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes entries archived before the cutoff, returning the count.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM dead_letter_queue
            WHERE failed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Aggregates archive statistics for operator dashboards.
    ///
    /// Returns total entries, recent-window counts, and the top-N failure
    /// reasons by frequency.
    ///
    /// # Errors
    ///
    /// Returns error if any query fails.
    pub async fn stats(&self, now: DateTime<Utc>, top_n: i64) -> Result<DeadLetterStats> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(&*self.pool)
            .await?;

        let last_24h: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue WHERE failed_at >= $1")
                .bind(now - Duration::hours(24))
                .fetch_one(&*self.pool)
                .await?;

        let last_7d: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue WHERE failed_at >= $1")
                .bind(now - Duration::days(7))
                .fetch_one(&*self.pool)
                .await?;

        let top_reasons: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT failure_reason, COUNT(*) AS freq FROM dead_letter_queue
            GROUP BY failure_reason
            ORDER BY freq DESC
            LIMIT $1
            "#,
        )
        .bind(top_n)
        .fetch_all(&*self.pool)
        .await?;

        Ok(DeadLetterStats {
            total: total.0,
            last_24h: last_24h.0,
            last_7d: last_7d.0,
            top_reasons,
        })
    }
}
