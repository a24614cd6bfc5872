//! Repository for durable metric samples.
//!
//! The in-memory collector flushes its current aggregates here; a flush
//! is all-or-nothing so a half-written window never reaches the table.

use std::sync::Arc;

use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{error::Result, models::Metric};

/// Repository for metric writes.
#[derive(Clone)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Writes a batch of metric samples inside a single transaction.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; nothing is written in that case.
    pub async fn insert_all(&self, metrics: &[Metric]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for metric in metrics {
            sqlx::query(
                r#"
                INSERT INTO metrics (id, metric_name, metric_type, metric_value, labels, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&metric.name)
            .bind(metric.kind.to_string())
            .bind(metric.value)
            .bind(Json(&metric.labels))
            .bind(metric.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
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
