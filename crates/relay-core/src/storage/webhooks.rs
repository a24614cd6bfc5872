//! Read-only access to the webhook configuration table.
//!
//! The configuration store is owned by an external collaborator; this
//! repository only reads active rows and applies the defensive parsing
//! from the models module so a malformed row degrades to safe defaults
//! instead of failing delivery.

use std::sync::Arc;

use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{parse_header_map, WebhookConfig, WebhookFormat, WebhookId},
};

/// Raw row shape before defensive parsing.
#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: WebhookId,
    url: String,
    format: String,
    headers: Json<serde_json::Value>,
    timeout_seconds: i32,
    retry_attempts: i32,
}

impl WebhookRow {
    fn into_config(self) -> WebhookConfig {
        WebhookConfig {
            id: self.id,
            url: self.url,
            format: WebhookFormat::normalize(&self.format),
            headers: parse_header_map(&self.headers.0),
            timeout_seconds: self.timeout_seconds,
            retry_attempts: self.retry_attempts,
        }
    }
}

/// Repository for webhook configuration reads.
#[derive(Clone)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds an active webhook config by id.
    ///
    /// Inactive and missing rows both return `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active(&self, id: WebhookId) -> Result<Option<WebhookConfig>> {
        let row = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, url, format, headers, timeout_seconds, retry_attempts
            FROM webhooks
            WHERE id = $1 AND active = TRUE
            "#,
        )
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(WebhookRow::into_config))
    }

    /// Returns all active webhook configs.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_all_active(&self) -> Result<Vec<WebhookConfig>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, url, format, headers, timeout_seconds, retry_attempts
            FROM webhooks
            WHERE active = TRUE
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(WebhookRow::into_config).collect())
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
