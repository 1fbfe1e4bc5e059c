//! Append-only log of notification attempts.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::NotificationLogEntry;

use crate::{RepositoryError, text};

#[async_trait]
pub trait NotificationLogRepository: Send + Sync {
    async fn insert(&self, entry: &NotificationLogEntry) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the NotificationLogRepository trait.
pub struct PgNotificationLogRepository {
    pool: Pool,
}

impl PgNotificationLogRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationLogRepository for PgNotificationLogRepository {
    async fn insert(&self, entry: &NotificationLogEntry) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO notification_log (id, order_id, kind, recipient, outcome, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#;
        let client = self.pool.get().await?;
        client.execute(query, &[
            &entry.id,
            &entry.order_id,
            &entry.kind,
            &entry.recipient,
            &text(&entry.outcome),
            &entry.error,
            &entry.created_at,
        ]).await?;
        Ok(())
    }
}
