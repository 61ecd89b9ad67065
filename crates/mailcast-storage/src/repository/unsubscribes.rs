//! Unsubscribe repository

use crate::db::DatabasePool;
use crate::models::CreateUnsubscribe;
use async_trait::async_trait;
use mailcast_common::types::{normalize_email, WorkspaceId};
use mailcast_common::{Error, Result};
use std::collections::HashSet;
use uuid::Uuid;

/// Unsubscribe repository trait
#[async_trait]
pub trait UnsubscribeRepository: Send + Sync {
    /// Record an unsubscribe; repeating it for the same address is a no-op
    async fn create(&self, input: CreateUnsubscribe) -> Result<()>;
    async fn is_unsubscribed(&self, workspace_id: WorkspaceId, email: &str) -> Result<bool>;
    /// Normalized addresses of every unsubscribed contact in the workspace
    async fn unsubscribed_emails(&self, workspace_id: WorkspaceId) -> Result<HashSet<String>>;
}

/// Database unsubscribe repository
pub struct DbUnsubscribeRepository {
    pool: DatabasePool,
}

impl DbUnsubscribeRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnsubscribeRepository for DbUnsubscribeRepository {
    async fn create(&self, input: CreateUnsubscribe) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO unsubscribes (id, workspace_id, email, source, broadcast_id, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workspace_id, email) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.workspace_id)
        .bind(normalize_email(&input.email))
        .bind(input.source.to_string())
        .bind(input.broadcast_id)
        .bind(&input.reason)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn is_unsubscribed(&self, workspace_id: WorkspaceId, email: &str) -> Result<bool> {
        let result: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM unsubscribes WHERE workspace_id = $1 AND email = $2)",
        )
        .bind(workspace_id)
        .bind(normalize_email(email))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.0)
    }

    async fn unsubscribed_emails(&self, workspace_id: WorkspaceId) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT email FROM unsubscribes WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(email,)| email).collect())
    }
}
