//! Broadcast repository

use crate::db::DatabasePool;
use crate::models::{
    AudienceSettings, Broadcast, BroadcastCounters, BroadcastStatus, CreateBroadcast,
    CreateVariation, ScheduleSettings, TestSettings, UpdateBroadcast, Variation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailcast_common::types::{BroadcastId, VariationId, WorkspaceId};
use mailcast_common::{Error, Result};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

/// Exclusive right to run one dispatch cycle for a broadcast.
///
/// For PostgreSQL the lease wraps an open transaction holding a
/// transaction-scoped advisory lock; dropping the lease rolls the
/// transaction back, which releases the lock.
pub struct CycleLease {
    _tx: Option<Transaction<'static, Postgres>>,
}

impl CycleLease {
    /// Lease with no cross-process component
    pub fn local() -> Self {
        Self { _tx: None }
    }
}

/// Broadcast repository trait
#[async_trait]
pub trait BroadcastRepository: Send + Sync {
    async fn create(&self, input: CreateBroadcast) -> Result<Broadcast>;
    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>>;
    async fn get_in_workspace(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
    ) -> Result<Option<Broadcast>>;
    async fn list(
        &self,
        workspace_id: WorkspaceId,
        status: Option<BroadcastStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>>;
    async fn count(&self, workspace_id: WorkspaceId, status: Option<BroadcastStatus>)
        -> Result<i64>;
    /// Every broadcast in a status, across workspaces
    async fn list_by_status(&self, status: BroadcastStatus) -> Result<Vec<Broadcast>>;
    /// Replace settings of a draft broadcast; `None` when missing or not a draft
    async fn update(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
        input: UpdateBroadcast,
    ) -> Result<Option<Broadcast>>;
    /// Delete a draft broadcast
    async fn delete(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<bool>;
    /// Compare-and-set the status, stamping the timestamp of the target
    /// state. `None` when the stored status is no longer `from`.
    async fn transition(
        &self,
        id: BroadcastId,
        from: BroadcastStatus,
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Broadcast>>;
    /// Record the snapshot size and, if unset, the test phase start
    async fn set_audience_total(
        &self,
        id: BroadcastId,
        total: i64,
        test_phase_started_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn set_cursor(&self, id: BroadcastId, cursor: i64) -> Result<()>;
    /// Set the winning variation unless one is already recorded
    async fn set_winner(
        &self,
        id: BroadcastId,
        variation_id: VariationId,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn release_winner(&self, id: BroadcastId) -> Result<bool>;
    async fn mark_winner_sent(&self, id: BroadcastId, at: DateTime<Utc>) -> Result<()>;
    async fn set_counters(&self, id: BroadcastId, counters: BroadcastCounters) -> Result<()>;
    async fn record_error(&self, id: BroadcastId, message: &str) -> Result<()>;
    /// Try to take the cross-process cycle lease
    async fn try_lease_cycle(&self, id: BroadcastId) -> Result<Option<CycleLease>>;
}

/// Build variation models for a new or replaced variation set
pub fn build_variations(
    broadcast_id: BroadcastId,
    inputs: Vec<CreateVariation>,
    now: DateTime<Utc>,
) -> Vec<Variation> {
    inputs
        .into_iter()
        .enumerate()
        .map(|(position, input)| Variation {
            id: Uuid::now_v7(),
            broadcast_id,
            position: position as i32,
            name: input.name,
            template_id: input.template_id,
            template_version: input.template_version,
            subject: input.subject,
            from_name: input.from_name,
            from_email: input.from_email,
            reply_to: input.reply_to,
            created_at: now,
        })
        .collect()
}

#[derive(FromRow)]
struct BroadcastRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    status: String,
    audience: Json<AudienceSettings>,
    schedule: Json<ScheduleSettings>,
    test_settings: Json<TestSettings>,
    total_recipients: i64,
    sent_count: i64,
    delivered_count: i64,
    failed_count: i64,
    recipient_cursor: i64,
    winning_variation: Option<Uuid>,
    winner_selected_at: Option<DateTime<Utc>>,
    winner_released: bool,
    winner_sent_at: Option<DateTime<Utc>>,
    test_phase_started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BroadcastRow {
    fn into_model(self, variations: Vec<Variation>) -> Result<Broadcast> {
        let status = self
            .status
            .parse::<BroadcastStatus>()
            .map_err(Error::Database)?;

        Ok(Broadcast {
            id: self.id,
            workspace_id: self.workspace_id,
            name: self.name,
            status,
            audience: self.audience.0,
            schedule: self.schedule.0,
            test_settings: self.test_settings.0,
            variations,
            total_recipients: self.total_recipients,
            sent_count: self.sent_count,
            delivered_count: self.delivered_count,
            failed_count: self.failed_count,
            recipient_cursor: self.recipient_cursor,
            winning_variation: self.winning_variation,
            winner_selected_at: self.winner_selected_at,
            winner_released: self.winner_released,
            winner_sent_at: self.winner_sent_at,
            test_phase_started_at: self.test_phase_started_at,
            last_error: self.last_error,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            paused_at: self.paused_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            failed_at: self.failed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct VariationRow {
    id: Uuid,
    broadcast_id: Uuid,
    position: i32,
    name: String,
    template_id: Uuid,
    template_version: i32,
    subject: String,
    from_name: Option<String>,
    from_email: String,
    reply_to: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<VariationRow> for Variation {
    fn from(row: VariationRow) -> Self {
        Variation {
            id: row.id,
            broadcast_id: row.broadcast_id,
            position: row.position,
            name: row.name,
            template_id: row.template_id,
            template_version: row.template_version,
            subject: row.subject,
            from_name: row.from_name,
            from_email: row.from_email,
            reply_to: row.reply_to,
            created_at: row.created_at,
        }
    }
}

/// Database broadcast repository
pub struct DbBroadcastRepository {
    pool: DatabasePool,
}

impl DbBroadcastRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn attach_variations(&self, rows: Vec<BroadcastRow>) -> Result<Vec<Broadcast>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let variation_rows = sqlx::query_as::<_, VariationRow>(
            "SELECT * FROM broadcast_variations WHERE broadcast_id = ANY($1) ORDER BY position ASC",
        )
        .bind(&ids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut by_broadcast: HashMap<Uuid, Vec<Variation>> = HashMap::new();
        for row in variation_rows {
            by_broadcast
                .entry(row.broadcast_id)
                .or_default()
                .push(row.into());
        }

        rows.into_iter()
            .map(|row| {
                let variations = by_broadcast.remove(&row.id).unwrap_or_default();
                row.into_model(variations)
            })
            .collect()
    }

    async fn insert_variations(
        tx: &mut Transaction<'_, Postgres>,
        variations: &[Variation],
    ) -> Result<()> {
        for v in variations {
            sqlx::query(
                r#"
                INSERT INTO broadcast_variations (
                    id, broadcast_id, position, name, template_id, template_version,
                    subject, from_name, from_email, reply_to, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(v.id)
            .bind(v.broadcast_id)
            .bind(v.position)
            .bind(&v.name)
            .bind(v.template_id)
            .bind(v.template_version)
            .bind(&v.subject)
            .bind(&v.from_name)
            .bind(&v.from_email)
            .bind(&v.reply_to)
            .bind(v.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }
        Ok(())
    }

    async fn execute(&self, query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>) -> Result<u64> {
        query
            .execute(self.pool.pool())
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl BroadcastRepository for DbBroadcastRepository {
    async fn create(&self, input: CreateBroadcast) -> Result<Broadcast> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let variations = build_variations(id, input.variations, now);

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO broadcasts (
                id, workspace_id, name, status, audience, schedule, test_settings,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7, $7)
            "#,
        )
        .bind(id)
        .bind(input.workspace_id)
        .bind(&input.name)
        .bind(Json(&input.audience))
        .bind(Json(&input.schedule))
        .bind(Json(&input.test_settings))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Self::insert_variations(&mut tx, &variations).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::Internal("Failed to create broadcast".to_string()))
    }

    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>> {
        let row = sqlx::query_as::<_, BroadcastRow>("SELECT * FROM broadcasts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(row) => Ok(self.attach_variations(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn get_in_workspace(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
    ) -> Result<Option<Broadcast>> {
        let row = sqlx::query_as::<_, BroadcastRow>(
            "SELECT * FROM broadcasts WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(row) => Ok(self.attach_variations(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        workspace_id: WorkspaceId,
        status: Option<BroadcastStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>> {
        let rows = sqlx::query_as::<_, BroadcastRow>(
            r#"
            SELECT * FROM broadcasts
            WHERE workspace_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(workspace_id)
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        self.attach_variations(rows).await
    }

    async fn count(
        &self,
        workspace_id: WorkspaceId,
        status: Option<BroadcastStatus>,
    ) -> Result<i64> {
        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM broadcasts WHERE workspace_id = $1 AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(workspace_id)
        .bind(status.map(|s| s.to_string()))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.0)
    }

    async fn list_by_status(&self, status: BroadcastStatus) -> Result<Vec<Broadcast>> {
        let rows = sqlx::query_as::<_, BroadcastRow>(
            "SELECT * FROM broadcasts WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        self.attach_variations(rows).await
    }

    async fn update(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
        input: UpdateBroadcast,
    ) -> Result<Option<Broadcast>> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE broadcasts SET
                name = COALESCE($3, name),
                audience = COALESCE($4, audience),
                schedule = COALESCE($5, schedule),
                test_settings = COALESCE($6, test_settings),
                updated_at = $7
            WHERE id = $1 AND workspace_id = $2 AND status = 'draft'
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .bind(&input.name)
        .bind(input.audience.as_ref().map(Json))
        .bind(input.schedule.as_ref().map(Json))
        .bind(input.test_settings.as_ref().map(Json))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        if let Some(inputs) = input.variations {
            sqlx::query("DELETE FROM broadcast_variations WHERE broadcast_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            let variations = build_variations(id, inputs, now);
            Self::insert_variations(&mut tx, &variations).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        self.get(id).await
    }

    async fn delete(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<bool> {
        let deleted = self
            .execute(
                sqlx::query(
                    "DELETE FROM broadcasts WHERE id = $1 AND workspace_id = $2 AND status = 'draft'",
                )
                .bind(id)
                .bind(workspace_id),
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn transition(
        &self,
        id: BroadcastId,
        from: BroadcastStatus,
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Broadcast>> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE broadcasts SET
                        status = $3,
                        scheduled_at = CASE WHEN $3 = 'scheduled' THEN $4 ELSE scheduled_at END,
                        started_at = CASE WHEN $3 = 'sending' THEN COALESCE(started_at, $4) ELSE started_at END,
                        paused_at = CASE WHEN $3 = 'paused' THEN $4 ELSE paused_at END,
                        completed_at = CASE WHEN $3 = 'sent' THEN $4 ELSE completed_at END,
                        cancelled_at = CASE WHEN $3 = 'cancelled' THEN $4 ELSE cancelled_at END,
                        failed_at = CASE WHEN $3 = 'failed' THEN $4 ELSE failed_at END,
                        updated_at = $4
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(id)
                .bind(from.to_string())
                .bind(to.to_string())
                .bind(at),
            )
            .await?;

        if updated == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn set_audience_total(
        &self,
        id: BroadcastId,
        total: i64,
        test_phase_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE broadcasts SET
                    total_recipients = $2,
                    test_phase_started_at = COALESCE(test_phase_started_at, $3),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(total)
            .bind(test_phase_started_at),
        )
        .await?;
        Ok(())
    }

    async fn set_cursor(&self, id: BroadcastId, cursor: i64) -> Result<()> {
        self.execute(
            sqlx::query(
                "UPDATE broadcasts SET recipient_cursor = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(cursor),
        )
        .await?;
        Ok(())
    }

    async fn set_winner(
        &self,
        id: BroadcastId,
        variation_id: VariationId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE broadcasts SET
                        winning_variation = $2,
                        winner_selected_at = $3,
                        updated_at = $3
                    WHERE id = $1 AND winning_variation IS NULL
                    "#,
                )
                .bind(id)
                .bind(variation_id)
                .bind(at),
            )
            .await?;
        Ok(updated > 0)
    }

    async fn release_winner(&self, id: BroadcastId) -> Result<bool> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE broadcasts SET winner_released = TRUE, updated_at = NOW()
                    WHERE id = $1 AND winning_variation IS NOT NULL AND winner_released = FALSE
                    "#,
                )
                .bind(id),
            )
            .await?;
        Ok(updated > 0)
    }

    async fn mark_winner_sent(&self, id: BroadcastId, at: DateTime<Utc>) -> Result<()> {
        self.execute(
            sqlx::query(
                "UPDATE broadcasts SET winner_sent_at = COALESCE(winner_sent_at, $2) WHERE id = $1",
            )
            .bind(id)
            .bind(at),
        )
        .await?;
        Ok(())
    }

    async fn set_counters(&self, id: BroadcastId, counters: BroadcastCounters) -> Result<()> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE broadcasts SET
                    sent_count = $2,
                    delivered_count = $3,
                    failed_count = $4,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(counters.sent)
            .bind(counters.delivered)
            .bind(counters.failed),
        )
        .await?;
        Ok(())
    }

    async fn record_error(&self, id: BroadcastId, message: &str) -> Result<()> {
        self.execute(
            sqlx::query("UPDATE broadcasts SET last_error = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(message),
        )
        .await?;
        Ok(())
    }

    async fn try_lease_cycle(&self, id: BroadcastId) -> Result<Option<CycleLease>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let (acquired,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtextextended($1::TEXT, 0))")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        if acquired {
            Ok(Some(CycleLease { _tx: Some(tx) }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_variations_keeps_creation_order() {
        let broadcast_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        let inputs = ["A", "B", "C"]
            .iter()
            .map(|name| CreateVariation {
                name: name.to_string(),
                template_id,
                template_version: 1,
                subject: format!("Subject {}", name),
                from_name: None,
                from_email: "news@example.com".into(),
                reply_to: None,
            })
            .collect();

        let variations = build_variations(broadcast_id, inputs, Utc::now());
        let positions: Vec<i32> = variations.iter().map(|v| v.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert!(variations.iter().all(|v| v.broadcast_id == broadcast_id));
        assert_eq!(variations[1].name, "B");
    }
}
