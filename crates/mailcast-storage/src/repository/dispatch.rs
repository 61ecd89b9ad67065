//! Dispatch state: audience snapshots, deferred recipients and send records

use crate::db::DatabasePool;
use crate::models::{
    AudienceMember, Contact, DeferredRecipient, SendRecord, SendStatus, VariationSendCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailcast_common::types::{normalize_message_id, BroadcastId, VariationId};
use mailcast_common::{Error, Result};
use sqlx::FromRow;
use uuid::Uuid;

/// Dispatch state store
#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Persist the snapshot unless one exists; returns the stored length
    async fn save_snapshot(&self, broadcast_id: BroadcastId, members: Vec<Contact>) -> Result<i64>;
    /// Snapshot length, `None` before the snapshot is taken
    async fn snapshot_len(&self, broadcast_id: BroadcastId) -> Result<Option<i64>>;
    /// Read `limit` snapshot entries starting at position `from`
    async fn snapshot_page(
        &self,
        broadcast_id: BroadcastId,
        from: i64,
        limit: i64,
    ) -> Result<Vec<AudienceMember>>;

    async fn defer(&self, recipient: DeferredRecipient) -> Result<()>;
    /// Deferred recipients whose window has opened, oldest first
    async fn due_deferred(
        &self,
        broadcast_id: BroadcastId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeferredRecipient>>;
    async fn remove_deferred(&self, broadcast_id: BroadcastId, position: i64) -> Result<()>;
    async fn deferred_count(&self, broadcast_id: BroadcastId) -> Result<i64>;

    /// Insert a pending send record; `false` if one already exists
    async fn claim_send(
        &self,
        broadcast_id: BroadcastId,
        variation_id: VariationId,
        recipient_email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Mark a pending record sent. The message id is stored normalized.
    async fn complete_send(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
        attempts: i32,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn fail_send(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
        attempts: i32,
        error: &str,
    ) -> Result<()>;
    async fn get_send_record(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
    ) -> Result<Option<SendRecord>>;
    /// Lookup by message id, bracketed or bare
    async fn find_send_by_message_id(&self, message_id: &str) -> Result<Option<SendRecord>>;
    async fn send_counts(&self, broadcast_id: BroadcastId) -> Result<Vec<VariationSendCounts>>;
}

#[derive(FromRow)]
struct MemberRow {
    position: i64,
    email: String,
    name: Option<String>,
    timezone: Option<String>,
    attributes: serde_json::Value,
}

impl From<MemberRow> for AudienceMember {
    fn from(row: MemberRow) -> Self {
        AudienceMember {
            position: row.position,
            contact: Contact {
                email: row.email,
                name: row.name,
                timezone: row.timezone,
                attributes: row.attributes,
            },
        }
    }
}

#[derive(FromRow)]
struct DeferredRow {
    broadcast_id: Uuid,
    position: i64,
    email: String,
    name: Option<String>,
    timezone: Option<String>,
    attributes: serde_json::Value,
    not_before: DateTime<Utc>,
}

impl From<DeferredRow> for DeferredRecipient {
    fn from(row: DeferredRow) -> Self {
        DeferredRecipient {
            broadcast_id: row.broadcast_id,
            member: AudienceMember {
                position: row.position,
                contact: Contact {
                    email: row.email,
                    name: row.name,
                    timezone: row.timezone,
                    attributes: row.attributes,
                },
            },
            not_before: row.not_before,
        }
    }
}

#[derive(FromRow)]
struct SendRecordRow {
    broadcast_id: Uuid,
    variation_id: Uuid,
    recipient_email: String,
    status: String,
    attempts: i32,
    message_id: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<SendRecordRow> for SendRecord {
    type Error = Error;

    fn try_from(row: SendRecordRow) -> Result<Self> {
        Ok(SendRecord {
            broadcast_id: row.broadcast_id,
            variation_id: row.variation_id,
            recipient_email: row.recipient_email,
            status: row.status.parse::<SendStatus>().map_err(Error::Database)?,
            attempts: row.attempts,
            message_id: row.message_id,
            last_error: row.last_error,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

/// Database dispatch store
pub struct DbDispatchStore {
    pool: DatabasePool,
}

impl DbDispatchStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchStore for DbDispatchStore {
    async fn save_snapshot(&self, broadcast_id: BroadcastId, members: Vec<Contact>) -> Result<i64> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Serialize concurrent snapshot writers for the same broadcast
        sqlx::query("SELECT id FROM broadcasts WHERE id = $1 FOR UPDATE")
            .bind(broadcast_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let (existing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audience_snapshots WHERE broadcast_id = $1")
                .bind(broadcast_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        if existing > 0 {
            return Ok(existing);
        }

        let total = members.len() as i64;
        for (position, contact) in members.into_iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO audience_snapshots (broadcast_id, position, email, name, timezone, attributes)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(broadcast_id)
            .bind(position as i64)
            .bind(&contact.email)
            .bind(&contact.name)
            .bind(&contact.timezone)
            .bind(&contact.attributes)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(total)
    }

    async fn snapshot_len(&self, broadcast_id: BroadcastId) -> Result<Option<i64>> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audience_snapshots WHERE broadcast_id = $1")
                .bind(broadcast_id)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok((count > 0).then_some(count))
    }

    async fn snapshot_page(
        &self,
        broadcast_id: BroadcastId,
        from: i64,
        limit: i64,
    ) -> Result<Vec<AudienceMember>> {
        let rows = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT position, email, name, timezone, attributes
            FROM audience_snapshots
            WHERE broadcast_id = $1 AND position >= $2
            ORDER BY position ASC
            LIMIT $3
            "#,
        )
        .bind(broadcast_id)
        .bind(from)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(AudienceMember::from).collect())
    }

    async fn defer(&self, recipient: DeferredRecipient) -> Result<()> {
        let contact = &recipient.member.contact;
        sqlx::query(
            r#"
            INSERT INTO deferred_recipients (
                broadcast_id, position, email, name, timezone, attributes, not_before
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (broadcast_id, position) DO UPDATE SET not_before = EXCLUDED.not_before
            "#,
        )
        .bind(recipient.broadcast_id)
        .bind(recipient.member.position)
        .bind(&contact.email)
        .bind(&contact.name)
        .bind(&contact.timezone)
        .bind(&contact.attributes)
        .bind(recipient.not_before)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn due_deferred(
        &self,
        broadcast_id: BroadcastId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeferredRecipient>> {
        let rows = sqlx::query_as::<_, DeferredRow>(
            r#"
            SELECT * FROM deferred_recipients
            WHERE broadcast_id = $1 AND not_before <= $2
            ORDER BY not_before ASC, position ASC
            LIMIT $3
            "#,
        )
        .bind(broadcast_id)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(DeferredRecipient::from).collect())
    }

    async fn remove_deferred(&self, broadcast_id: BroadcastId, position: i64) -> Result<()> {
        sqlx::query("DELETE FROM deferred_recipients WHERE broadcast_id = $1 AND position = $2")
            .bind(broadcast_id)
            .bind(position)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn deferred_count(&self, broadcast_id: BroadcastId) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM deferred_recipients WHERE broadcast_id = $1")
                .bind(broadcast_id)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count)
    }

    async fn claim_send(
        &self,
        broadcast_id: BroadcastId,
        variation_id: VariationId,
        recipient_email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO send_records (broadcast_id, variation_id, recipient_email, status, created_at)
            VALUES ($1, $2, $3, 'pending', $4)
            ON CONFLICT (broadcast_id, recipient_email) DO NOTHING
            "#,
        )
        .bind(broadcast_id)
        .bind(variation_id)
        .bind(recipient_email)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn complete_send(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
        attempts: i32,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE send_records SET
                status = 'sent', attempts = $3, message_id = $4, sent_at = $5, last_error = NULL
            WHERE broadcast_id = $1 AND recipient_email = $2 AND status = 'pending'
            "#,
        )
        .bind(broadcast_id)
        .bind(recipient_email)
        .bind(attempts)
        .bind(normalize_message_id(message_id))
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn fail_send(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
        attempts: i32,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE send_records SET status = 'failed', attempts = $3, last_error = $4
            WHERE broadcast_id = $1 AND recipient_email = $2 AND status = 'pending'
            "#,
        )
        .bind(broadcast_id)
        .bind(recipient_email)
        .bind(attempts)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_send_record(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
    ) -> Result<Option<SendRecord>> {
        let row = sqlx::query_as::<_, SendRecordRow>(
            "SELECT * FROM send_records WHERE broadcast_id = $1 AND recipient_email = $2",
        )
        .bind(broadcast_id)
        .bind(recipient_email)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(SendRecord::try_from).transpose()
    }

    async fn find_send_by_message_id(&self, message_id: &str) -> Result<Option<SendRecord>> {
        let row = sqlx::query_as::<_, SendRecordRow>(
            "SELECT * FROM send_records WHERE message_id = $1 LIMIT 1",
        )
        .bind(normalize_message_id(message_id))
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(SendRecord::try_from).transpose()
    }

    async fn send_counts(&self, broadcast_id: BroadcastId) -> Result<Vec<VariationSendCounts>> {
        let rows: Vec<(Uuid, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                variation_id,
                COUNT(*) FILTER (WHERE status = 'sent'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'pending')
            FROM send_records
            WHERE broadcast_id = $1
            GROUP BY variation_id
            "#,
        )
        .bind(broadcast_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(variation_id, sent, failed, pending)| VariationSendCounts {
                variation_id,
                sent,
                failed,
                pending,
            })
            .collect())
    }
}
