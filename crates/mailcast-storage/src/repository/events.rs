//! Delivery event repository

use crate::db::DatabasePool;
use crate::models::{
    BounceCategory, BounceDetail, BounceType, ComplaintFeedback, DeliveryEvent,
    DeliveryEventFilter, DeliveryEventType, EmailProvider, NewDeliveryEvent,
    VariationEventCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailcast_common::types::{normalize_message_id, BroadcastId, VariationId};
use mailcast_common::{Error, Result};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Delivery event repository trait
#[async_trait]
pub trait DeliveryEventRepository: Send + Sync {
    /// Insert unless (provider, message_id, event_type) already exists.
    /// The message id is stored in its normalized (bracket-free) form.
    /// Returns the stored event, or `None` for a duplicate.
    async fn insert(&self, event: NewDeliveryEvent) -> Result<Option<DeliveryEvent>>;
    /// Events matching `filter` with a sequence above `after_seq`, ascending.
    ///
    /// Sequence order must equal commit order, otherwise a reader paging
    /// with `after_seq` could pass a lower sequence that commits late.
    async fn list(
        &self,
        filter: &DeliveryEventFilter,
        after_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DeliveryEvent>>;
    /// Event counts per variation, joined through the send records
    async fn counts_by_variation(
        &self,
        broadcast_id: BroadcastId,
    ) -> Result<HashMap<VariationId, VariationEventCounts>>;
}

#[derive(FromRow)]
struct DeliveryEventRow {
    seq: i64,
    id: Uuid,
    workspace_id: Uuid,
    provider: String,
    integration_id: Option<Uuid>,
    event_type: String,
    recipient_email: String,
    message_id: String,
    broadcast_id: Option<Uuid>,
    transactional_id: Option<String>,
    timestamp: DateTime<Utc>,
    bounce_type: Option<String>,
    bounce_category: Option<String>,
    bounce_diagnostic: Option<String>,
    complaint_feedback: Option<String>,
    link: Option<String>,
    raw_payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryEventRow> for DeliveryEvent {
    type Error = Error;

    fn try_from(row: DeliveryEventRow) -> Result<Self> {
        let bounce = match (row.bounce_type, row.bounce_category) {
            (Some(bounce_type), Some(category)) => Some(BounceDetail {
                bounce_type: bounce_type.parse::<BounceType>().map_err(Error::Database)?,
                category: category.parse::<BounceCategory>().map_err(Error::Database)?,
                diagnostic: row.bounce_diagnostic,
            }),
            _ => None,
        };

        Ok(DeliveryEvent {
            seq: row.seq,
            id: row.id,
            workspace_id: row.workspace_id,
            provider: row.provider.parse::<EmailProvider>().map_err(Error::Database)?,
            integration_id: row.integration_id,
            event_type: row
                .event_type
                .parse::<DeliveryEventType>()
                .map_err(Error::Database)?,
            recipient_email: row.recipient_email,
            message_id: row.message_id,
            broadcast_id: row.broadcast_id,
            transactional_id: row.transactional_id,
            timestamp: row.timestamp,
            bounce,
            complaint_feedback: row
                .complaint_feedback
                .map(|f| ComplaintFeedback::from_arf(&f)),
            link: row.link,
            raw_payload: row.raw_payload,
            created_at: row.created_at,
        })
    }
}

/// Database delivery event repository
pub struct DbDeliveryEventRepository {
    pool: DatabasePool,
}

/// Advisory lock key serializing event inserts
const EVENT_SEQUENCE_LOCK: i64 = 0x6d63_6576_7365_71;

impl DbDeliveryEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryEventRepository for DbDeliveryEventRepository {
    async fn insert(&self, event: NewDeliveryEvent) -> Result<Option<DeliveryEvent>> {
        // BIGSERIAL values are handed out before commit. Holding the lock
        // until commit keeps sequence order and commit order the same.
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(EVENT_SEQUENCE_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = sqlx::query_as::<_, DeliveryEventRow>(
            r#"
            INSERT INTO delivery_events (
                id, workspace_id, provider, integration_id, event_type, recipient_email,
                message_id, broadcast_id, transactional_id, timestamp, bounce_type,
                bounce_category, bounce_diagnostic, complaint_feedback, link, raw_payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (provider, message_id, event_type) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event.workspace_id)
        .bind(event.provider.to_string())
        .bind(event.integration_id)
        .bind(event.event_type.to_string())
        .bind(&event.recipient_email)
        .bind(normalize_message_id(&event.message_id))
        .bind(event.broadcast_id)
        .bind(&event.transactional_id)
        .bind(event.timestamp)
        .bind(event.bounce.as_ref().map(|b| b.bounce_type.to_string()))
        .bind(event.bounce.as_ref().map(|b| b.category.to_string()))
        .bind(event.bounce.as_ref().and_then(|b| b.diagnostic.clone()))
        .bind(event.complaint_feedback.map(|f| f.to_string()))
        .bind(&event.link)
        .bind(&event.raw_payload)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(DeliveryEvent::try_from).transpose()
    }

    async fn list(
        &self,
        filter: &DeliveryEventFilter,
        after_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DeliveryEvent>> {
        let rows = sqlx::query_as::<_, DeliveryEventRow>(
            r#"
            SELECT * FROM delivery_events
            WHERE workspace_id = $1
                AND ($2::BIGINT IS NULL OR seq > $2)
                AND ($3::TEXT IS NULL OR event_type = $3)
                AND ($4::TEXT IS NULL OR LOWER(recipient_email) = LOWER($4))
                AND ($5::TEXT IS NULL OR message_id = $5)
                AND ($6::UUID IS NULL OR broadcast_id = $6)
                AND ($7::TEXT IS NULL OR transactional_id = $7)
                AND ($8::TIMESTAMPTZ IS NULL OR timestamp >= $8)
                AND ($9::TIMESTAMPTZ IS NULL OR timestamp <= $9)
            ORDER BY seq ASC
            LIMIT $10
            "#,
        )
        .bind(filter.workspace_id)
        .bind(after_seq)
        .bind(filter.event_type.map(|t| t.to_string()))
        .bind(&filter.recipient_email)
        .bind(&filter.message_id)
        .bind(filter.broadcast_id)
        .bind(&filter.transactional_id)
        .bind(filter.timestamp_from)
        .bind(filter.timestamp_to)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(DeliveryEvent::try_from).collect()
    }

    async fn counts_by_variation(
        &self,
        broadcast_id: BroadcastId,
    ) -> Result<HashMap<VariationId, VariationEventCounts>> {
        let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
            r#"
            SELECT s.variation_id, e.event_type, COUNT(*)
            FROM send_records s
            JOIN delivery_events e ON e.message_id = s.message_id
            WHERE s.broadcast_id = $1 AND s.message_id IS NOT NULL
            GROUP BY s.variation_id, e.event_type
            "#,
        )
        .bind(broadcast_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut counts: HashMap<VariationId, VariationEventCounts> = HashMap::new();
        for (variation_id, event_type, count) in rows {
            let event_type = event_type
                .parse::<DeliveryEventType>()
                .map_err(Error::Database)?;
            let entry = counts.entry(variation_id).or_default();
            match event_type {
                DeliveryEventType::Delivered => entry.delivered += count,
                DeliveryEventType::Bounce => entry.bounced += count,
                DeliveryEventType::Complaint => entry.complained += count,
                DeliveryEventType::Open => entry.opens += count,
                DeliveryEventType::Click => entry.clicks += count,
            }
        }

        Ok(counts)
    }
}
