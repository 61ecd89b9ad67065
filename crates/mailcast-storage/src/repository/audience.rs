//! Contact lists and segments

use crate::db::DatabasePool;
use crate::models::Contact;
use async_trait::async_trait;
use mailcast_common::types::{ListId, SegmentId, WorkspaceId};
use mailcast_common::{Error, Result};
use sqlx::FromRow;
use uuid::Uuid;

/// Read access to audience membership.
///
/// Members are returned in insertion order so resolution is deterministic.
#[async_trait]
pub trait AudienceSource: Send + Sync {
    async fn list_members(&self, workspace_id: WorkspaceId, list_id: ListId)
        -> Result<Vec<Contact>>;
    async fn segment_members(
        &self,
        workspace_id: WorkspaceId,
        segment_id: SegmentId,
    ) -> Result<Vec<Contact>>;
}

#[derive(FromRow)]
struct ContactRow {
    email: String,
    name: Option<String>,
    timezone: Option<String>,
    attributes: serde_json::Value,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            email: row.email,
            name: row.name,
            timezone: row.timezone,
            attributes: row.attributes,
        }
    }
}

/// Database audience source
pub struct DbAudienceSource {
    pool: DatabasePool,
}

impl DbAudienceSource {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Upsert a contact and attach it to a list
    pub async fn add_list_member(
        &self,
        workspace_id: WorkspaceId,
        list_id: ListId,
        contact: &Contact,
    ) -> Result<()> {
        let contact_id = self.upsert_contact(workspace_id, contact).await?;

        sqlx::query(
            r#"
            INSERT INTO list_contacts (workspace_id, list_id, contact_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (list_id, contact_id) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(list_id)
        .bind(contact_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn upsert_contact(&self, workspace_id: WorkspaceId, contact: &Contact) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO contacts (id, workspace_id, email, name, timezone, attributes)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workspace_id, email) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, contacts.name),
                timezone = COALESCE(EXCLUDED.timezone, contacts.timezone),
                attributes = EXCLUDED.attributes
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workspace_id)
        .bind(&contact.email)
        .bind(&contact.name)
        .bind(&contact.timezone)
        .bind(&contact.attributes)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(id)
    }
}

#[async_trait]
impl AudienceSource for DbAudienceSource {
    async fn list_members(
        &self,
        workspace_id: WorkspaceId,
        list_id: ListId,
    ) -> Result<Vec<Contact>> {
        let rows = sqlx::query_as::<_, ContactRow>(
            r#"
            SELECT c.email, c.name, c.timezone, c.attributes
            FROM list_contacts lc
            JOIN contacts c ON c.id = lc.contact_id
            WHERE lc.workspace_id = $1 AND lc.list_id = $2
            ORDER BY lc.seq ASC
            "#,
        )
        .bind(workspace_id)
        .bind(list_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Contact::from).collect())
    }

    async fn segment_members(
        &self,
        workspace_id: WorkspaceId,
        segment_id: SegmentId,
    ) -> Result<Vec<Contact>> {
        let rows = sqlx::query_as::<_, ContactRow>(
            r#"
            SELECT c.email, c.name, c.timezone, c.attributes
            FROM segment_contacts sc
            JOIN contacts c ON c.id = sc.contact_id
            WHERE sc.workspace_id = $1 AND sc.segment_id = $2
            ORDER BY sc.seq ASC
            "#,
        )
        .bind(workspace_id)
        .bind(segment_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Contact::from).collect())
    }
}
