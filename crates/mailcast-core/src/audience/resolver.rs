//! Audience Resolver - Expands lists and segments into recipients

use mailcast_common::types::{normalize_email, BroadcastId, WorkspaceId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{AudienceMember, AudienceSettings, Broadcast, Contact};
use mailcast_storage::repository::{AudienceSource, DispatchStore, UnsubscribeRepository};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns audience settings into a concrete, ordered recipient set
pub struct AudienceResolver {
    source: Arc<dyn AudienceSource>,
    unsubscribes: Arc<dyn UnsubscribeRepository>,
    store: Arc<dyn DispatchStore>,
}

impl AudienceResolver {
    pub fn new(
        source: Arc<dyn AudienceSource>,
        unsubscribes: Arc<dyn UnsubscribeRepository>,
        store: Arc<dyn DispatchStore>,
    ) -> Self {
        Self {
            source,
            unsubscribes,
            store,
        }
    }

    /// Union of all lists then all segments, in the order they are named.
    pub async fn resolve(
        &self,
        workspace_id: WorkspaceId,
        settings: &AudienceSettings,
    ) -> Result<Vec<Contact>> {
        let mut members = Vec::new();

        for list_id in &settings.lists {
            members.extend(self.source.list_members(workspace_id, *list_id).await?);
        }
        for segment_id in &settings.segments {
            members.extend(
                self.source
                    .segment_members(workspace_id, *segment_id)
                    .await?,
            );
        }

        if settings.skip_duplicate_emails {
            let mut seen = HashSet::new();
            members.retain(|c| seen.insert(normalize_email(&c.email)));
        }

        if settings.exclude_unsubscribed {
            let unsubscribed = self.unsubscribes.unsubscribed_emails(workspace_id).await?;
            if !unsubscribed.is_empty() {
                members.retain(|c| !unsubscribed.contains(&normalize_email(&c.email)));
            }
        }

        if members.is_empty() {
            return Err(Error::InvalidAudience(
                "audience resolved to zero recipients".to_string(),
            ));
        }

        debug!(
            workspace_id = %workspace_id,
            recipients = members.len(),
            "Resolved audience"
        );

        Ok(members)
    }

    /// Freeze the broadcast's audience, returning its size.
    ///
    /// The snapshot is ordered by normalized email with one entry per
    /// address. A second call returns the stored size without resolving.
    pub async fn snapshot(&self, broadcast: &Broadcast) -> Result<i64> {
        if let Some(total) = self.store.snapshot_len(broadcast.id).await? {
            return Ok(total);
        }

        let mut members = self
            .resolve(broadcast.workspace_id, &broadcast.audience)
            .await?;

        for member in members.iter_mut() {
            member.email = normalize_email(&member.email);
        }
        members.sort_by(|a, b| a.email.cmp(&b.email));
        members.dedup_by(|later, earlier| later.email == earlier.email);

        let total = self.store.save_snapshot(broadcast.id, members).await?;

        info!(broadcast_id = %broadcast.id, total, "Audience snapshot stored");
        Ok(total)
    }

    /// Read the snapshot from a cursor position
    pub async fn page(
        &self,
        broadcast_id: BroadcastId,
        cursor: i64,
        limit: i64,
    ) -> Result<Vec<AudienceMember>> {
        self.store.snapshot_page(broadcast_id, cursor, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailcast_storage::models::{CreateUnsubscribe, UnsubscribeSource};
    use mailcast_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn resolver(store: &Arc<MemoryStore>) -> AudienceResolver {
        AudienceResolver::new(store.clone(), store.clone(), store.clone())
    }

    fn emails(contacts: &[Contact]) -> Vec<String> {
        contacts.iter().map(|c| c.email.clone()).collect()
    }

    #[tokio::test]
    async fn test_resolve_skips_duplicates_in_order() {
        let store = Arc::new(MemoryStore::new());
        let workspace_id = Uuid::new_v4();
        let list_a = Uuid::new_v4();
        let list_b = Uuid::new_v4();

        for email in ["zoe@example.com", "amy@example.com"] {
            store.add_list_member(workspace_id, list_a, Contact::new(email)).await;
        }
        for email in ["AMY@example.com ", "bob@example.com"] {
            store.add_list_member(workspace_id, list_b, Contact::new(email)).await;
        }

        let settings = AudienceSettings {
            lists: vec![list_a, list_b],
            skip_duplicate_emails: true,
            ..Default::default()
        };

        let resolver = resolver(&store);
        let first = resolver.resolve(workspace_id, &settings).await.unwrap();
        let second = resolver.resolve(workspace_id, &settings).await.unwrap();

        assert_eq!(
            emails(&first),
            vec!["zoe@example.com", "amy@example.com", "bob@example.com"]
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_resolve_excludes_unsubscribed() {
        let store = Arc::new(MemoryStore::new());
        let workspace_id = Uuid::new_v4();
        let list = Uuid::new_v4();
        store.add_list_member(workspace_id, list, Contact::new("a@example.com")).await;
        store.add_list_member(workspace_id, list, Contact::new("b@example.com")).await;
        UnsubscribeRepository::create(
            store.as_ref(),
            CreateUnsubscribe {
                workspace_id,
                email: "B@example.com".into(),
                source: UnsubscribeSource::Manual,
                broadcast_id: None,
                reason: None,
            },
        )
        .await
        .unwrap();

        let settings = AudienceSettings {
            lists: vec![list],
            exclude_unsubscribed: true,
            ..Default::default()
        };

        let resolved = resolver(&store).resolve(workspace_id, &settings).await.unwrap();
        assert_eq!(emails(&resolved), vec!["a@example.com"]);
    }

    #[tokio::test]
    async fn test_resolve_empty_audience_fails() {
        let store = Arc::new(MemoryStore::new());
        let settings = AudienceSettings {
            lists: vec![Uuid::new_v4()],
            ..Default::default()
        };

        let result = resolver(&store).resolve(Uuid::new_v4(), &settings).await;
        assert!(matches!(result, Err(Error::InvalidAudience(_))));
    }

    #[tokio::test]
    async fn test_resolve_unions_lists_and_segments() {
        let store = Arc::new(MemoryStore::new());
        let workspace_id = Uuid::new_v4();
        let list = Uuid::new_v4();
        let segment = Uuid::new_v4();
        store.add_list_member(workspace_id, list, Contact::new("a@example.com")).await;
        store
            .add_segment_member(workspace_id, segment, Contact::new("s@example.com"))
            .await;

        let settings = AudienceSettings {
            lists: vec![list],
            segments: vec![segment],
            ..Default::default()
        };

        let resolved = resolver(&store).resolve(workspace_id, &settings).await.unwrap();
        assert_eq!(emails(&resolved), vec!["a@example.com", "s@example.com"]);
    }
}
