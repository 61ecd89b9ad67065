//! In-memory implementations of every repository trait

use crate::models::{
    AudienceMember, Broadcast, BroadcastCounters, BroadcastStatus, Contact, CreateBroadcast,
    CreateUnsubscribe, DeferredRecipient, DeliveryEvent, DeliveryEventFilter, DeliveryEventType,
    EmailProvider, NewDeliveryEvent, SendRecord, SendStatus, UpdateBroadcast,
    VariationEventCounts, VariationSendCounts,
};
use crate::repository::broadcasts::build_variations;
use crate::repository::{
    AudienceSource, BroadcastRepository, CycleLease, DeliveryEventRepository, DispatchStore,
    UnsubscribeRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailcast_common::types::{
    normalize_email, normalize_message_id, BroadcastId, ListId, SegmentId, VariationId,
    WorkspaceId,
};
use mailcast_common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    broadcasts: HashMap<BroadcastId, Broadcast>,
    lists: HashMap<(WorkspaceId, ListId), Vec<Contact>>,
    segments: HashMap<(WorkspaceId, SegmentId), Vec<Contact>>,
    unsubscribes: HashMap<WorkspaceId, HashSet<String>>,
    snapshots: HashMap<BroadcastId, Vec<Contact>>,
    deferred: HashMap<BroadcastId, BTreeMap<i64, DeferredRecipient>>,
    sends: HashMap<(BroadcastId, String), SendRecord>,
    events: Vec<DeliveryEvent>,
    event_keys: HashSet<(EmailProvider, String, DeliveryEventType)>,
    next_seq: i64,
}

/// Process-local store backing all repositories
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    dispatch_faults: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a contact to a list
    pub async fn add_list_member(&self, workspace_id: WorkspaceId, list_id: ListId, contact: Contact) {
        let mut state = self.state.write().await;
        state
            .lists
            .entry((workspace_id, list_id))
            .or_default()
            .push(contact);
    }

    /// Append a contact to a segment
    pub async fn add_segment_member(
        &self,
        workspace_id: WorkspaceId,
        segment_id: SegmentId,
        contact: Contact,
    ) {
        let mut state = self.state.write().await;
        state
            .segments
            .entry((workspace_id, segment_id))
            .or_default()
            .push(contact);
    }

    /// Make dispatch store calls fail with a database error
    pub fn inject_dispatch_faults(&self, enabled: bool) {
        self.dispatch_faults.store(enabled, Ordering::SeqCst);
    }

    /// All send records of a broadcast
    pub async fn send_records(&self, broadcast_id: BroadcastId) -> Vec<SendRecord> {
        let state = self.state.read().await;
        let mut records: Vec<SendRecord> = state
            .sends
            .values()
            .filter(|r| r.broadcast_id == broadcast_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.recipient_email.cmp(&b.recipient_email));
        records
    }

    fn check_faults(&self) -> Result<()> {
        if self.dispatch_faults.load(Ordering::SeqCst) {
            Err(Error::Database("injected dispatch store fault".to_string()))
        } else {
            Ok(())
        }
    }
}

fn stamp_transition(broadcast: &mut Broadcast, to: BroadcastStatus, at: DateTime<Utc>) {
    broadcast.status = to;
    broadcast.updated_at = at;
    match to {
        BroadcastStatus::Scheduled => broadcast.scheduled_at = Some(at),
        BroadcastStatus::Sending => {
            broadcast.started_at.get_or_insert(at);
        }
        BroadcastStatus::Paused => broadcast.paused_at = Some(at),
        BroadcastStatus::Sent => broadcast.completed_at = Some(at),
        BroadcastStatus::Cancelled => broadcast.cancelled_at = Some(at),
        BroadcastStatus::Failed => broadcast.failed_at = Some(at),
        BroadcastStatus::Draft => {}
    }
}

#[async_trait]
impl BroadcastRepository for MemoryStore {
    async fn create(&self, input: CreateBroadcast) -> Result<Broadcast> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let broadcast = Broadcast {
            id,
            workspace_id: input.workspace_id,
            name: input.name,
            status: BroadcastStatus::Draft,
            audience: input.audience,
            schedule: input.schedule,
            test_settings: input.test_settings,
            variations: build_variations(id, input.variations, now),
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            failed_count: 0,
            recipient_cursor: 0,
            winning_variation: None,
            winner_selected_at: None,
            winner_released: false,
            winner_sent_at: None,
            test_phase_started_at: None,
            last_error: None,
            scheduled_at: None,
            started_at: None,
            paused_at: None,
            completed_at: None,
            cancelled_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.write().await;
        state.broadcasts.insert(id, broadcast.clone());
        Ok(broadcast)
    }

    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>> {
        Ok(self.state.read().await.broadcasts.get(&id).cloned())
    }

    async fn get_in_workspace(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
    ) -> Result<Option<Broadcast>> {
        Ok(self
            .state
            .read()
            .await
            .broadcasts
            .get(&id)
            .filter(|b| b.workspace_id == workspace_id)
            .cloned())
    }

    async fn list(
        &self,
        workspace_id: WorkspaceId,
        status: Option<BroadcastStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>> {
        let state = self.state.read().await;
        let mut broadcasts: Vec<Broadcast> = state
            .broadcasts
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .filter(|b| status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();
        broadcasts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(broadcasts
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(
        &self,
        workspace_id: WorkspaceId,
        status: Option<BroadcastStatus>,
    ) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .broadcasts
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .filter(|b| status.map_or(true, |s| b.status == s))
            .count() as i64)
    }

    async fn list_by_status(&self, status: BroadcastStatus) -> Result<Vec<Broadcast>> {
        let state = self.state.read().await;
        let mut broadcasts: Vec<Broadcast> = state
            .broadcasts
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        broadcasts.sort_by_key(|b| b.created_at);
        Ok(broadcasts)
    }

    async fn update(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
        input: UpdateBroadcast,
    ) -> Result<Option<Broadcast>> {
        let mut state = self.state.write().await;
        let broadcast = match state.broadcasts.get_mut(&id) {
            Some(b) if b.workspace_id == workspace_id && b.status == BroadcastStatus::Draft => b,
            _ => return Ok(None),
        };

        let now = Utc::now();
        if let Some(name) = input.name {
            broadcast.name = name;
        }
        if let Some(audience) = input.audience {
            broadcast.audience = audience;
        }
        if let Some(schedule) = input.schedule {
            broadcast.schedule = schedule;
        }
        if let Some(test_settings) = input.test_settings {
            broadcast.test_settings = test_settings;
        }
        if let Some(variations) = input.variations {
            broadcast.variations = build_variations(id, variations, now);
        }
        broadcast.updated_at = now;

        Ok(Some(broadcast.clone()))
    }

    async fn delete(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<bool> {
        let mut state = self.state.write().await;
        let deletable = state
            .broadcasts
            .get(&id)
            .map_or(false, |b| {
                b.workspace_id == workspace_id && b.status == BroadcastStatus::Draft
            });
        if deletable {
            state.broadcasts.remove(&id);
        }
        Ok(deletable)
    }

    async fn transition(
        &self,
        id: BroadcastId,
        from: BroadcastStatus,
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Broadcast>> {
        let mut state = self.state.write().await;
        match state.broadcasts.get_mut(&id) {
            Some(broadcast) if broadcast.status == from => {
                stamp_transition(broadcast, to, at);
                Ok(Some(broadcast.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_audience_total(
        &self,
        id: BroadcastId,
        total: i64,
        test_phase_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(broadcast) = state.broadcasts.get_mut(&id) {
            broadcast.total_recipients = total;
            if broadcast.test_phase_started_at.is_none() {
                broadcast.test_phase_started_at = test_phase_started_at;
            }
        }
        Ok(())
    }

    async fn set_cursor(&self, id: BroadcastId, cursor: i64) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(broadcast) = state.broadcasts.get_mut(&id) {
            broadcast.recipient_cursor = cursor;
        }
        Ok(())
    }

    async fn set_winner(
        &self,
        id: BroadcastId,
        variation_id: VariationId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.broadcasts.get_mut(&id) {
            Some(broadcast) if broadcast.winning_variation.is_none() => {
                broadcast.winning_variation = Some(variation_id);
                broadcast.winner_selected_at = Some(at);
                broadcast.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_winner(&self, id: BroadcastId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.broadcasts.get_mut(&id) {
            Some(broadcast) if broadcast.winning_variation.is_some() && !broadcast.winner_released => {
                broadcast.winner_released = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_winner_sent(&self, id: BroadcastId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(broadcast) = state.broadcasts.get_mut(&id) {
            broadcast.winner_sent_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn set_counters(&self, id: BroadcastId, counters: BroadcastCounters) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(broadcast) = state.broadcasts.get_mut(&id) {
            broadcast.sent_count = counters.sent;
            broadcast.delivered_count = counters.delivered;
            broadcast.failed_count = counters.failed;
        }
        Ok(())
    }

    async fn record_error(&self, id: BroadcastId, message: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(broadcast) = state.broadcasts.get_mut(&id) {
            broadcast.last_error = Some(message.to_string());
        }
        Ok(())
    }

    async fn try_lease_cycle(&self, _id: BroadcastId) -> Result<Option<CycleLease>> {
        Ok(Some(CycleLease::local()))
    }
}

#[async_trait]
impl AudienceSource for MemoryStore {
    async fn list_members(
        &self,
        workspace_id: WorkspaceId,
        list_id: ListId,
    ) -> Result<Vec<Contact>> {
        let state = self.state.read().await;
        Ok(state
            .lists
            .get(&(workspace_id, list_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn segment_members(
        &self,
        workspace_id: WorkspaceId,
        segment_id: SegmentId,
    ) -> Result<Vec<Contact>> {
        let state = self.state.read().await;
        Ok(state
            .segments
            .get(&(workspace_id, segment_id))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl UnsubscribeRepository for MemoryStore {
    async fn create(&self, input: CreateUnsubscribe) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .unsubscribes
            .entry(input.workspace_id)
            .or_default()
            .insert(normalize_email(&input.email));
        Ok(())
    }

    async fn is_unsubscribed(&self, workspace_id: WorkspaceId, email: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .unsubscribes
            .get(&workspace_id)
            .map_or(false, |set| set.contains(&normalize_email(email))))
    }

    async fn unsubscribed_emails(&self, workspace_id: WorkspaceId) -> Result<HashSet<String>> {
        let state = self.state.read().await;
        Ok(state
            .unsubscribes
            .get(&workspace_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn save_snapshot(&self, broadcast_id: BroadcastId, members: Vec<Contact>) -> Result<i64> {
        self.check_faults()?;
        let mut state = self.state.write().await;
        let snapshot = state.snapshots.entry(broadcast_id).or_insert(members);
        Ok(snapshot.len() as i64)
    }

    async fn snapshot_len(&self, broadcast_id: BroadcastId) -> Result<Option<i64>> {
        self.check_faults()?;
        let state = self.state.read().await;
        Ok(state.snapshots.get(&broadcast_id).map(|s| s.len() as i64))
    }

    async fn snapshot_page(
        &self,
        broadcast_id: BroadcastId,
        from: i64,
        limit: i64,
    ) -> Result<Vec<AudienceMember>> {
        self.check_faults()?;
        let state = self.state.read().await;
        let Some(snapshot) = state.snapshots.get(&broadcast_id) else {
            return Ok(Vec::new());
        };

        Ok(snapshot
            .iter()
            .enumerate()
            .skip(from.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(position, contact)| AudienceMember {
                position: position as i64,
                contact: contact.clone(),
            })
            .collect())
    }

    async fn defer(&self, recipient: DeferredRecipient) -> Result<()> {
        self.check_faults()?;
        let mut state = self.state.write().await;
        state
            .deferred
            .entry(recipient.broadcast_id)
            .or_default()
            .insert(recipient.member.position, recipient);
        Ok(())
    }

    async fn due_deferred(
        &self,
        broadcast_id: BroadcastId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeferredRecipient>> {
        self.check_faults()?;
        let state = self.state.read().await;
        let mut due: Vec<DeferredRecipient> = state
            .deferred
            .get(&broadcast_id)
            .map(|parked| {
                parked
                    .values()
                    .filter(|d| d.not_before <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by(|a, b| {
            a.not_before
                .cmp(&b.not_before)
                .then(a.member.position.cmp(&b.member.position))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn remove_deferred(&self, broadcast_id: BroadcastId, position: i64) -> Result<()> {
        self.check_faults()?;
        let mut state = self.state.write().await;
        if let Some(parked) = state.deferred.get_mut(&broadcast_id) {
            parked.remove(&position);
        }
        Ok(())
    }

    async fn deferred_count(&self, broadcast_id: BroadcastId) -> Result<i64> {
        self.check_faults()?;
        let state = self.state.read().await;
        Ok(state
            .deferred
            .get(&broadcast_id)
            .map_or(0, |parked| parked.len() as i64))
    }

    async fn claim_send(
        &self,
        broadcast_id: BroadcastId,
        variation_id: VariationId,
        recipient_email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_faults()?;
        let mut state = self.state.write().await;
        let key = (broadcast_id, recipient_email.to_string());
        if state.sends.contains_key(&key) {
            return Ok(false);
        }

        state.sends.insert(
            key,
            SendRecord {
                broadcast_id,
                variation_id,
                recipient_email: recipient_email.to_string(),
                status: SendStatus::Pending,
                attempts: 0,
                message_id: None,
                last_error: None,
                created_at: at,
                sent_at: None,
            },
        );
        Ok(true)
    }

    async fn complete_send(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
        attempts: i32,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_faults()?;
        let mut state = self.state.write().await;
        if let Some(record) = state
            .sends
            .get_mut(&(broadcast_id, recipient_email.to_string()))
            .filter(|r| r.status == SendStatus::Pending)
        {
            record.status = SendStatus::Sent;
            record.attempts = attempts;
            record.message_id = Some(normalize_message_id(message_id));
            record.sent_at = Some(at);
            record.last_error = None;
        }
        Ok(())
    }

    async fn fail_send(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
        attempts: i32,
        error: &str,
    ) -> Result<()> {
        self.check_faults()?;
        let mut state = self.state.write().await;
        if let Some(record) = state
            .sends
            .get_mut(&(broadcast_id, recipient_email.to_string()))
            .filter(|r| r.status == SendStatus::Pending)
        {
            record.status = SendStatus::Failed;
            record.attempts = attempts;
            record.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_send_record(
        &self,
        broadcast_id: BroadcastId,
        recipient_email: &str,
    ) -> Result<Option<SendRecord>> {
        self.check_faults()?;
        let state = self.state.read().await;
        Ok(state
            .sends
            .get(&(broadcast_id, recipient_email.to_string()))
            .cloned())
    }

    async fn find_send_by_message_id(&self, message_id: &str) -> Result<Option<SendRecord>> {
        let message_id = normalize_message_id(message_id);
        let state = self.state.read().await;
        Ok(state
            .sends
            .values()
            .find(|r| r.message_id.as_deref() == Some(message_id.as_str()))
            .cloned())
    }

    async fn send_counts(&self, broadcast_id: BroadcastId) -> Result<Vec<VariationSendCounts>> {
        self.check_faults()?;
        let state = self.state.read().await;
        let mut counts: HashMap<VariationId, VariationSendCounts> = HashMap::new();
        for record in state.sends.values().filter(|r| r.broadcast_id == broadcast_id) {
            let entry = counts
                .entry(record.variation_id)
                .or_insert(VariationSendCounts {
                    variation_id: record.variation_id,
                    sent: 0,
                    failed: 0,
                    pending: 0,
                });
            match record.status {
                SendStatus::Sent => entry.sent += 1,
                SendStatus::Failed => entry.failed += 1,
                SendStatus::Pending => entry.pending += 1,
            }
        }
        Ok(counts.into_values().collect())
    }
}

#[async_trait]
impl DeliveryEventRepository for MemoryStore {
    async fn insert(&self, mut event: NewDeliveryEvent) -> Result<Option<DeliveryEvent>> {
        event.message_id = normalize_message_id(&event.message_id);
        let mut state = self.state.write().await;
        let key = (event.provider, event.message_id.clone(), event.event_type);
        if !state.event_keys.insert(key) {
            return Ok(None);
        }

        state.next_seq += 1;
        let stored = DeliveryEvent {
            seq: state.next_seq,
            id: Uuid::now_v7(),
            workspace_id: event.workspace_id,
            provider: event.provider,
            integration_id: event.integration_id,
            event_type: event.event_type,
            recipient_email: event.recipient_email,
            message_id: event.message_id,
            broadcast_id: event.broadcast_id,
            transactional_id: event.transactional_id,
            timestamp: event.timestamp,
            bounce: event.bounce,
            complaint_feedback: event.complaint_feedback,
            link: event.link,
            raw_payload: event.raw_payload,
            created_at: Utc::now(),
        };
        state.events.push(stored.clone());
        Ok(Some(stored))
    }

    async fn list(
        &self,
        filter: &DeliveryEventFilter,
        after_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DeliveryEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| after_seq.map_or(true, |seq| e.seq > seq))
            .filter(|e| filter.matches(e))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn counts_by_variation(
        &self,
        broadcast_id: BroadcastId,
    ) -> Result<HashMap<VariationId, VariationEventCounts>> {
        let state = self.state.read().await;
        let by_message: HashMap<&str, VariationId> = state
            .sends
            .values()
            .filter(|r| r.broadcast_id == broadcast_id)
            .filter_map(|r| r.message_id.as_deref().map(|m| (m, r.variation_id)))
            .collect();

        let mut counts: HashMap<VariationId, VariationEventCounts> = HashMap::new();
        for event in &state.events {
            if let Some(variation_id) = by_message.get(event.message_id.as_str()) {
                counts.entry(*variation_id).or_default().add(event.event_type);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AudienceSettings, CreateVariation, ScheduleSettings, TestSettings};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn create_input(workspace_id: WorkspaceId) -> CreateBroadcast {
        CreateBroadcast {
            workspace_id,
            name: "Spring sale".into(),
            audience: AudienceSettings::default(),
            schedule: ScheduleSettings::default(),
            test_settings: TestSettings::default(),
            variations: vec![CreateVariation {
                name: "A".into(),
                template_id: Uuid::new_v4(),
                template_version: 1,
                subject: "Hello".into(),
                from_name: None,
                from_email: "news@example.com".into(),
                reply_to: None,
            }],
        }
    }

    fn new_event(message_id: &str, event_type: DeliveryEventType) -> NewDeliveryEvent {
        NewDeliveryEvent {
            workspace_id: Uuid::nil(),
            provider: EmailProvider::Ses,
            integration_id: None,
            event_type,
            recipient_email: "a@example.com".into(),
            message_id: message_id.into(),
            broadcast_id: None,
            transactional_id: None,
            timestamp: Utc::now(),
            bounce: None,
            complaint_feedback: None,
            link: None,
            raw_payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let broadcast = BroadcastRepository::create(&store, create_input(Uuid::new_v4()))
            .await
            .unwrap();
        let now = Utc::now();

        let first = store
            .transition(broadcast.id, BroadcastStatus::Draft, BroadcastStatus::Scheduled, now)
            .await
            .unwrap();
        let second = store
            .transition(broadcast.id, BroadcastStatus::Draft, BroadcastStatus::Cancelled, now)
            .await
            .unwrap();

        let first = first.unwrap();
        assert_eq!(first.status, BroadcastStatus::Scheduled);
        assert_eq!(first.scheduled_at, Some(now));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_claim_send_is_exclusive() {
        let store = MemoryStore::new();
        let broadcast_id = Uuid::new_v4();
        let variation_id = Uuid::new_v4();
        let now = Utc::now();

        assert!(store
            .claim_send(broadcast_id, variation_id, "a@example.com", now)
            .await
            .unwrap());
        assert!(!store
            .claim_send(broadcast_id, variation_id, "a@example.com", now)
            .await
            .unwrap());
        assert_eq!(store.send_records(broadcast_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_written_once() {
        let store = MemoryStore::new();
        let broadcast_id = Uuid::new_v4();

        let first = store
            .save_snapshot(broadcast_id, vec![Contact::new("a@example.com"), Contact::new("b@example.com")])
            .await
            .unwrap();
        let second = store
            .save_snapshot(broadcast_id, vec![Contact::new("c@example.com")])
            .await
            .unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        let page = store.snapshot_page(broadcast_id, 1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].position, 1);
        assert_eq!(page[0].contact.email, "b@example.com");
    }

    #[tokio::test]
    async fn test_event_insert_deduplicates() {
        let store = MemoryStore::new();

        let first = store
            .insert(new_event("msg-1", DeliveryEventType::Bounce))
            .await
            .unwrap();
        let duplicate = store
            .insert(new_event("msg-1", DeliveryEventType::Bounce))
            .await
            .unwrap();
        let other_type = store
            .insert(new_event("msg-1", DeliveryEventType::Open))
            .await
            .unwrap();

        assert_eq!(first.map(|e| e.seq), Some(1));
        assert!(duplicate.is_none());
        assert_eq!(other_type.map(|e| e.seq), Some(2));
    }

    #[tokio::test]
    async fn test_bracketed_send_joins_bare_event() {
        let store = MemoryStore::new();
        let broadcast_id = Uuid::new_v4();
        let variation_id = Uuid::new_v4();
        let now = Utc::now();

        store
            .claim_send(broadcast_id, variation_id, "a@example.com", now)
            .await
            .unwrap();
        store
            .complete_send(broadcast_id, "a@example.com", 1, "<msg-1@mailcast>", now)
            .await
            .unwrap();
        store
            .insert(new_event("msg-1@mailcast", DeliveryEventType::Open))
            .await
            .unwrap();

        let found = store.find_send_by_message_id("<msg-1@mailcast>").await.unwrap();
        assert_eq!(found.and_then(|r| r.message_id).as_deref(), Some("msg-1@mailcast"));

        let counts = store.counts_by_variation(broadcast_id).await.unwrap();
        assert_eq!(counts.get(&variation_id).map(|c| c.opens), Some(1));
    }

    #[tokio::test]
    async fn test_event_list_pages_by_sequence() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert(new_event(&format!("msg-{}", i), DeliveryEventType::Delivered))
                .await
                .unwrap();
        }

        let filter = DeliveryEventFilter {
            workspace_id: Uuid::nil(),
            ..Default::default()
        };
        let page = DeliveryEventRepository::list(&store, &filter, Some(2), 2)
            .await
            .unwrap();
        let seqs: Vec<i64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_event_paging_sees_concurrent_inserts_once() {
        let store = Arc::new(MemoryStore::new());
        let filter = DeliveryEventFilter {
            workspace_id: Uuid::nil(),
            ..Default::default()
        };

        let writers: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert(new_event(&format!("msg-{}", i), DeliveryEventType::Delivered))
                        .await
                        .unwrap();
                })
            })
            .collect();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = DeliveryEventRepository::list(store.as_ref(), &filter, cursor, 7)
                .await
                .unwrap();
            if let Some(last) = page.last() {
                cursor = Some(last.seq);
            }
            seen.extend(page.into_iter().map(|e| e.seq));
            if seen.len() == 50 {
                break;
            }
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(seen, (1..=50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_dispatch_faults() {
        let store = MemoryStore::new();
        store.inject_dispatch_faults(true);
        assert!(matches!(
            store.snapshot_len(Uuid::new_v4()).await,
            Err(Error::Database(_))
        ));
    }
}
