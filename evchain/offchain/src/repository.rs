use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use evchain_types::{
    EventId, MatchRule, PolicyType, RetentionPolicy, RuleGroup, StoredEvent, TxHash,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("event already stored")]
    AlreadyStored,
    #[error("repository failure: {0}")]
    Internal(String),
}

/// Query surface of the off-chain event store. The production document
/// store binds behind this trait; tests and single-node deployments use
/// the in-memory implementation.
#[async_trait]
pub trait EventRepository: Send + Sync + 'static {
    async fn get_event_by_id(
        &self,
        event_id: &EventId,
    ) -> Result<Option<StoredEvent>, RepositoryError>;

    /// Returns the subset of the requested events this replica holds.
    async fn get_events_by_id(
        &self,
        event_ids: &[EventId],
    ) -> Result<Vec<StoredEvent>, RepositoryError>;

    async fn get_event_by_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<StoredEvent>, RepositoryError>;

    async fn event_count(&self) -> Result<usize, RepositoryError>;

    /// Stores a reconciled event. Duplicate ids fail with `AlreadyStored`.
    async fn store(&self, event: StoredEvent) -> Result<(), RepositoryError>;

    /// Deletes events outside the committed retention policy. Returns how
    /// many were dropped.
    async fn drop_expired_events(
        &self,
        policy: &RetentionPolicy,
    ) -> Result<usize, RepositoryError>;
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<EventId, StoredEvent>,
    by_tx: HashMap<Vec<u8>, EventId>,
}

/// In-process event store.
#[derive(Default)]
pub struct MemoryEventRepository {
    state: RwLock<MemoryState>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        MemoryEventRepository::default()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn get_event_by_id(
        &self,
        event_id: &EventId,
    ) -> Result<Option<StoredEvent>, RepositoryError> {
        Ok(self.state.read().events.get(event_id).cloned())
    }

    async fn get_events_by_id(
        &self,
        event_ids: &[EventId],
    ) -> Result<Vec<StoredEvent>, RepositoryError> {
        let state = self.state.read();
        Ok(event_ids
            .iter()
            .filter_map(|event_id| state.events.get(event_id).cloned())
            .collect())
    }

    async fn get_event_by_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<StoredEvent>, RepositoryError> {
        let state = self.state.read();
        Ok(state
            .by_tx
            .get(tx_hash.as_bytes())
            .and_then(|event_id| state.events.get(event_id))
            .cloned())
    }

    async fn event_count(&self) -> Result<usize, RepositoryError> {
        Ok(self.state.read().events.len())
    }

    async fn store(&self, event: StoredEvent) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        let event_id = event.metadata.event_id;
        if state.events.contains_key(&event_id) {
            return Err(RepositoryError::AlreadyStored);
        }
        state.by_tx.insert(event.tx_hash.as_bytes().to_vec(), event_id);
        state.events.insert(event_id, event);
        Ok(())
    }

    async fn drop_expired_events(
        &self,
        policy: &RetentionPolicy,
    ) -> Result<usize, RepositoryError> {
        let expired = {
            let state = self.state.read();
            let events: Vec<&StoredEvent> = state.events.values().collect();
            select_expired(&events, policy, Utc::now())
        };

        let mut state = self.state.write();
        for event_id in &expired {
            if let Some(event) = state.events.remove(event_id) {
                state.by_tx.remove(event.tx_hash.as_bytes());
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "dropped events outside retention policy");
        }
        Ok(expired.len())
    }
}

fn rule_matches(rule: &MatchRule, event: &StoredEvent) -> bool {
    if let Some(channel) = &rule.channel {
        if !channel.eq_ignore_ascii_case(&event.event.system.channel) {
            return false;
        }
    }
    if let Some(event_type) = rule.event_id {
        if event_type != event.event.system.event_id {
            return false;
        }
    }
    if let Some(provider) = &rule.provider_guid {
        if event.event.system.provider.guid.as_ref() != Some(provider) {
            return false;
        }
    }
    true
}

/// Applies the retention contract to a snapshot of stored events and
/// returns the ids to delete.
///
/// Every event is governed by its first matching filter: timestamp filters
/// expire events older than their retention period, the count filter keeps
/// only the newest `volume` events of its bucket (globally or per
/// principal). Events matching no filter are kept.
pub fn select_expired(
    events: &[&StoredEvent],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<EventId> {
    let mut expired = Vec::new();
    // Count-filter buckets keyed by principal; one shared key for global.
    let mut buckets: HashMap<Option<String>, Vec<(DateTime<Utc>, EventId)>> = HashMap::new();
    let mut count_volume = 0u64;

    for event in events {
        let Some(filter) = policy
            .filters
            .iter()
            .find(|filter| rule_matches(&filter.match_rule, event))
        else {
            continue;
        };

        match filter.policy.policy_type {
            PolicyType::Timestamp => {
                let cutoff = now - std::time::Duration::from_secs(filter.policy.retention_period_secs);
                if event.metadata.received_time < cutoff {
                    expired.push(event.metadata.event_id);
                }
            }
            PolicyType::Count => {
                count_volume = filter.policy.volume;
                let bucket = match filter.policy.rule_group {
                    Some(RuleGroup::Principal) => {
                        Some(event.metadata.principal.as_str().to_string())
                    }
                    _ => None,
                };
                buckets
                    .entry(bucket)
                    .or_default()
                    .push((event.metadata.received_time, event.metadata.event_id));
            }
        }
    }

    for (_, mut bucket) in buckets {
        // Newest first; everything past the volume cap expires.
        bucket.sort_by(|a, b| b.0.cmp(&a.0));
        expired.extend(
            bucket
                .into_iter()
                .skip(count_volume as usize)
                .map(|(_, event_id)| event_id),
        );
    }

    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evchain_types::{
        EventMetadata, EventPayload, PolicyAction, Principal, RetentionFilter, ScrubbedEvent,
        SystemMetadata,
    };

    fn stored_event(
        id_byte: u8,
        channel: &str,
        principal: &str,
        age_secs: i64,
        now: DateTime<Utc>,
    ) -> StoredEvent {
        let payload = EventPayload::default();
        StoredEvent {
            event: ScrubbedEvent {
                system: SystemMetadata {
                    channel: channel.to_string(),
                    event_id: 4624,
                    ..SystemMetadata::default()
                },
                off_chain_hash: payload.hash_hex().unwrap(),
            },
            payload,
            metadata: EventMetadata {
                event_id: EventId::from_bytes([id_byte; 32]),
                received_time: now - std::time::Duration::from_secs(age_secs as u64),
                principal: Principal::new(principal).unwrap(),
            },
            tx_hash: TxHash::from_bytes(vec![id_byte; 32]),
        }
    }

    fn timestamp_policy(channel: &str, period_secs: u64) -> RetentionPolicy {
        RetentionPolicy {
            filters: vec![RetentionFilter {
                label: "age".into(),
                match_rule: MatchRule {
                    channel: Some(channel.to_string()),
                    ..MatchRule::default()
                },
                policy: PolicyAction {
                    policy_type: PolicyType::Timestamp,
                    rule_group: None,
                    retention_period_secs: period_secs,
                    volume: 0,
                },
            }],
        }
    }

    fn count_policy(volume: u64, group: RuleGroup) -> RetentionPolicy {
        RetentionPolicy {
            filters: vec![RetentionFilter {
                label: "cap".into(),
                match_rule: MatchRule::default(),
                policy: PolicyAction {
                    policy_type: PolicyType::Count,
                    rule_group: Some(group),
                    retention_period_secs: 0,
                    volume,
                },
            }],
        }
    }

    #[test]
    fn timestamp_filter_expires_only_old_matching_events() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let old_security = stored_event(1, "Security", "a", 7200, now);
        let new_security = stored_event(2, "Security", "a", 60, now);
        let old_system = stored_event(3, "System", "a", 7200, now);

        let events = vec![&old_security, &new_security, &old_system];
        let expired = select_expired(&events, &timestamp_policy("Security", 3600), now);
        assert_eq!(expired, vec![EventId::from_bytes([1; 32])]);
    }

    #[test]
    fn global_count_filter_keeps_newest_volume() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let events: Vec<StoredEvent> = (0..5)
            .map(|i| stored_event(i as u8, "Security", "a", (i + 1) * 100, now))
            .collect();
        let refs: Vec<&StoredEvent> = events.iter().collect();

        let mut expired = select_expired(&refs, &count_policy(2, RuleGroup::Global), now);
        expired.sort();
        // The three oldest (ids 2, 3, 4) go.
        assert_eq!(
            expired,
            vec![
                EventId::from_bytes([2; 32]),
                EventId::from_bytes([3; 32]),
                EventId::from_bytes([4; 32]),
            ]
        );
    }

    #[test]
    fn principal_count_filter_caps_each_principal_separately() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let events: Vec<StoredEvent> = vec![
            stored_event(1, "Security", "alice", 100, now),
            stored_event(2, "Security", "alice", 200, now),
            stored_event(3, "Security", "bob", 300, now),
        ];
        let refs: Vec<&StoredEvent> = events.iter().collect();

        let expired = select_expired(&refs, &count_policy(1, RuleGroup::Principal), now);
        // Alice loses her older event; bob is under the cap.
        assert_eq!(expired, vec![EventId::from_bytes([2; 32])]);
    }

    #[test]
    fn first_matching_filter_governs() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        // Security events governed by a generous timestamp filter; the
        // catch-all count filter must not delete them.
        let mut policy = timestamp_policy("Security", 1_000_000);
        policy
            .filters
            .push(count_policy(1, RuleGroup::Global).filters.remove(0));

        let events: Vec<StoredEvent> = vec![
            stored_event(1, "Security", "a", 500, now),
            stored_event(2, "Security", "a", 600, now),
        ];
        let refs: Vec<&StoredEvent> = events.iter().collect();
        assert!(select_expired(&refs, &policy, now).is_empty());
    }

    #[tokio::test]
    async fn memory_repository_stores_and_deduplicates() {
        let now = Utc::now();
        let repository = MemoryEventRepository::new();
        let event = stored_event(1, "Security", "a", 10, now);

        repository.store(event.clone()).await.unwrap();
        assert!(matches!(
            repository.store(event.clone()).await,
            Err(RepositoryError::AlreadyStored)
        ));

        assert_eq!(repository.event_count().await.unwrap(), 1);
        assert_eq!(
            repository
                .get_event_by_id(&event.metadata.event_id)
                .await
                .unwrap(),
            Some(event.clone())
        );
        assert_eq!(
            repository.get_event_by_tx(&event.tx_hash).await.unwrap(),
            Some(event.clone())
        );

        let found = repository
            .get_events_by_id(&[event.metadata.event_id, EventId::from_bytes([9; 32])])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn drop_expired_events_deletes_and_reports() {
        let now = Utc::now();
        let repository = MemoryEventRepository::new();
        repository
            .store(stored_event(1, "Security", "a", 7200, now))
            .await
            .unwrap();
        repository
            .store(stored_event(2, "Security", "a", 30, now))
            .await
            .unwrap();

        let dropped = repository
            .drop_expired_events(&timestamp_policy("Security", 3600))
            .await
            .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(repository.event_count().await.unwrap(), 1);
    }
}
