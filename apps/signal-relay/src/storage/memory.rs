use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{NegotiationRecord, NegotiationStore};
use crate::error::StoreError;
use crate::signaling::{SessionDescription, TrickledCandidate};

/// Process-local store. Updates to one key happen under that key's shard
/// lock, which keeps appends ordered.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<String, NegotiationRecord>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl NegotiationStore for InMemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, record: &NegotiationRecord) -> Result<(), StoreError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn append_candidate(
        &self,
        key: &str,
        entry: &TrickledCandidate,
    ) -> Result<(), StoreError> {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| NegotiationRecord::new(key))
            .push_candidate(entry.clone());
        Ok(())
    }

    async fn set_description(
        &self,
        key: &str,
        description: &SessionDescription,
    ) -> Result<(), StoreError> {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| NegotiationRecord::new(key))
            .set_description(description.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{IceCandidate, Target};

    fn entry(n: usize, target: Target) -> TrickledCandidate {
        TrickledCandidate {
            candidate: IceCandidate {
                candidate: format!("candidate:{n} 1 udp 1 192.168.1.{n} 9 typ host"),
                ..Default::default()
            },
            target,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn store_and_fetch_round_trip() {
        let store = InMemoryStore::new();
        let mut record = NegotiationRecord::new("room-id:a");
        record.set_description(SessionDescription::answer("v=0"));
        store.store(&record).await.unwrap();
        assert_eq!(store.fetch("room-id:a").await.unwrap(), Some(record));
        assert_eq!(store.fetch("room-id:b").await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn append_creates_record_and_preserves_order() {
        let store = InMemoryStore::new();
        for n in 0..5 {
            store
                .append_candidate("room-id:a", &entry(n, Target::Publish))
                .await
                .unwrap();
        }
        let record = store.recover("room-id:a").await.unwrap().unwrap();
        let expected: Vec<_> = (0..5).map(|n| entry(n, Target::Publish)).collect();
        assert_eq!(record.ice_candidates, expected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_append_is_a_no_op() {
        let store = InMemoryStore::new();
        store
            .append_candidate("k", &entry(1, Target::Subscribe))
            .await
            .unwrap();
        store
            .append_candidate("k", &entry(1, Target::Subscribe))
            .await
            .unwrap();
        let record = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(record.ice_candidates.len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_differing_only_in_ufrag_are_both_kept() {
        let store = InMemoryStore::new();
        let mut restarted = entry(1, Target::Publish);
        restarted.candidate.username_fragment = Some("ufrag-2".into());
        for candidate in [entry(1, Target::Publish), restarted.clone(), restarted] {
            store.append_candidate("k", &candidate).await.unwrap();
        }
        let record = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(record.ice_candidates.len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn description_updates_do_not_clobber_candidates() {
        let store = InMemoryStore::new();
        store
            .append_candidate("k", &entry(1, Target::Publish))
            .await
            .unwrap();
        store
            .set_description("k", &SessionDescription::offer("o"))
            .await
            .unwrap();
        store
            .set_description("k", &SessionDescription::answer("a1"))
            .await
            .unwrap();
        store
            .set_description("k", &SessionDescription::answer("a2"))
            .await
            .unwrap();
        let record = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(record.ice_candidates.len(), 1);
        assert_eq!(record.offer, Some(SessionDescription::offer("o")));
        assert_eq!(record.answer, Some(SessionDescription::answer("a2")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_lose_nothing() {
        let store = InMemoryStore::new();
        let mut tasks = Vec::new();
        for n in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .append_candidate("k", &entry(n, Target::Publish))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.fetch("k").await.unwrap().unwrap().ice_candidates.len(), 32);
    }
}
