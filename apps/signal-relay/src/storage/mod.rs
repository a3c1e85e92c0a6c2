mod memory;
mod redis_store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::signaling::{SdpType, SessionDescription, TrickledCandidate};

pub use self::memory::InMemoryStore;
pub use self::redis_store::RedisStore;

/// Negotiation state kept per session key so a reconnecting client can resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NegotiationRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Remote candidates in arrival order.
    #[serde(default)]
    pub ice_candidates: Vec<TrickledCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NegotiationRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            offer: None,
            answer: None,
            ice_candidates: Vec::new(),
            updated_at: Some(Utc::now()),
        }
    }

    /// Append unless an identical entry is already present.
    pub fn push_candidate(&mut self, entry: TrickledCandidate) -> bool {
        if self.ice_candidates.contains(&entry) {
            return false;
        }
        self.ice_candidates.push(entry);
        self.updated_at = Some(Utc::now());
        true
    }

    pub fn set_description(&mut self, description: SessionDescription) {
        match description.sdp_type {
            SdpType::Offer => self.offer = Some(description),
            _ => self.answer = Some(description),
        }
        self.updated_at = Some(Utc::now());
    }

    /// The record a new session starts from: descriptions kept, candidates
    /// cleared.
    pub fn restarted(&self) -> Self {
        Self {
            id: self.id.clone(),
            offer: self.offer.clone(),
            answer: self.answer.clone(),
            ice_candidates: Vec::new(),
            updated_at: Some(Utc::now()),
        }
    }
}

/// Key-value backing for [`NegotiationRecord`]s. Implementations must keep
/// `append_candidate` and `set_description` atomic per key, since a session's
/// read loop and its engine callbacks update the same record concurrently.
#[async_trait]
pub trait NegotiationStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Full upsert.
    async fn store(&self, record: &NegotiationRecord) -> Result<(), StoreError>;

    async fn fetch(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError>;

    /// Append a remote candidate, preserving arrival order. Appending an entry
    /// already present is a no-op.
    async fn append_candidate(&self, key: &str, entry: &TrickledCandidate)
        -> Result<(), StoreError>;

    /// Overwrite `offer` or `answer` (chosen by the description's type).
    async fn set_description(
        &self,
        key: &str,
        description: &SessionDescription,
    ) -> Result<(), StoreError>;

    /// State to replay into a new peer handle for `key`.
    async fn recover(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        self.fetch(key).await
    }
}

/// Store handle shared by every session. Each call is bounded by a deadline
/// so a slow store degrades to an error instead of stalling signaling.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn NegotiationStore>,
    deadline: Duration,
}

impl Persistence {
    pub fn new(store: Arc<dyn NegotiationStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Deadline(self.deadline.as_millis() as u64)),
        }
    }

    pub async fn store(&self, record: &NegotiationRecord) -> Result<(), StoreError> {
        self.bounded(self.store.store(record)).await
    }

    pub async fn fetch(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        self.bounded(self.store.fetch(key)).await
    }

    pub async fn append_candidate(
        &self,
        key: &str,
        entry: &TrickledCandidate,
    ) -> Result<(), StoreError> {
        self.bounded(self.store.append_candidate(key, entry)).await
    }

    pub async fn set_description(
        &self,
        key: &str,
        description: &SessionDescription,
    ) -> Result<(), StoreError> {
        self.bounded(self.store.set_description(key, description))
            .await
    }

    pub async fn recover(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        self.bounded(self.store.recover(key)).await
    }
}

pub(crate) fn record_key(key: &str) -> String {
    format!("session:{}", key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailingStore, StallingStore};
    use crate::signaling::{IceCandidate, Target};

    fn entry(n: u32) -> TrickledCandidate {
        TrickledCandidate {
            candidate: IceCandidate {
                candidate: format!("candidate:{n} 1 udp 1 10.0.0.1 {n} typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            target: Target::Publish,
        }
    }

    #[test_timeout::timeout]
    fn push_candidate_skips_duplicates() {
        let mut record = NegotiationRecord::new("room:peer");
        assert!(record.push_candidate(entry(1)));
        assert!(record.push_candidate(entry(2)));
        assert!(!record.push_candidate(entry(1)));
        assert_eq!(record.ice_candidates, vec![entry(1), entry(2)]);
    }

    #[test_timeout::timeout]
    fn restarted_keeps_descriptions_and_clears_candidates() {
        let mut record = NegotiationRecord::new("room:peer");
        record.set_description(SessionDescription::offer("o"));
        record.set_description(SessionDescription::answer("a"));
        record.push_candidate(entry(1));
        let fresh = record.restarted();
        assert_eq!(fresh.offer, Some(SessionDescription::offer("o")));
        assert_eq!(fresh.answer, Some(SessionDescription::answer("a")));
        assert!(fresh.ice_candidates.is_empty());
    }

    #[test_timeout::timeout]
    fn record_tolerates_missing_fields() {
        let record: NegotiationRecord = serde_json::from_str(r#"{"id":"r:p"}"#).unwrap();
        assert_eq!(record.id, "r:p");
        assert!(record.offer.is_none());
        assert!(record.ice_candidates.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn deadline_bounds_slow_store() {
        let persistence = Persistence::new(Arc::new(StallingStore), Duration::from_millis(20));
        let err = persistence.fetch("r:p").await.unwrap_err();
        assert!(matches!(err, StoreError::Deadline(20)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn store_errors_pass_through() {
        let persistence = Persistence::new(Arc::new(FailingStore), Duration::from_secs(1));
        assert!(matches!(
            persistence.append_candidate("r:p", &entry(1)).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test_timeout::timeout]
    fn record_keys_are_prefixed() {
        assert_eq!(record_key("room-id:alice"), "session:room-id:alice");
    }
}
