//! Redis-backed negotiation store against a live server.
//!
//! Ignored by default. To run it locally:
//! - Start Redis (e.g., `docker run --rm -p 6379:6379 redis:7`)
//! - Export `REDIS_URL` (defaults to `redis://127.0.0.1:6379`)
//! - Run: `cargo test -p signal-relay --test redis_store -- --ignored`

use std::sync::Arc;

use signal_relay::{
    signaling::{IceCandidate, SessionDescription, Target, TrickledCandidate},
    storage::{NegotiationRecord, NegotiationStore, RedisStore},
};
use uuid::Uuid;

async fn store() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    RedisStore::connect(&url, 60).await.expect("connect to redis")
}

fn entry(n: usize, target: Target) -> TrickledCandidate {
    TrickledCandidate {
        candidate: IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
        target,
    }
}

fn key() -> String {
    format!("test-room:{}", Uuid::new_v4())
}

#[ignore]
#[tokio::test]
async fn append_keeps_order_and_skips_duplicates() {
    let store = store().await;
    let key = key();

    for n in 0..4 {
        store
            .append_candidate(&key, &entry(n, Target::Publish))
            .await
            .unwrap();
    }
    store
        .append_candidate(&key, &entry(1, Target::Publish))
        .await
        .unwrap();
    // Same candidate on the other leg is a different entry.
    store
        .append_candidate(&key, &entry(1, Target::Subscribe))
        .await
        .unwrap();

    let record = store.recover(&key).await.unwrap().unwrap();
    assert_eq!(record.id, key);
    let expected = vec![
        entry(0, Target::Publish),
        entry(1, Target::Publish),
        entry(2, Target::Publish),
        entry(3, Target::Publish),
        entry(1, Target::Subscribe),
    ];
    assert_eq!(record.ice_candidates, expected);
}

#[ignore]
#[tokio::test]
async fn descriptions_and_candidates_do_not_clobber_each_other() {
    let store = Arc::new(store().await);
    let key = key();

    let mut tasks = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            if n % 4 == 0 {
                store
                    .set_description(&key, &SessionDescription::answer(format!("v=0 {n}")))
                    .await
            } else {
                store.append_candidate(&key, &entry(n, Target::Publish)).await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = store.fetch(&key).await.unwrap().unwrap();
    assert_eq!(record.ice_candidates.len(), 12);
    assert!(record.answer.is_some());
}

#[ignore]
#[tokio::test]
async fn store_overwrites_and_empty_lists_survive() {
    let store = store().await;
    let key = key();

    store
        .set_description(&key, &SessionDescription::offer("v=0 offer"))
        .await
        .unwrap();
    let record = store.fetch(&key).await.unwrap().unwrap();
    assert!(record.ice_candidates.is_empty());

    let mut fresh = NegotiationRecord::new(key.clone());
    fresh.set_description(SessionDescription::answer("v=0 answer"));
    store.store(&fresh).await.unwrap();
    let record = store.fetch(&key).await.unwrap().unwrap();
    assert!(record.offer.is_none());
    assert_eq!(record.answer, Some(SessionDescription::answer("v=0 answer")));
}

#[ignore]
#[tokio::test]
async fn username_fragment_distinguishes_entries() {
    let store = store().await;
    let key = key();

    let mut restarted = entry(1, Target::Publish);
    restarted.candidate.username_fragment = Some("ufrag-2".into());
    for candidate in [entry(1, Target::Publish), restarted.clone(), restarted] {
        store.append_candidate(&key, &candidate).await.unwrap();
    }

    let record = store.fetch(&key).await.unwrap().unwrap();
    assert_eq!(record.ice_candidates.len(), 2);
}
