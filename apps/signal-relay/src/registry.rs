use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metrics;
use crate::session::{Session, SessionKey};

/// Live sessions by key.
///
/// Creation, eviction and release for one key are serialized by a lock scoped
/// to that key, so unrelated clients never wait on each other.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<Session>>,
    key_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_lock(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.key_locks.entry(key.clone()).or_default().clone()
    }

    fn release_key_lock(&self, key: &SessionKey) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Register the session produced by `build` under `key`.
    ///
    /// Any session already registered under `key` is torn down (connection
    /// closed, peer released, record writes drained) before `build` runs, and
    /// the new session only becomes visible to [`get`](Self::get) once `build`
    /// succeeds.
    pub async fn create<F, Fut, E>(&self, key: SessionKey, build: F) -> Result<Arc<Session>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>, E>>,
    {
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            if let Some((_, prior)) = self.sessions.remove(&key) {
                info!(
                    session = %key,
                    connection = %prior.connection_id(),
                    "evicting session superseded by a new connection"
                );
                metrics::EVICTIONS.inc();
                prior.teardown().await;
                prior.settled().await;
            }
            let built = build().await;
            if let Ok(session) = &built {
                self.sessions.insert(key.clone(), session.clone());
            }
            built
        };
        drop(lock);
        self.release_key_lock(&key);
        metrics::SESSIONS_ACTIVE.set(self.sessions.len() as i64);
        result
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Remove and tear down whatever session is registered under `key`.
    pub async fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let lock = self.key_lock(key);
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.sessions.remove(key).map(|(_, session)| session);
            if let Some(session) = &removed {
                session.teardown().await;
                session.settled().await;
            }
            removed
        };
        drop(lock);
        self.release_key_lock(key);
        metrics::SESSIONS_ACTIVE.set(self.sessions.len() as i64);
        removed
    }

    /// Natural close of `session`. Unregisters it only if it is still the
    /// registered session for its key (an evicting successor stays put), and
    /// tears it down unless eviction already did. Returns `true` if this call
    /// performed the teardown.
    pub async fn release(&self, session: &Arc<Session>) -> bool {
        let key = session.key();
        let lock = self.key_lock(key);
        let (unregistered, released) = {
            let _guard = lock.lock().await;
            let unregistered = self
                .sessions
                .remove_if(key, |_, current| Arc::ptr_eq(current, session))
                .is_some();
            let released = session.teardown().await;
            session.settled().await;
            (unregistered, released)
        };
        drop(lock);
        self.release_key_lock(key);
        debug!(session = %key, unregistered, released, "session released");
        metrics::SESSIONS_ACTIVE.set(self.sessions.len() as i64);
        released
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
