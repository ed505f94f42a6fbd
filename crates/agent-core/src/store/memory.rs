use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{sort_summaries, SessionMutator, SessionSeed, SessionStore, SessionStoreConfig};
use crate::error::{AgentError, Result};
use crate::session::{Session, SessionId, SessionSummary};

type Slot = Arc<Mutex<Session>>;

/// In-memory session store
///
/// Each session sits behind its own mutex; the outer map lock is only held
/// long enough to look up or insert a slot.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Slot>>,
    config: SessionStoreConfig,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(SessionStoreConfig::default())
    }
}

impl MemorySessionStore {
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    async fn slot(&self, id: &SessionId) -> Result<Slot> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    /// Drop `slot` from the map if it is still the one registered under `id`
    async fn evict(&self, id: &SessionId, slot: &Slot) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            sessions.remove(id);
            tracing::debug!(session_id = %id, "Evicted expired session");
        }
    }

    async fn insert(&self, session: Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(AgentError::SessionExists(session.id.to_string()));
        }
        sessions.insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        Ok(session)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &SessionId) -> Result<Session> {
        let slot = self.slot(id).await?;
        let session = slot.lock().await.clone();
        if session.is_expired(Utc::now(), self.config.ttl) {
            self.evict(id, &slot).await;
            return Err(AgentError::SessionNotFound(id.to_string()));
        }
        Ok(session)
    }

    async fn create(&self, seed: SessionSeed) -> Result<Session> {
        self.insert(seed.into_session(SessionId::new())).await
    }

    async fn create_with_id(&self, id: SessionId, seed: SessionSeed) -> Result<Session> {
        if !id.is_valid_key() {
            return Err(AgentError::SessionNotFound(id.to_string()));
        }
        self.insert(seed.into_session(id)).await
    }

    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> Result<Session> {
        let slot = self.slot(id).await?;
        let mut session = slot.lock().await;

        // Deleted or replaced while we waited for the lock
        let still_current = self
            .sessions
            .read()
            .await
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_current {
            return Err(AgentError::SessionNotFound(id.to_string()));
        }

        if session.is_expired(Utc::now(), self.config.ttl) {
            drop(session);
            self.evict(id, &slot).await;
            return Err(AgentError::SessionNotFound(id.to_string()));
        }

        mutator(&mut *session);
        Ok(session.clone())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let ttl = self.config.ttl;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        // A locked slot is mid-update, so it is not idle
        sessions.retain(|_, slot| match slot.try_lock() {
            Ok(session) => !session.is_expired(now, ttl),
            Err(_) => true,
        });
        Ok(before - sessions.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let slots: Vec<Slot> = self.sessions.read().await.values().cloned().collect();
        let now = Utc::now();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let session = slot.lock().await;
            if !session.is_expired(now, self.config.ttl) {
                summaries.push(session.summary());
            }
        }
        Ok(sort_summaries(summaries, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn short_ttl() -> SessionStoreConfig {
        SessionStoreConfig {
            ttl: chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemorySessionStore::default();
        let session = store.create(SessionSeed::default()).await.unwrap();

        let loaded = store.get(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);

        assert!(store.delete(&session.id).await.unwrap());
        assert!(!store.delete(&session.id).await.unwrap());
        assert!(matches!(
            store.get(&session.id).await,
            Err(AgentError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_seed_system_prompt_is_first_message() {
        let store = MemorySessionStore::default();
        let seed = SessionSeed {
            system_prompt: Some("You are a weather assistant.".into()),
            ..Default::default()
        };
        let session = store.create(seed).await.unwrap();
        assert_eq!(
            session.conversation.system_prompt().unwrap().content,
            "You are a weather assistant."
        );
    }

    #[tokio::test]
    async fn test_create_with_id_rejects_duplicates_and_bad_keys() {
        let store = MemorySessionStore::default();
        let id = SessionId::from_string("client-chosen_1");
        store.create_with_id(id.clone(), SessionSeed::default()).await.unwrap();

        assert!(matches!(
            store.create_with_id(id, SessionSeed::default()).await,
            Err(AgentError::SessionExists(_))
        ));
        assert!(matches!(
            store
                .create_with_id(SessionId::from_string("no/slashes"), SessionSeed::default())
                .await,
            Err(AgentError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemorySessionStore::default();
        let result = store
            .update(&SessionId::from_string("missing"), Box::new(|s| s.turn_count += 1))
            .await;
        assert!(matches!(result, Err(AgentError::SessionNotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_serialized() {
        let store = Arc::new(MemorySessionStore::default());
        let id = store.create(SessionSeed::default()).await.unwrap().id;

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        &id,
                        Box::new(move |s| {
                            s.record_turn(vec![
                                Message::user(format!("q{i}")),
                                Message::assistant(format!("a{i}")),
                            ]);
                        }),
                    )
                    .await
                    .unwrap()
                    .turn_count
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=32).collect::<Vec<u32>>());

        let session = store.get(&id).await.unwrap();
        assert_eq!(session.turn_count, 32);
        assert_eq!(session.message_count(), 64);
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_not_found() {
        let store = MemorySessionStore::new(short_ttl());
        let id = store.create(SessionSeed::default()).await.unwrap().id;
        store
            .update(
                &id,
                Box::new(|s| s.last_activity = Utc::now() - chrono::Duration::minutes(10)),
            )
            .await
            .unwrap();

        assert!(matches!(store.get(&id).await, Err(AgentError::SessionNotFound(_))));
        // Lazily evicted
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_idle_sessions() {
        let store = MemorySessionStore::new(short_ttl());
        let idle = store.create(SessionSeed::default()).await.unwrap().id;
        let active = store.create(SessionSeed::default()).await.unwrap().id;

        let later = Utc::now() + chrono::Duration::minutes(10);
        store
            .update(&active, Box::new(move |s| s.last_activity = later))
            .await
            .unwrap();

        assert_eq!(store.sweep(later).await.unwrap(), 1);
        assert!(!store.delete(&idle).await.unwrap());
        assert!(store.delete(&active).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_orders_by_activity() {
        let store = MemorySessionStore::default();
        let first = store.create(SessionSeed::default()).await.unwrap().id;
        let second = store.create(SessionSeed::default()).await.unwrap().id;
        store
            .update(&first, Box::new(|s| s.last_activity += chrono::Duration::seconds(30)))
            .await
            .unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[1].id, second);
        assert_eq!(store.list(1).await.unwrap().len(), 1);
    }
}
