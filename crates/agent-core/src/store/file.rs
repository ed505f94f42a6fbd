use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{sort_summaries, SessionMutator, SessionSeed, SessionStore, SessionStoreConfig};
use crate::error::{AgentError, Result};
use crate::session::{Session, SessionId, SessionSummary};

const EXTENSION: &str = "json";

/// File-backed session store: one `{id}.json` per session
///
/// Writes go to a temporary sibling and are renamed into place, so a crash
/// never leaves a half-written session file. A per-id lock table gives the
/// single-writer-per-key discipline within this process; an entry lives only
/// while some caller holds or waits on it.
pub struct FileSessionStore {
    base_dir: PathBuf,
    config: SessionStoreConfig,
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl FileSessionStore {
    /// Open (creating if needed) a store rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>, config: SessionStoreConfig) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| store_fault("create session directory", &base_dir, &e))?;
        tracing::info!(dir = %base_dir.display(), "File session store ready");
        Ok(Self {
            base_dir,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, id: &SessionId) -> Result<PathBuf> {
        if !id.is_valid_key() {
            return Err(AgentError::SessionNotFound(id.to_string()));
        }
        Ok(self.base_dir.join(format!("{}.{}", id.as_str(), EXTENSION)))
    }

    /// Run `f` holding the id's lock, then drop the table entry if nobody
    /// else is waiting on it
    async fn with_lock<T, F, Fut>(&self, id: &SessionId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = Arc::clone(self.locks.lock().await.entry(id.clone()).or_default());
        let outcome = {
            let _guard = lock.lock().await;
            f().await
        };
        drop(lock);

        let mut locks = self.locks.lock().await;
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
        outcome
    }

    #[cfg(test)]
    async fn lock_entries(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn read(&self, id: &SessionId, path: &Path) -> Result<Session> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AgentError::SessionNotFound(id.to_string()));
            }
            Err(e) => return Err(store_fault("read session", path, &e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            AgentError::SessionStore(format!("decode session {}: {}", path.display(), e))
        })
    }

    /// Read a live session, evicting it if it expired. Caller holds the id lock.
    async fn read_live(&self, id: &SessionId, path: &Path) -> Result<Session> {
        let session = self.read(id, path).await?;
        if session.is_expired(Utc::now(), self.config.ttl) {
            self.remove_file(path).await?;
            tracing::debug!(session_id = %id, "Evicted expired session");
            return Err(AgentError::SessionNotFound(id.to_string()));
        }
        Ok(session)
    }

    async fn write(&self, session: &Session, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| AgentError::SessionStore(format!("encode session: {}", e)))?;
        let tmp = path.with_extension(format!("{}.tmp-{}", EXTENSION, uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| store_fault("write session", &tmp, &e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(store_fault("commit session", path, &e));
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_fault("remove session", path, &e)),
        }
    }

    async fn insert(&self, session: Session) -> Result<Session> {
        let path = self.path_for(&session.id)?;
        let id = session.id.clone();
        self.with_lock(&id, || async move {
            let exists = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| store_fault("stat session", &path, &e))?;
            if exists {
                return Err(AgentError::SessionExists(session.id.to_string()));
            }
            self.write(&session, &path).await?;
            Ok(session)
        })
        .await
    }

    /// Session ids of every committed file in the directory
    async fn stored_ids(&self) -> Result<Vec<SessionId>> {
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| store_fault("list sessions", &self.base_dir, &e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_fault("list sessions", &self.base_dir, &e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let id = SessionId::from_string(stem);
                if id.is_valid_key() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

fn store_fault(action: &str, path: &Path, err: &std::io::Error) -> AgentError {
    AgentError::SessionStore(format!("{} {}: {}", action, path.display(), err))
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, id: &SessionId) -> Result<Session> {
        let path = self.path_for(id)?;
        self.with_lock(id, || self.read_live(id, &path)).await
    }

    async fn create(&self, seed: SessionSeed) -> Result<Session> {
        self.insert(seed.into_session(SessionId::new())).await
    }

    async fn create_with_id(&self, id: SessionId, seed: SessionSeed) -> Result<Session> {
        self.insert(seed.into_session(id)).await
    }

    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> Result<Session> {
        let path = self.path_for(id)?;
        self.with_lock(id, || async move {
            let mut session = self.read_live(id, &path).await?;
            mutator(&mut session);
            self.write(&session, &path).await?;
            Ok(session)
        })
        .await
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        let Ok(path) = self.path_for(id) else {
            return Ok(false);
        };
        self.with_lock(id, || self.remove_file(&path)).await
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for id in self.stored_ids().await? {
            let Ok(path) = self.path_for(&id) else { continue };
            let evicted = self
                .with_lock(&id, || async {
                    match self.read(&id, &path).await {
                        Ok(session) if session.is_expired(now, self.config.ttl) => self.remove_file(&path).await,
                        Ok(_) | Err(AgentError::SessionNotFound(_)) => Ok(false),
                        Err(e) => {
                            tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session");
                            Ok(false)
                        }
                    }
                })
                .await?;
            if evicted {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn list(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let now = Utc::now();
        let mut summaries = Vec::new();
        for id in self.stored_ids().await? {
            let Ok(path) = self.path_for(&id) else { continue };
            match self.read(&id, &path).await {
                Ok(session) if !session.is_expired(now, self.config.ttl) => {
                    summaries.push(session.summary());
                }
                Ok(_) | Err(AgentError::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(sort_summaries(summaries, limit))
    }
}
