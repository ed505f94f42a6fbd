//! Session Persistence
//!
//! A keyed store from [`SessionId`] to [`Session`] with a single-writer-per-key
//! contract: `update` is an atomic read-modify-write, serialized per id.
//! Sessions idle longer than the configured TTL read as `SessionNotFound`
//! and are evicted lazily; [`spawn_sweeper`] removes them in the background.

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;
use crate::session::{Session, SessionId, SessionMetadata, SessionSummary};

/// In-place edit applied under the session's write lock
pub type SessionMutator = Box<dyn FnOnce(&mut Session) + Send>;

/// Store configuration
#[derive(Clone, Debug)]
pub struct SessionStoreConfig {
    /// Inactivity period after which a session expires
    pub ttl: chrono::Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::minutes(60),
        }
    }
}

impl SessionStoreConfig {
    /// TTL from a std duration, saturating at chrono's range
    pub fn with_ttl(ttl: std::time::Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }
}

/// Initial contents of a freshly created session
#[derive(Clone, Debug, Default)]
pub struct SessionSeed {
    /// Always-kept instruction message stored as the first message
    pub system_prompt: Option<String>,
    pub metadata: SessionMetadata,
}

impl SessionSeed {
    pub fn into_session(self, id: SessionId) -> Session {
        let mut session = Session::with_id(id);
        if let Some(prompt) = self.system_prompt {
            session.conversation.push(Message::system(prompt));
        }
        session.metadata = self.metadata;
        session
    }
}

/// Session store trait for persistence
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a live session; unknown or expired ids are `SessionNotFound`
    async fn get(&self, id: &SessionId) -> Result<Session>;

    /// Create a session under a fresh unique id
    async fn create(&self, seed: SessionSeed) -> Result<Session>;

    /// Create a session under a caller-chosen id; `SessionExists` if taken
    async fn create_with_id(&self, id: SessionId, seed: SessionSeed) -> Result<Session>;

    /// Atomic read-modify-write, returns the updated session
    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> Result<Session>;

    /// Remove a session, returns whether it existed
    async fn delete(&self, id: &SessionId) -> Result<bool>;

    /// Remove sessions idle past the TTL at `now`, returns how many
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Live sessions, most recently active first
    async fn list(&self, limit: usize) -> Result<Vec<SessionSummary>>;
}

/// Periodically sweep expired sessions until the handle is aborted
pub fn spawn_sweeper(
    store: Arc<dyn SessionStore>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Swept expired sessions"),
                Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
            }
        }
    })
}

fn sort_summaries(mut summaries: Vec<SessionSummary>, limit: usize) -> Vec<SessionSummary> {
    summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    summaries.truncate(limit);
    summaries
}
