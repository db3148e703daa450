//! The per-shard session fleet.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use vox_common::{Config, Result, VoxError};
use vox_store::models::SessionRow;
use vox_store::Store;

use crate::session::SessionClient;
use crate::transport::{ChatMessage, SessionConnector, SessionUpdate};

const DISCOVER_TTL: Duration = Duration::from_secs(60);
const DISCOVER_CACHE_SIZE: u64 = 500;

pub struct SessionPool {
    sessions: Vec<Arc<SessionClient>>,
    /// Serialises the TTL-cache check-and-insert for discover.
    discover_guard: Mutex<()>,
    discover_cache: moka::future::Cache<String, ()>,
    /// Update feeds handed out once to the engine's consumer tasks.
    feeds: StdMutex<Vec<(usize, mpsc::Receiver<SessionUpdate>)>>,
}

impl SessionPool {
    /// Loads the shard's sessions from the store: mode-selected table,
    /// ordered by id, broken ids excluded, first `ACTIVE_BOTS_COUNT` taken.
    /// Coming up short is a fatal startup error.
    pub async fn load(
        config: &Config,
        store: &dyn Store,
        connector: &dyn SessionConnector,
    ) -> Result<Self> {
        let table = config.mode.session_table();
        info!("loading sessions from table {table}");

        let rows = store.load_sessions(table, config.shard).await?;
        let broken: HashSet<i64> = store
            .load_broken_sessions()
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        let active: Vec<SessionRow> = rows
            .into_iter()
            .filter(|row| !broken.contains(&row.id))
            .take(config.active_sessions)
            .collect();

        if active.len() < config.active_sessions {
            return Err(VoxError::Startup(format!(
                "not enough usable sessions for shard {}: {} of {}",
                config.shard,
                active.len(),
                config.active_sessions
            )));
        }

        let mut sessions = Vec::with_capacity(active.len());
        let mut feeds = Vec::with_capacity(active.len());
        for (index, row) in active.iter().enumerate() {
            let (transport, feed) = connector.connect(row).await?;
            transport.start().await?;
            sessions.push(Arc::new(SessionClient::new(index, row, transport, config)));
            feeds.push((index, feed));
            info!("loaded session {}", row.name);
        }

        Ok(Self::assemble(sessions, feeds, DISCOVER_TTL))
    }

    pub(crate) fn assemble(
        sessions: Vec<Arc<SessionClient>>,
        feeds: Vec<(usize, mpsc::Receiver<SessionUpdate>)>,
        discover_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            discover_guard: Mutex::new(()),
            discover_cache: moka::future::Cache::builder()
                .max_capacity(DISCOVER_CACHE_SIZE)
                .time_to_live(discover_ttl)
                .build(),
            feeds: StdMutex::new(feeds),
        }
    }

    pub fn sessions(&self) -> &[Arc<SessionClient>] {
        &self.sessions
    }

    pub fn get(&self, index: usize) -> Option<&Arc<SessionClient>> {
        self.sessions.get(index)
    }

    /// Sum of cached subscribed-set sizes across the shard.
    pub async fn known_chats_count(&self) -> Result<usize> {
        let mut total = 0;
        for session in &self.sessions {
            total += session.subscribed_count().await?;
        }
        Ok(total)
    }

    /// Rebuilds every session's subscribed-set from live dialogs; per-session
    /// failures are logged and skipped.
    pub async fn refresh_subscribed(&self) {
        for session in &self.sessions {
            if let Err(err) = session.refresh_subscribed().await {
                error!("failed to refresh dialogs of session {}: {err}", session.name);
            }
        }
    }

    /// Enters the join string into the TTL cache; a repeat entry while live
    /// fails with `AlreadyJoined`.
    pub async fn reserve_discover(&self, join_string: &str) -> Result<()> {
        let _guard = self.discover_guard.lock().await;
        if self.discover_cache.contains_key(join_string) {
            return Err(VoxError::AlreadyJoined);
        }
        self.discover_cache.insert(join_string.to_string(), ()).await;
        Ok(())
    }

    /// Picks a session with probability inversely proportional to its load.
    pub async fn pick_session(&self) -> Result<Arc<SessionClient>> {
        let mut sizes = Vec::with_capacity(self.sessions.len());
        for session in &self.sessions {
            sizes.push(session.subscribed_count().await?);
        }
        let total: usize = sizes.iter().sum();

        let weights: Vec<f64> = sizes
            .iter()
            .map(|&own| total.max(1) as f64 / own.max(1) as f64)
            .collect();

        let index = {
            let dist = WeightedIndex::new(&weights)
                .map_err(|err| VoxError::transport(format!("session weights: {err}")))?;
            dist.sample(&mut rand::thread_rng())
        };

        Ok(Arc::clone(&self.sessions[index]))
    }

    /// Routes a batch fetch to the named session.
    pub async fn get_messages(
        &self,
        session_index: usize,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<Vec<Option<ChatMessage>>> {
        let session = self
            .get(session_index)
            .ok_or_else(|| VoxError::bad_request(format!("unknown session index {session_index}")))?;
        session.get_messages(chat_id, message_ids).await
    }

    /// Hands the update feeds to the engine's consumer tasks. Each feed is
    /// taken at most once.
    pub fn take_update_feeds(&self) -> Vec<(usize, mpsc::Receiver<SessionUpdate>)> {
        std::mem::take(&mut *self.feeds.lock().unwrap())
    }

    pub async fn stop(&self) {
        for session in &self.sessions {
            if let Err(err) = session.stop().await {
                error!("failed to stop session {}: {err}", session.name);
            }
        }
    }
}
