//! Per-session wrapper over the raw transport.
//!
//! Adds the subscribed-set cache, the history rate limit, the short message
//! LRU and the join-approval wait table. One wrapper per session; limiters are
//! never shared across sessions.

use std::collections::{HashMap, HashSet};
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use lru::LruCache;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use vox_common::{Config, Result, VoxError};
use vox_store::models::SessionRow;

use crate::transport::{
    ChatInfo, ChatKind, ChatMessage, ChatPreview, ChatRef, JoinOutcome, SessionTransport,
};

const HISTORY_CALLS_PER_SECOND: u32 = 2;
const MESSAGE_CACHE_SIZE: usize = 256;
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SessionClient {
    pub index: usize,
    pub id: i64,
    pub name: String,

    transport: Arc<dyn SessionTransport>,
    /// None until primed from live dialogs.
    subscribed: Mutex<Option<HashSet<i64>>>,
    history_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    /// Joins awaiting admin approval, keyed by chat title. Duplicate titles
    /// within the window are an accepted loss.
    invite_waits: Mutex<HashMap<String, oneshot::Sender<i64>>>,
    message_cache: StdMutex<LruCache<(i64, i64), ChatMessage>>,

    max_chats: usize,
    min_chat_members: i64,
    min_channel_members: i64,
}

impl SessionClient {
    pub fn new(
        index: usize,
        row: &SessionRow,
        transport: Arc<dyn SessionTransport>,
        config: &Config,
    ) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(HISTORY_CALLS_PER_SECOND).unwrap());
        let cache_size = NonZeroUsize::new(MESSAGE_CACHE_SIZE).unwrap();

        Self {
            index,
            id: row.id,
            name: row.name.clone(),
            transport,
            subscribed: Mutex::new(None),
            history_limiter: RateLimiter::direct(quota),
            invite_waits: Mutex::new(HashMap::new()),
            message_cache: StdMutex::new(LruCache::new(cache_size)),
            max_chats: config.max_chats_per_session,
            min_chat_members: config.min_chat_members,
            min_channel_members: config.min_channel_members,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        self.transport.stop().await
    }

    /// Snapshot of the subscribed-set cache, primed from live dialogs on first
    /// access.
    pub async fn subscribed_chats(&self) -> Result<HashSet<i64>> {
        let mut guard = self.subscribed.lock().await;
        if guard.is_none() {
            let dialogs = self.transport.dialogs().await?;
            *guard = Some(dialogs.into_iter().collect());
        }
        Ok(guard.as_ref().unwrap().clone())
    }

    /// Rebuilds the cache from live dialogs.
    pub async fn refresh_subscribed(&self) -> Result<usize> {
        let dialogs = self.transport.dialogs().await?;
        let set: HashSet<i64> = dialogs.into_iter().collect();
        let count = set.len();
        *self.subscribed.lock().await = Some(set);
        Ok(count)
    }

    pub async fn is_subscribed(&self, chat_id: i64) -> Result<bool> {
        Ok(self.subscribed_chats().await?.contains(&chat_id))
    }

    pub async fn subscribed_count(&self) -> Result<usize> {
        Ok(self.subscribed_chats().await?.len())
    }

    /// Records a subscription observed out of band (only once primed; an
    /// unprimed cache picks it up from dialogs anyway).
    pub async fn mark_subscribed(&self, chat_id: i64) {
        if let Some(set) = self.subscribed.lock().await.as_mut() {
            set.insert(chat_id);
        }
    }

    pub async fn join(&self, chat: &ChatRef) -> Result<ChatInfo> {
        if self.subscribed_count().await? >= self.max_chats {
            return Err(VoxError::MaxChatsExceeded);
        }

        info!("session {}: joining {chat}", self.name);
        match self.transport.join_chat(chat).await? {
            JoinOutcome::Joined(info) => {
                self.mark_subscribed(info.id).await;
                Ok(info)
            }
            JoinOutcome::ApprovalPending => Err(VoxError::transport(format!(
                "join of {chat} requires approval"
            ))),
        }
    }

    /// Resolves and joins a chat preview. Returns None when the chat is below
    /// the member threshold (unless `ignore_protection`). Ownership handling
    /// is the registry's job; this only gets the session inside the chat.
    pub async fn discover(
        &self,
        chat: &ChatRef,
        ignore_protection: bool,
    ) -> Result<Option<ChatInfo>> {
        info!("session {}: discovering chat {chat}", self.name);
        let preview = self.transport.resolve_chat(chat).await?;
        debug!("chat title {}", preview.info.title);

        if !ignore_protection {
            let min_members = match preview.info.kind {
                ChatKind::Channel => self.min_channel_members,
                _ => self.min_chat_members,
            };
            if preview.info.members_count < min_members {
                info!("not enough members to join {chat}, skip");
                return Ok(None);
            }
        }

        if preview.is_member {
            return Ok(Some(preview.info));
        }

        let info = self.join_with_approval(chat, &preview).await?;
        Ok(Some(info))
    }

    async fn join_with_approval(&self, chat: &ChatRef, preview: &ChatPreview) -> Result<ChatInfo> {
        if self.subscribed_count().await? >= self.max_chats {
            return Err(VoxError::MaxChatsExceeded);
        }

        match self.transport.join_chat(chat).await? {
            JoinOutcome::Joined(info) => {
                self.mark_subscribed(info.id).await;
                Ok(info)
            }
            JoinOutcome::ApprovalPending => {
                info!("waiting for approval of {}", preview.info.title);
                let (tx, rx) = oneshot::channel();
                self.invite_waits
                    .lock()
                    .await
                    .insert(preview.info.title.clone(), tx);

                let outcome = tokio::time::timeout(APPROVAL_TIMEOUT, rx).await;
                self.invite_waits.lock().await.remove(&preview.info.title);

                match outcome {
                    Ok(Ok(chat_id)) => {
                        self.mark_subscribed(chat_id).await;
                        let resolved = self.transport.resolve_chat(&ChatRef::Id(chat_id)).await?;
                        Ok(resolved.info)
                    }
                    _ => Err(VoxError::Timeout(format!(
                        "approval of {}",
                        preview.info.title
                    ))),
                }
            }
        }
    }

    /// Completes a parked approval wait when the confirmation push arrives.
    pub async fn resolve_invite(&self, title: &str, chat_id: i64) {
        if let Some(waiter) = self.invite_waits.lock().await.remove(title) {
            info!("got confirmation for {title}");
            let _ = waiter.send(chat_id);
        }
    }

    pub async fn leave(&self, chat_id: i64) -> Result<()> {
        info!("session {}: leaving {chat_id}", self.name);
        self.transport.leave_chat(chat_id).await?;
        if let Some(set) = self.subscribed.lock().await.as_mut() {
            set.remove(&chat_id);
        }
        Ok(())
    }

    pub async fn resolve_chat(&self, chat: &ChatRef) -> Result<ChatPreview> {
        self.transport.resolve_chat(chat).await
    }

    /// Rate-limited reverse-paginated history window.
    pub async fn get_history(
        &self,
        chat_id: i64,
        offset_id: i64,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        self.history_limiter.until_ready().await;
        self.transport
            .get_history(chat_id, offset_id, min_id, limit)
            .await
    }

    /// Uncached single fetch (fresh reactions and views).
    pub async fn fetch_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChatMessage>> {
        self.transport.get_message(chat_id, message_id).await
    }

    /// Single fetch through the per-session LRU.
    pub async fn get_message_cached(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChatMessage>> {
        if let Some(hit) = self
            .message_cache
            .lock()
            .unwrap()
            .get(&(chat_id, message_id))
            .cloned()
        {
            return Ok(Some(hit));
        }

        let fetched = self.transport.get_message(chat_id, message_id).await?;
        if let Some(message) = &fetched {
            self.message_cache
                .lock()
                .unwrap()
                .put((chat_id, message_id), message.clone());
        }
        Ok(fetched)
    }

    pub async fn get_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<Vec<Option<ChatMessage>>> {
        self.transport.get_messages(chat_id, message_ids).await
    }

    pub async fn vote_poll(&self, chat_id: i64, message_id: i64, option: usize) -> Result<()> {
        self.transport.vote_poll(chat_id, message_id, option).await
    }
}
