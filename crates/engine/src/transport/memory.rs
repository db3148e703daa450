//! In-process chat network.
//!
//! Backs the engine in integration tests and local development: chats,
//! memberships and message history live in one shared table, and every
//! connected session gets its own push feed. The production MTProto adapter
//! implements the same [`SessionTransport`] contract.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use vox_common::{Result, VoxError};
use vox_store::models::SessionRow;

use super::{
    ChatInfo, ChatMessage, ChatPreview, ChatRef, JoinOutcome, SessionConnector, SessionTransport,
    SessionUpdate,
};

const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<NetInner>,
}

#[derive(Default)]
struct NetInner {
    chats: HashMap<i64, MemoryChat>,
    handles: HashMap<String, i64>,
    members: HashMap<i64, HashSet<i64>>,
    feeds: HashMap<i64, mpsc::Sender<SessionUpdate>>,
    pending_approvals: HashMap<i64, i64>,
    joins: u64,
    votes: Vec<(i64, i64, i64, usize)>,
    fail_history: bool,
}

struct MemoryChat {
    info: ChatInfo,
    requires_approval: bool,
    messages: BTreeMap<i64, ChatMessage>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_chat(&self, info: ChatInfo) {
        self.add_chat_inner(info, false);
    }

    /// Chats that answer joins with an approval-pending push flow.
    pub fn add_chat_with_approval(&self, info: ChatInfo) {
        self.add_chat_inner(info, true);
    }

    fn add_chat_inner(&self, info: ChatInfo, requires_approval: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(username) = &info.username {
            inner.handles.insert(username.clone(), info.id);
        }
        inner.chats.insert(
            info.id,
            MemoryChat {
                info,
                requires_approval,
                messages: BTreeMap::new(),
            },
        );
    }

    /// Pre-seeds a membership without going through a join.
    pub fn add_member(&self, session_id: i64, chat_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.members.entry(session_id).or_default().insert(chat_id);
    }

    /// Stores a message in the chat history and pushes it to every member.
    pub fn push_message(&self, message: ChatMessage) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(chat) = inner.chats.get_mut(&message.chat.id) {
            chat.messages.insert(message.id, message.clone());
        }
        deliver(&inner, SessionUpdate::Message(message));
    }

    /// Seeds history without push delivery (backfill sources).
    pub fn seed_history(&self, messages: Vec<ChatMessage>) {
        let mut inner = self.inner.lock().unwrap();
        for message in messages {
            if let Some(chat) = inner.chats.get_mut(&message.chat.id) {
                chat.messages.insert(message.id, message);
            }
        }
    }

    /// Resolves a pending approval: grants membership and pushes the
    /// confirmation to the requesting session.
    pub fn approve_join(&self, chat_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(session_id) = inner.pending_approvals.remove(&chat_id) else {
            return;
        };

        inner.members.entry(session_id).or_default().insert(chat_id);
        inner.joins += 1;

        let title = match inner.chats.get(&chat_id) {
            Some(chat) => chat.info.title.clone(),
            None => return,
        };

        if let Some(feed) = inner.feeds.get(&session_id) {
            let _ = feed.try_send(SessionUpdate::JoinConfirmation { chat_id, title });
        }
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.inner.lock().unwrap().fail_history = fail;
    }

    pub fn join_count(&self) -> u64 {
        self.inner.lock().unwrap().joins
    }

    pub fn votes(&self) -> Vec<(i64, i64, i64, usize)> {
        self.inner.lock().unwrap().votes.clone()
    }

    pub fn members_of(&self, chat_id: i64) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<i64> = inner
            .members
            .iter()
            .filter(|(_, chats)| chats.contains(&chat_id))
            .map(|(session, _)| *session)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn connect_session(
        self: &Arc<Self>,
        session_id: i64,
    ) -> (Arc<dyn SessionTransport>, mpsc::Receiver<SessionUpdate>) {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);

        let mut inner = self.inner.lock().unwrap();
        inner.feeds.insert(session_id, tx);
        inner.members.entry(session_id).or_default();
        drop(inner);

        let transport = Arc::new(MemoryTransport {
            network: Arc::clone(self),
            session_id,
        });
        (transport, rx)
    }
}

fn deliver(inner: &NetInner, update: SessionUpdate) {
    let chat_id = match &update {
        SessionUpdate::Message(message) => message.chat.id,
        SessionUpdate::JoinConfirmation { chat_id, .. } => *chat_id,
    };

    for (session_id, chats) in &inner.members {
        if chats.contains(&chat_id) {
            if let Some(feed) = inner.feeds.get(session_id) {
                let _ = feed.try_send(update.clone());
            }
        }
    }
}

struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    session_id: i64,
}

impl MemoryTransport {
    fn lookup(inner: &NetInner, chat: &ChatRef) -> Result<i64> {
        match chat {
            ChatRef::Id(id) => Ok(*id),
            ChatRef::Handle(handle) => {
                let handle = handle.trim_start_matches('@');
                inner
                    .handles
                    .get(handle)
                    .copied()
                    .ok_or_else(|| VoxError::not_found(format!("chat {handle}")))
            }
        }
    }
}

#[async_trait]
impl SessionTransport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn dialogs(&self) -> Result<Vec<i64>> {
        let inner = self.network.inner.lock().unwrap();
        Ok(inner
            .members
            .get(&self.session_id)
            .map(|chats| chats.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn resolve_chat(&self, chat: &ChatRef) -> Result<ChatPreview> {
        let inner = self.network.inner.lock().unwrap();
        let chat_id = Self::lookup(&inner, chat)?;
        let entry = inner
            .chats
            .get(&chat_id)
            .ok_or_else(|| VoxError::not_found(format!("chat {chat_id}")))?;

        let is_member = inner
            .members
            .get(&self.session_id)
            .is_some_and(|chats| chats.contains(&chat_id));

        Ok(ChatPreview {
            info: entry.info.clone(),
            is_member,
        })
    }

    async fn join_chat(&self, chat: &ChatRef) -> Result<JoinOutcome> {
        let mut inner = self.network.inner.lock().unwrap();
        let chat_id = Self::lookup(&inner, chat)?;

        let already_member = inner
            .members
            .get(&self.session_id)
            .is_some_and(|chats| chats.contains(&chat_id));

        let entry = inner
            .chats
            .get(&chat_id)
            .ok_or_else(|| VoxError::not_found(format!("chat {chat_id}")))?;
        let info = entry.info.clone();

        if entry.requires_approval && !already_member {
            inner.pending_approvals.insert(chat_id, self.session_id);
            return Ok(JoinOutcome::ApprovalPending);
        }

        inner
            .members
            .entry(self.session_id)
            .or_default()
            .insert(chat_id);
        if !already_member {
            inner.joins += 1;
        }

        Ok(JoinOutcome::Joined(info))
    }

    async fn leave_chat(&self, chat_id: i64) -> Result<()> {
        let mut inner = self.network.inner.lock().unwrap();
        if let Some(chats) = inner.members.get_mut(&self.session_id) {
            chats.remove(&chat_id);
        }
        Ok(())
    }

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<ChatMessage>> {
        let inner = self.network.inner.lock().unwrap();
        Ok(inner
            .chats
            .get(&chat_id)
            .and_then(|chat| chat.messages.get(&message_id).cloned()))
    }

    async fn get_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<Vec<Option<ChatMessage>>> {
        let inner = self.network.inner.lock().unwrap();
        let chat = inner.chats.get(&chat_id);
        Ok(message_ids
            .iter()
            .map(|id| chat.and_then(|c| c.messages.get(id).cloned()))
            .collect())
    }

    async fn get_history(
        &self,
        chat_id: i64,
        offset_id: i64,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let inner = self.network.inner.lock().unwrap();
        if inner.fail_history {
            return Err(VoxError::transport("history temporarily unavailable"));
        }

        let Some(chat) = inner.chats.get(&chat_id) else {
            return Ok(Vec::new());
        };

        Ok(chat
            .messages
            .values()
            .rev()
            .filter(|m| offset_id == 0 || m.id < offset_id)
            .filter(|m| m.id > min_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn vote_poll(&self, chat_id: i64, message_id: i64, option: usize) -> Result<()> {
        let mut inner = self.network.inner.lock().unwrap();
        inner.votes.push((self.session_id, chat_id, message_id, option));
        Ok(())
    }
}

/// Connector handing out [`MemoryTransport`] sessions keyed by session id.
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

impl MemoryConnector {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl SessionConnector for MemoryConnector {
    async fn connect(
        &self,
        session: &SessionRow,
    ) -> Result<(Arc<dyn SessionTransport>, mpsc::Receiver<SessionUpdate>)> {
        Ok(self.network.connect_session(session.id))
    }
}
