//! Capability surface of the underlying chat-network client.
//!
//! The engine never talks to the network directly; every session operates
//! through [`SessionTransport`]. The production MTProto adapter lives outside
//! this repository; [`memory::MemoryNetwork`] is the in-process implementation
//! used by tests and local development.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use vox_common::Result;
use vox_store::models::SessionRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Chat,
    Channel,
    Private,
    Bot,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Chat => "CHAT",
            ChatKind::Channel => "CHANNEL",
            ChatKind::Private => "PRIVATE",
            ChatKind::Bot => "BOT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    pub invite_link: Option<String>,
    pub kind: ChatKind,
    pub members_count: i64,
    /// Discussion chat linked to a channel (or vice versa).
    pub linked_chat: Option<Box<ChatInfo>>,
}

impl ChatInfo {
    /// Handle or invite link usable to enter the chat, if it has one.
    pub fn join_string(&self) -> Option<String> {
        self.username.clone().or_else(|| self.invite_link.clone())
    }

    /// Display name as stored in the chat table: title plus handle.
    pub fn display_name(&self) -> String {
        match &self.username {
            Some(username) => format!("{} ({username})", self.title),
            None => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Author {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_bot: bool,
}

impl Author {
    pub fn full_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub enum ReactionKind {
    Emoji(String),
    CustomEmoji(i64),
}

#[derive(Debug, Clone)]
pub struct Reaction {
    pub kind: ReactionKind,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct PollOption {
    pub label: String,
    pub voter_count: i64,
}

#[derive(Debug, Clone)]
pub struct Poll {
    pub is_anonymous: bool,
    pub is_closed: bool,
    /// Index of the option this session voted for, if any.
    pub chosen_option: Option<usize>,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: i64,
    pub chat: ChatInfo,
    pub date: DateTime<Utc>,
    /// None for anonymous senders.
    pub author: Option<Author>,
    pub sender_chat: Option<ChatInfo>,
    pub forward_from_chat: Option<ChatInfo>,
    pub forward_from_message_id: Option<i64>,
    pub reply_to_top_message_id: Option<i64>,
    pub text: String,
    pub views: Option<i64>,
    pub reactions: Vec<Reaction>,
    pub poll: Option<Poll>,
}

/// A handle, invite link or numeric id naming a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatRef {
    Id(i64),
    Handle(String),
}

impl ChatRef {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(id) => ChatRef::Id(id),
            Err(_) => ChatRef::Handle(raw.to_string()),
        }
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{id}"),
            ChatRef::Handle(handle) => write!(f, "{handle}"),
        }
    }
}

/// Result of resolving a chat before joining it.
#[derive(Debug, Clone)]
pub struct ChatPreview {
    pub info: ChatInfo,
    /// True when this session is already a member and the info is complete.
    pub is_member: bool,
}

#[derive(Debug, Clone)]
pub enum JoinOutcome {
    Joined(ChatInfo),
    /// The chat requires admin approval; a confirmation push follows.
    ApprovalPending,
}

/// Push updates delivered by the network.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Message(ChatMessage),
    /// Join/creation confirmation, keyed by chat title.
    JoinConfirmation { chat_id: i64, title: String },
}

/// What the engine requires from one authenticated network session.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Chat ids of every dialog this session currently has.
    async fn dialogs(&self) -> Result<Vec<i64>>;

    async fn resolve_chat(&self, chat: &ChatRef) -> Result<ChatPreview>;
    async fn join_chat(&self, chat: &ChatRef) -> Result<JoinOutcome>;
    async fn leave_chat(&self, chat_id: i64) -> Result<()>;

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<ChatMessage>>;

    /// Batch fetch; the result has the same length and order as `message_ids`.
    async fn get_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<Vec<Option<ChatMessage>>>;

    /// Reverse-paginated history window: messages with id below `offset_id`
    /// (latest first when zero) and above `min_id`, newest first.
    async fn get_history(
        &self,
        chat_id: i64,
        offset_id: i64,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    async fn vote_poll(&self, chat_id: i64, message_id: i64, option: usize) -> Result<()>;
}

/// Builds a live transport (plus its push stream) from a stored session.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        session: &SessionRow,
    ) -> Result<(Arc<dyn SessionTransport>, mpsc::Receiver<SessionUpdate>)>;
}
