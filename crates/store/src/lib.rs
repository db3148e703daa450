pub mod gateway;
pub mod logging;
pub mod models;

use async_trait::async_trait;

use vox_common::Result;

use crate::models::{
    BrokenSessionRow, ChatRow, ChatUpdateRow, CommentRangeRow, CommentRow, DiscoveredChatRow,
    LogRow, NewPostRow, PendingDiscoveryRow, PostRow, SessionRow, UserRow,
};

pub use gateway::ClickHouseStore;

/// Typed access to the columnar store.
///
/// All engine and controller state lives behind this trait; the in-memory
/// views (registry snapshot, batcher buffers, task table) can be rebuilt from
/// it at any time. Inserts are at-least-once: the store deduplicates at query
/// time.
#[async_trait]
pub trait Store: Send + Sync {
    // Session fleet.
    async fn load_sessions(&self, table: &str, shard: u32) -> Result<Vec<SessionRow>>;
    async fn load_broken_sessions(&self) -> Result<Vec<BrokenSessionRow>>;
    async fn mark_session_broken(&self, id: i64) -> Result<()>;

    // Chat registry.
    async fn load_chats(&self) -> Result<Vec<ChatRow>>;
    async fn insert_chats(&self, rows: &[ChatRow]) -> Result<()>;
    async fn latest_chat_update(&self, shard: u32) -> Result<Option<ChatUpdateRow>>;
    async fn chat_by_id(&self, chat_id: i64) -> Result<Option<ChatRow>>;
    async fn chat_by_join_string(&self, join_string: &str) -> Result<Option<ChatRow>>;
    async fn search_chats(
        &self,
        name: Option<&str>,
        join_string: Option<&str>,
    ) -> Result<Vec<ChatRow>>;

    // Ingestion.
    async fn insert_comments(&self, rows: &[CommentRow]) -> Result<()>;
    async fn insert_users(&self, rows: &[UserRow]) -> Result<()>;
    async fn insert_discovered_chats(&self, rows: &[DiscoveredChatRow]) -> Result<()>;
    async fn insert_posts(&self, rows: &[PostRow]) -> Result<()>;

    // Read models.
    async fn users_by_ids(&self, user_ids: &[i64]) -> Result<Vec<UserRow>>;
    async fn users_by_username_prefix(&self, prefix: &str, limit: u64) -> Result<Vec<UserRow>>;
    async fn comments_by_user(&self, user_id: i64, offset: u64, fetch: u64)
        -> Result<Vec<CommentRow>>;
    async fn comment_count(&self, user_id: i64) -> Result<u64>;
    async fn comment_range(&self, chat_id: i64) -> Result<Option<CommentRangeRow>>;
    async fn reactions(&self, channel_id: i64, post_id: i64) -> Result<Vec<PostRow>>;
    async fn post_head(&self, channel_id: i64, post_id: i64) -> Result<Option<PostRow>>;
    async fn latest_post_point(&self, post_id: i64) -> Result<Option<PostRow>>;
    async fn recent_posts(&self, shard: u32) -> Result<Vec<NewPostRow>>;

    // Auto-discovery log.
    async fn discovered_count(&self) -> Result<u64>;
    async fn pending_discovery(&self, offset: u64) -> Result<Option<PendingDiscoveryRow>>;

    // Log sink.
    async fn insert_logs(&self, rows: &[LogRow]) -> Result<()>;
}
