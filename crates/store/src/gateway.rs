//! ClickHouse-backed implementation of [`Store`].

use async_trait::async_trait;
use clickhouse::Client;
use serde::Serialize;

use vox_common::{Config, Result, VoxError};

use crate::models::{
    BrokenSessionRow, ChatRow, ChatUpdateRow, CommentRangeRow, CommentRow, DiscoveredChatRow,
    LogRow, NewPostRow, PendingDiscoveryRow, PostRow, SessionRow, UserRow,
};
use crate::Store;

#[derive(Clone)]
pub struct ClickHouseStore {
    read: Client,
    /// Same endpoint with `async_insert=1`: writes are buffered server-side.
    write: Client,
}

impl ClickHouseStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Client::default()
            .with_url(config.clickhouse_url())
            .with_user("default")
            .with_password(config.clickhouse_password.clone())
            .with_database("default");

        let store = Self {
            write: client.clone().with_option("async_insert", "1"),
            read: client,
        };

        store
            .ping()
            .await
            .map_err(|err| VoxError::Startup(format!("store unreachable: {err}")))?;

        Ok(store)
    }

    async fn ping(&self) -> Result<()> {
        self.read
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(VoxError::store)?;
        Ok(())
    }

    async fn insert_rows<T>(&self, table: &str, rows: &[T]) -> Result<()>
    where
        T: clickhouse::Row + Serialize,
    {
        if rows.is_empty() {
            return Ok(());
        }

        let mut insert = self.write.insert(table).map_err(VoxError::store)?;
        for row in rows {
            insert.write(row).await.map_err(VoxError::store)?;
        }
        insert.end().await.map_err(VoxError::store)?;
        Ok(())
    }
}

#[async_trait]
impl Store for ClickHouseStore {
    async fn load_sessions(&self, table: &str, shard: u32) -> Result<Vec<SessionRow>> {
        // Table name comes from the MODE enum, never from user input.
        self.read
            .query(&format!(
                "SELECT ?fields FROM {table} WHERE shard = ? ORDER BY id"
            ))
            .bind(shard)
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn load_broken_sessions(&self) -> Result<Vec<BrokenSessionRow>> {
        self.read
            .query("SELECT ?fields FROM broken_bots")
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn mark_session_broken(&self, id: i64) -> Result<()> {
        self.insert_rows("broken_bots", &[BrokenSessionRow { id }])
            .await
    }

    async fn load_chats(&self) -> Result<Vec<ChatRow>> {
        self.read
            .query("SELECT ?fields FROM chats")
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn insert_chats(&self, rows: &[ChatRow]) -> Result<()> {
        self.insert_rows("chats", rows).await
    }

    async fn latest_chat_update(&self, shard: u32) -> Result<Option<ChatUpdateRow>> {
        self.read
            .query("SELECT ?fields FROM chat_updates WHERE shard = ? ORDER BY added DESC LIMIT 1")
            .bind(shard)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn chat_by_id(&self, chat_id: i64) -> Result<Option<ChatRow>> {
        self.read
            .query("SELECT ?fields FROM chats WHERE id = ? LIMIT 1")
            .bind(chat_id)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn chat_by_join_string(&self, join_string: &str) -> Result<Option<ChatRow>> {
        self.read
            .query("SELECT ?fields FROM chats WHERE join_string = ? LIMIT 1")
            .bind(join_string)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn search_chats(
        &self,
        name: Option<&str>,
        join_string: Option<&str>,
    ) -> Result<Vec<ChatRow>> {
        let query = match (name, join_string) {
            (Some(name), Some(join)) => self
                .read
                .query("SELECT ?fields FROM chats WHERE name ILIKE ? OR join_string ILIKE ?")
                .bind(format!("{name}%"))
                .bind(format!("{join}%")),
            (Some(name), None) => self
                .read
                .query("SELECT ?fields FROM chats WHERE name ILIKE ?")
                .bind(format!("{name}%")),
            (None, Some(join)) => self
                .read
                .query("SELECT ?fields FROM chats WHERE join_string ILIKE ?")
                .bind(format!("{join}%")),
            (None, None) => return Ok(Vec::new()),
        };

        query.fetch_all().await.map_err(VoxError::store)
    }

    async fn insert_comments(&self, rows: &[CommentRow]) -> Result<()> {
        self.insert_rows("comments", rows).await
    }

    async fn insert_users(&self, rows: &[UserRow]) -> Result<()> {
        self.insert_rows("users", rows).await
    }

    async fn insert_discovered_chats(&self, rows: &[DiscoveredChatRow]) -> Result<()> {
        self.insert_rows("discovered_chats", rows).await
    }

    async fn insert_posts(&self, rows: &[PostRow]) -> Result<()> {
        self.insert_rows("posts", rows).await
    }

    async fn users_by_ids(&self, user_ids: &[i64]) -> Result<Vec<UserRow>> {
        self.read
            .query("SELECT ?fields FROM users WHERE user_id IN ?")
            .bind(user_ids)
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn users_by_username_prefix(&self, prefix: &str, limit: u64) -> Result<Vec<UserRow>> {
        self.read
            .query("SELECT ?fields FROM users WHERE username ILIKE ? LIMIT ?")
            .bind(format!("{prefix}%"))
            .bind(limit)
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn comments_by_user(
        &self,
        user_id: i64,
        offset: u64,
        fetch: u64,
    ) -> Result<Vec<CommentRow>> {
        self.read
            .query("SELECT ?fields FROM comments WHERE user_id = ? ORDER BY date LIMIT ? OFFSET ?")
            .bind(user_id)
            .bind(fetch)
            .bind(offset)
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn comment_count(&self, user_id: i64) -> Result<u64> {
        self.read
            .query("SELECT count() FROM comments WHERE user_id = ?")
            .bind(user_id)
            .fetch_one()
            .await
            .map_err(VoxError::store)
    }

    async fn comment_range(&self, chat_id: i64) -> Result<Option<CommentRangeRow>> {
        self.read
            .query("SELECT ?fields FROM comments_range_mv WHERE chat_id = ? LIMIT 1")
            .bind(chat_id)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn reactions(&self, channel_id: i64, post_id: i64) -> Result<Vec<PostRow>> {
        self.read
            .query(
                "SELECT ?fields FROM posts WHERE id = ? AND channel_id = ? ORDER BY point_date ASC",
            )
            .bind(post_id)
            .bind(channel_id)
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn post_head(&self, channel_id: i64, post_id: i64) -> Result<Option<PostRow>> {
        self.read
            .query("SELECT ?fields FROM posts WHERE id = ? AND channel_id = ? LIMIT 1")
            .bind(post_id)
            .bind(channel_id)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn latest_post_point(&self, post_id: i64) -> Result<Option<PostRow>> {
        self.read
            .query("SELECT ?fields FROM posts WHERE id = ? ORDER BY point_date DESC LIMIT 1")
            .bind(post_id)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn recent_posts(&self, shard: u32) -> Result<Vec<NewPostRow>> {
        self.read
            .query(
                "SELECT ?fields FROM new_posts_mv \
                 WHERE post_date > now() - INTERVAL 3 DAY AND shard = ?",
            )
            .bind(shard)
            .fetch_all()
            .await
            .map_err(VoxError::store)
    }

    async fn discovered_count(&self) -> Result<u64> {
        self.read
            .query("SELECT count() FROM discovered_chats")
            .fetch_one()
            .await
            .map_err(VoxError::store)
    }

    async fn pending_discovery(&self, offset: u64) -> Result<Option<PendingDiscoveryRow>> {
        self.read
            .query(
                "SELECT id, name, join_string FROM discovered_chats \
                 GROUP BY id, name, join_string \
                 HAVING sum(sign) > 0 \
                 LIMIT 1 OFFSET ?",
            )
            .bind(offset)
            .fetch_optional()
            .await
            .map_err(VoxError::store)
    }

    async fn insert_logs(&self, rows: &[LogRow]) -> Result<()> {
        self.insert_rows("logs", rows).await
    }
}
