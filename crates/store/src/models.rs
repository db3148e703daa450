//! Row types for every table the engine touches.
//!
//! Field order matches the column order of the target tables: inserts go over
//! RowBinary, which is positional.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};

pub const CHAT_KIND_CHAT: &str = "CHAT";
pub const CHAT_KIND_CHANNEL: &str = "CHANNEL";
pub const CHAT_KIND_PRIVATE: &str = "PRIVATE";

/// One session credential from `bots` / `bots_dev_1` / `bots_dev_2`.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: i64,
    pub shard: u32,
    pub name: String,
    pub session_string: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct BrokenSessionRow {
    pub id: i64,
}

/// Authoritative chat ownership record: `(shard, session_index)` names the
/// single session responsible for the chat.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: i64,
    pub name: String,
    pub join_string: String,
    pub shard: u32,
    pub session_index: u32,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub added: DateTime<Utc>,
    /// CHAT | CHANNEL | PRIVATE.
    pub kind: String,
}

impl ChatRow {
    pub fn is_private(&self) -> bool {
        self.kind == CHAT_KIND_PRIVATE
    }
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ChatUpdateRow {
    pub shard: u32,
    pub session_index: u32,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub added: DateTime<Utc>,
}

/// One observed human message in a group chat. `channel_id`/`post_id` are set
/// only for discussion-thread replies attributed to a channel post.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct CommentRow {
    pub user_id: i64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub date: DateTime<Utc>,
    pub chat_id: i64,
    pub message_id: i64,
    pub channel_id: Option<i64>,
    pub post_id: Option<i64>,
    pub session_index: u32,
    pub shard: u32,
}

impl CommentRow {
    /// Sort key for batched retrieval: comments grouped this way land on one
    /// session and can be fetched in one history call per chat.
    pub fn batch_key(&self) -> (u32, u32, i64) {
        (self.shard, self.session_index, self.chat_id)
    }
}

/// Appended on every observed message; deduplicated at query time.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: i64,
    pub username: String,
    pub name: String,
}

/// Append-only discovery log. The pending set is the ids whose signed sum is
/// positive; auto-discovery appends the `sign = -1` compensation on consume.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct DiscoveredChatRow {
    pub id: i64,
    pub name: String,
    pub join_string: String,
    pub subscribers_count: i64,
    pub sign: i8,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct PendingDiscoveryRow {
    pub id: i64,
    pub name: String,
    pub join_string: String,
}

/// One reaction snapshot of a channel post. Snapshots for a post form a time
/// series; the latest `point_date` is the freshest observation.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct PostRow {
    pub id: i64,
    pub channel_id: i64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub post_date: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub point_date: DateTime<Utc>,
    #[serde(rename = "data.key")]
    pub keys: Vec<String>,
    #[serde(rename = "data.value")]
    pub values: Vec<i64>,
    pub session_index: u32,
    pub shard: u32,
}

impl PostRow {
    /// Flattens the counter map into the `data.key` / `data.value` parallel
    /// columns.
    pub fn from_data(
        id: i64,
        channel_id: i64,
        post_date: DateTime<Utc>,
        point_date: DateTime<Utc>,
        data: &BTreeMap<String, i64>,
        session_index: u32,
        shard: u32,
    ) -> Self {
        Self {
            id,
            channel_id,
            post_date,
            point_date,
            keys: data.keys().cloned().collect(),
            values: data.values().copied().collect(),
            session_index,
            shard,
        }
    }

    pub fn data(&self) -> BTreeMap<String, i64> {
        self.keys
            .iter()
            .cloned()
            .zip(self.values.iter().copied())
            .collect()
    }
}

/// Projection row from `new_posts_mv`: posts eligible for resampling.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct NewPostRow {
    pub id: i64,
    pub channel_id: i64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub post_date: DateTime<Utc>,
    pub session_index: u32,
    pub shard: u32,
}

/// Projection row from `comments_range_mv`: observed message-id range per chat.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct CommentRangeRow {
    pub chat_id: i64,
    pub min_message_id: i64,
    pub max_message_id: i64,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct LogRow {
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub created: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    pub shard: u32,
    pub hostname: String,
}
