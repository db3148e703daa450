//! Wire types shared by the shard RPC surface and the controller.

use serde::{Deserialize, Serialize};

use vox_store::models::CommentRow;

/// A fetched message zipped with its originating comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageOut {
    pub text: String,
    pub chat: String,
    pub comment: CommentRow,
}

/// Aggregated identity of one user across all observed rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: i64,
    pub usernames: Vec<String>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOut {
    pub user_id: i64,
    pub username: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub join_string: String,
    #[serde(default)]
    pub ignore_protection: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostText {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentCount {
    pub comment_count: u64,
}
