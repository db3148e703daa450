//! HTTP client side of the shard RPC surface, used by the controller.

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use tracing::info;

use vox_common::{Result, VoxError};
use vox_store::models::CommentRow;

use crate::types::{DiscoverRequest, MessageOut, PostText, UserOut};

#[derive(Clone)]
pub struct ShardClient {
    http: reqwest::Client,
    base: String,
}

impl ShardClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{endpoint}"),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(VoxError::not_found("shard resource"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoxError::transport(format!("shard returned {status}: {body}")));
        }
        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(VoxError::transport)
    }

    pub async fn get_messages(&self, sorted_comments: &[CommentRow]) -> Result<Vec<MessageOut>> {
        let response = self
            .http
            .post(format!("{}/messages", self.base))
            .json(&sorted_comments)
            .send()
            .await
            .map_err(VoxError::transport)?;
        Self::parse(response).await
    }

    pub async fn known_chats_count(&self) -> Result<usize> {
        let response = self
            .http
            .get(format!("{}/known_chats_count", self.base))
            .send()
            .await
            .map_err(VoxError::transport)?;
        Self::parse(response).await
    }

    pub async fn discover(&self, join_string: &str, ignore_protection: bool) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/discover", self.base))
            .json(&DiscoverRequest {
                join_string: join_string.to_string(),
                ignore_protection,
            })
            .send()
            .await
            .map_err(VoxError::transport)?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn user_from_comment(&self, chat: &str, message_id: i64) -> Result<UserOut> {
        let response = self
            .http
            .get(format!("{}/user_from_comment", self.base))
            .query(&[
                ("chat", chat.to_string()),
                ("message_id", message_id.to_string()),
            ])
            .send()
            .await
            .map_err(VoxError::transport)?;
        Self::parse(response).await
    }

    pub async fn post_text(
        &self,
        channel_id: i64,
        post_id: i64,
        session_index: u32,
    ) -> Result<PostText> {
        let response = self
            .http
            .get(format!("{}/post", self.base))
            .query(&[
                ("channel_id", channel_id.to_string()),
                ("post_id", post_id.to_string()),
                ("session_index", session_index.to_string()),
            ])
            .send()
            .await
            .map_err(VoxError::transport)?;
        Self::parse(response).await
    }
}

/// Every shard of the deployment, indexed by shard number.
pub struct ShardFleet {
    clients: Vec<ShardClient>,
}

impl ShardFleet {
    pub fn from_endpoints(endpoints: &[String]) -> Self {
        Self {
            clients: endpoints
                .iter()
                .map(|endpoint| ShardClient::new(endpoint))
                .collect(),
        }
    }

    pub fn get(&self, shard: u32) -> Result<&ShardClient> {
        self.clients
            .get(shard as usize)
            .ok_or_else(|| VoxError::bad_request(format!("unknown shard {shard}")))
    }

    /// Spec'd discover fan-out: read every shard's chat count, pick the one
    /// carrying the least and forward the discover there.
    pub async fn discover_least_loaded(
        &self,
        join_string: &str,
        ignore_protection: bool,
    ) -> Result<()> {
        if self.clients.is_empty() {
            return Err(VoxError::bad_request("no shard endpoints configured"));
        }

        let counts =
            try_join_all(self.clients.iter().map(|client| client.known_chats_count())).await?;

        let lazy_shard = counts
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| **count)
            .map(|(shard, _)| shard)
            .unwrap_or(0);

        info!("routing discover of {join_string} to shard {lazy_shard}");
        self.clients[lazy_shard]
            .discover(join_string, ignore_protection)
            .await
    }
}
