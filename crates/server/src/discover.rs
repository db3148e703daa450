//! Controller-side auto-discovery: drains the pending discovery log one
//! random candidate per pass through the least-loaded shard.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info};

use vox_common::Result;
use vox_store::models::DiscoveredChatRow;
use vox_store::Store;

use crate::shard_client::ShardFleet;

const PASS_INTERVAL: Duration = Duration::from_secs(60);

pub struct AutoDiscover {
    store: Arc<dyn Store>,
    shards: Arc<ShardFleet>,
}

impl AutoDiscover {
    pub fn new(store: Arc<dyn Store>, shards: Arc<ShardFleet>) -> Self {
        Self { store, shards }
    }

    pub async fn run_once(&self) -> Result<()> {
        let total = self.store.discovered_count().await?;
        if total == 0 {
            info!("no chats to discover");
            return Ok(());
        }

        let offset = rand::thread_rng().gen_range(0..total);
        let Some(candidate) = self.store.pending_discovery(offset).await? else {
            info!("no pending discoveries at offset {offset}");
            return Ok(());
        };

        info!("starting auto-discovery of chat {}", candidate.name);

        // Compensating row first: a crash after the row is written costs one
        // discovery, never a duplicate join storm.
        self.store
            .insert_discovered_chats(&[DiscoveredChatRow {
                id: candidate.id,
                name: candidate.name.clone(),
                join_string: candidate.join_string.clone(),
                subscribers_count: 0,
                sign: -1,
            }])
            .await?;

        self.shards
            .discover_least_loaded(&candidate.join_string, false)
            .await
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.run_once().await {
                error!("failed to run auto-discovery pass: {err}");
            }
            tokio::time::sleep(PASS_INTERVAL).await;
        }
    }
}
