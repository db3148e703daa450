//! Accumulates observation events and flushes them to the store in batches.
//!
//! A failed flush drops the batch that was already snapshotted out of the
//! buffers; the store deduplicates at query time, so losing a batch beats
//! re-queueing it and double-writing the rest.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info};

use vox_common::Result;
use vox_store::models::{CommentRow, DiscoveredChatRow, PostRow, UserRow};
use vox_store::Store;

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Buffers {
    comments: Vec<CommentRow>,
    users: Vec<UserRow>,
    discovered: Vec<DiscoveredChatRow>,
    posts: Vec<PostRow>,
}

impl Buffers {
    fn len(&self) -> usize {
        self.comments.len() + self.users.len() + self.discovered.len() + self.posts.len()
    }
}

pub struct IngestBatcher {
    store: Arc<dyn Store>,
    buffers: Mutex<Buffers>,
}

impl IngestBatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub async fn push_comment(&self, comment: CommentRow, user: UserRow) {
        let mut buffers = self.buffers.lock().await;
        buffers.comments.push(comment);
        buffers.users.push(user);
    }

    pub async fn push_discovered(&self, row: DiscoveredChatRow) {
        self.buffers.lock().await.discovered.push(row);
    }

    pub async fn push_post(&self, row: PostRow) {
        self.buffers.lock().await.posts.push(row);
    }

    /// Snapshots and clears all four accumulators under the lock, then issues
    /// the async inserts outside of it. Returns the record count flushed.
    pub async fn flush(&self) -> Result<usize> {
        let batch = {
            let mut buffers = self.buffers.lock().await;
            mem::take(&mut *buffers)
        };

        let total = batch.len();
        if total == 0 {
            return Ok(0);
        }

        if !batch.comments.is_empty() {
            self.store.insert_comments(&batch.comments).await?;
        }
        if !batch.users.is_empty() {
            self.store.insert_users(&batch.users).await?;
        }
        if !batch.discovered.is_empty() {
            self.store.insert_discovered_chats(&batch.discovered).await?;
        }
        if !batch.posts.is_empty() {
            self.store.insert_posts(&batch.posts).await?;
        }

        Ok(total)
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.flush().await {
                Ok(0) => {}
                Ok(count) => info!("flushed {count} records"),
                Err(err) => error!("failed to flush ingest batch: {err}"),
            }
        }
    }
}
