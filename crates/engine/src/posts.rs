//! Time-decayed resampling of channel posts: the younger the post, the more
//! often its reactions are captured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{error, info};

use vox_common::{Config, Result};
use vox_store::models::NewPostRow;
use vox_store::Store;

use crate::batcher::IngestBatcher;
use crate::pool::SessionPool;
use crate::router::post_snapshot;

const PASS_INTERVAL: Duration = Duration::from_secs(30);

pub struct PostTracker {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    pool: Arc<SessionPool>,
    batcher: Arc<IngestBatcher>,
    /// Freshest observation per post, lazily seeded from the store.
    last_point: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl PostTracker {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        pool: Arc<SessionPool>,
        batcher: Arc<IngestBatcher>,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            batcher,
            last_point: Mutex::new(HashMap::new()),
        }
    }

    /// Resample cadence by post age.
    pub(crate) fn resample_interval(age: ChronoDuration) -> ChronoDuration {
        if age < ChronoDuration::hours(1) {
            ChronoDuration::seconds(60)
        } else if age < ChronoDuration::hours(4) {
            ChronoDuration::seconds(120)
        } else if age < ChronoDuration::days(1) {
            ChronoDuration::seconds(600)
        } else {
            ChronoDuration::seconds(3600)
        }
    }

    async fn process_post(&self, post: &NewPostRow) -> Result<()> {
        let known = { self.last_point.lock().await.get(&post.id).copied() };

        let last_updated = match known {
            Some(point) => point,
            None => {
                let Some(head) = self.store.latest_post_point(post.id).await? else {
                    error!(
                        "projection row without a snapshot in posts: {} in channel {}",
                        post.id, post.channel_id
                    );
                    return Ok(());
                };
                self.last_point
                    .lock()
                    .await
                    .insert(post.id, head.point_date);
                head.point_date
            }
        };

        let due = Utc::now() - last_updated > Self::resample_interval(Utc::now() - post.post_date);
        if !due {
            return Ok(());
        }

        let Some(session) = self.pool.get(post.session_index as usize) else {
            return Ok(());
        };

        match session.fetch_message(post.channel_id, post.id).await? {
            Some(message) => {
                self.batcher
                    .push_post(post_snapshot(&message, session.index as u32, self.config.shard))
                    .await;
            }
            None => {
                // Post was deleted; the bump below stops further fetches.
            }
        }

        self.last_point.lock().await.insert(post.id, Utc::now());
        Ok(())
    }

    pub async fn run_once(&self) -> Result<()> {
        let posts = self.store.recent_posts(self.config.shard).await?;

        let outcomes = join_all(posts.iter().map(|post| self.process_post(post))).await;
        for (post, outcome) in posts.iter().zip(outcomes) {
            if let Err(err) = outcome {
                error!(
                    "unable to process post {} in channel {}: {err}",
                    post.id, post.channel_id
                );
            }
        }

        info!("processed {} posts", posts.len());
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.run_once().await {
                error!("failed in post tracker pass: {err}");
            }
            tokio::time::sleep(PASS_INTERVAL).await;
        }
    }
}
