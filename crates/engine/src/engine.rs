//! Shard-level assembly: builds the collaborators, wires the update feeds and
//! spawns the background loops.

use std::sync::Arc;

use tracing::{error, info};

use vox_common::{Config, Result};
use vox_store::Store;

use crate::backfill::TaskManager;
use crate::batcher::IngestBatcher;
use crate::pool::SessionPool;
use crate::posts::PostTracker;
use crate::registry::ChatRegistry;
use crate::router::Router;
use crate::transport::{ChatRef, SessionConnector, SessionUpdate};

pub struct Engine {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub pool: Arc<SessionPool>,
    pub registry: Arc<ChatRegistry>,
    pub batcher: Arc<IngestBatcher>,
    pub tasks: Arc<TaskManager>,
    pub posts: Arc<PostTracker>,
    pub router: Arc<Router>,
}

impl Engine {
    /// Loads the session fleet and builds the collaborator graph. Fails fast
    /// when the store is unreachable or the fleet is short.
    pub async fn bootstrap(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        connector: &dyn SessionConnector,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(SessionPool::load(&config, store.as_ref(), connector).await?);
        let batcher = Arc::new(IngestBatcher::new(Arc::clone(&store)));
        let tasks = Arc::new(TaskManager::new());
        let registry = Arc::new(ChatRegistry::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&pool),
        ));
        let posts = Arc::new(PostTracker::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&batcher),
        ));
        let router = Router::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&batcher),
            Arc::clone(&tasks),
        );

        Ok(Arc::new(Self {
            config,
            store,
            pool,
            registry,
            batcher,
            tasks,
            posts,
            router,
        }))
    }

    /// Runs the initial reconciliation, then spawns every long-lived loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.registry.run_once(&self.router).await?;

        self.start_update_consumers();
        self.schedule_initial_backfill();

        tokio::spawn(Arc::clone(&self.registry).run(Arc::clone(&self.router)));
        tokio::spawn(Arc::clone(&self.batcher).run());
        tokio::spawn(Arc::clone(&self.tasks).run());
        tokio::spawn(Arc::clone(&self.posts).run());

        info!("engine started for shard {}", self.config.shard);
        Ok(())
    }

    /// One consumer task per session feed: messages go to the router,
    /// confirmations resolve parked approval waits.
    fn start_update_consumers(&self) {
        for (index, mut feed) in self.pool.take_update_feeds() {
            let Some(session) = self.pool.get(index) else {
                continue;
            };
            let session = Arc::clone(session);
            let router = Arc::clone(&self.router);

            tokio::spawn(async move {
                while let Some(update) = feed.recv().await {
                    match update {
                        SessionUpdate::Message(message) => {
                            if let Err(err) = router.process_message(&session, &message).await {
                                error!(
                                    "failed to process message {} in chat {}: {err}",
                                    message.id, message.chat.id
                                );
                            }
                        }
                        SessionUpdate::JoinConfirmation { chat_id, title } => {
                            session.resolve_invite(&title, chat_id).await;
                        }
                    }
                }
                info!("update feed of session {} closed", session.name);
            });
        }
    }

    /// Schedules both backfill arms for every chat the fleet already holds.
    fn schedule_initial_backfill(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            for session in engine.pool.sessions() {
                let chats = match session.subscribed_chats().await {
                    Ok(chats) => chats,
                    Err(err) => {
                        error!(
                            "failed to enumerate chats of session {}: {err}",
                            session.name
                        );
                        continue;
                    }
                };

                for chat_id in chats {
                    engine
                        .registry
                        .schedule_backfill(&engine.router, session, chat_id, false)
                        .await;
                }
            }
        });
    }

    /// Controller-facing discover: TTL reservation, load-weighted session
    /// pick, then the full discover flow on that session.
    pub async fn discover_chat(&self, join_string: &str, ignore_protection: bool) -> Result<()> {
        self.pool.reserve_discover(join_string).await?;
        let session = self.pool.pick_session().await?;
        self.registry
            .discover(
                &self.router,
                &session,
                &ChatRef::parse(join_string),
                true,
                false,
                ignore_protection,
            )
            .await?;
        Ok(())
    }

    pub async fn known_chats_count(&self) -> Result<usize> {
        self.pool.known_chats_count().await
    }

    /// Stops the sessions and flushes whatever the batcher still holds.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
        if let Err(err) = self.batcher.flush().await {
            error!("final batch flush failed: {err}");
        }
    }
}
