//! Authoritative chat-ownership map and its reconciliation loop.
//!
//! Invariant kept by the pass: every non-private chat in the table is held by
//! exactly one session in the fleet, the one named by `(shard, session_index)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use vox_common::{Config, Result};
use vox_store::models::ChatRow;
use vox_store::Store;

use crate::backfill::HistoryTask;
use crate::pool::SessionPool;
use crate::router::Router;
use crate::session::SessionClient;
use crate::transport::{ChatInfo, ChatRef};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

pub struct ChatRegistry {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    pool: Arc<SessionPool>,
    chats: Mutex<HashMap<i64, ChatRow>>,
    /// Watermark for the advisory `chat_updates` signal.
    last_update_seen: StdMutex<Option<DateTime<Utc>>>,
}

impl ChatRegistry {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>, pool: Arc<SessionPool>) -> Self {
        Self {
            config,
            store,
            pool,
            chats: Mutex::new(HashMap::new()),
            last_update_seen: StdMutex::new(None),
        }
    }

    pub async fn contains(&self, chat_id: i64) -> bool {
        self.chats.lock().await.contains_key(&chat_id)
    }

    pub async fn get(&self, chat_id: i64) -> Option<ChatRow> {
        self.chats.lock().await.get(&chat_id).cloned()
    }

    /// Resolves the chat, writes the ownership row and schedules the modern
    /// backfill arm. Called when a session observes a chat the registry does
    /// not know.
    pub async fn register_new_chat(
        &self,
        router: &Arc<Router>,
        session: &Arc<SessionClient>,
        chat_id: i64,
        join_string: &str,
    ) -> Result<()> {
        info!(
            "registering new chat ({chat_id}, {join_string:?}) for session {}",
            session.index
        );

        let preview = session.resolve_chat(&ChatRef::Id(chat_id)).await?;
        let info = preview.info;

        let join_string = if join_string.is_empty() {
            info.join_string().unwrap_or_default()
        } else {
            join_string.to_string()
        };

        let row = ChatRow {
            id: info.id,
            name: info.display_name(),
            join_string,
            shard: self.config.shard,
            session_index: session.index as u32,
            added: Utc::now(),
            kind: info.kind.as_str().to_string(),
        };

        self.store.insert_chats(&[row.clone()]).await?;
        info!("added new chat {}", row.name);
        self.chats.lock().await.insert(row.id, row);

        // Fresh chat: only the modern gap is worth walking.
        self.schedule_backfill(router, session, chat_id, true).await;
        Ok(())
    }

    /// Ownership decision for a chat a session just observed or discovered:
    /// keep it if it is ours, hand it back if another session owns it,
    /// register it if nobody does.
    pub async fn adopt(
        &self,
        router: &Arc<Router>,
        session: &Arc<SessionClient>,
        chat: &ChatInfo,
        join_string: &str,
    ) -> Result<()> {
        let known = self.get(chat.id).await;

        match known {
            Some(known) => {
                if known.shard == self.config.shard && known.session_index == session.index as u32 {
                    if !session.is_subscribed(chat.id).await? {
                        session.join(&ChatRef::Id(chat.id)).await?;
                    }
                    return Ok(());
                }

                if session.is_subscribed(chat.id).await? {
                    info!("chat {} is handled by another session, leaving", chat.id);
                    if let Err(err) = session.leave(chat.id).await {
                        error!("failed to leave chat {}: {err}", chat.id);
                    }
                }
            }
            None => {
                if !session.is_subscribed(chat.id).await? {
                    session.join(&ChatRef::Id(chat.id)).await?;
                }
                self.register_new_chat(router, session, chat.id, join_string)
                    .await?;
            }
        }

        Ok(())
    }

    /// Full discover flow on a specific session: resolve + threshold + join
    /// (approval wait included), then ownership reconciliation and the linked
    /// discussion chat, unless `skip_ownership` short-circuits both.
    pub async fn discover(
        &self,
        router: &Arc<Router>,
        session: &Arc<SessionClient>,
        chat: &ChatRef,
        with_linked: bool,
        skip_ownership: bool,
        ignore_protection: bool,
    ) -> Result<Option<ChatInfo>> {
        let Some(info) = session.discover(chat, ignore_protection).await? else {
            return Ok(None);
        };

        if skip_ownership {
            if !session.is_subscribed(info.id).await? {
                session.join(&ChatRef::Id(info.id)).await?;
            }
            return Ok(Some(info));
        }

        self.adopt(router, session, &info, &chat.to_string()).await?;

        if with_linked {
            if let Some(linked) = &info.linked_chat {
                let linked_ref = match &linked.username {
                    Some(username) => ChatRef::Handle(username.clone()),
                    None => ChatRef::Id(linked.id),
                };
                Box::pin(self.discover(
                    router,
                    session,
                    &linked_ref,
                    false,
                    false,
                    ignore_protection,
                ))
                .await?;
            }
        }

        Ok(Some(info))
    }

    /// One reconciliation pass: reload the table snapshot, leave wrongly-held
    /// chats, join locally-owned chats the designated session lost. Per-chat
    /// errors are logged and never abort the pass.
    pub async fn reconcile(&self, router: &Arc<Router>) -> Result<(usize, usize)> {
        info!("updating chats");

        let rows = self.store.load_chats().await?;
        {
            let mut chats = self.chats.lock().await;
            *chats = rows.iter().map(|row| (row.id, row.clone())).collect();
        }

        let mut join_count = 0;
        let mut leave_count = 0;

        for chat in rows.iter().filter(|row| !row.is_private()) {
            for session in self.pool.sessions() {
                let wrongly_held = session.is_subscribed(chat.id).await?
                    && (chat.shard != self.config.shard
                        || chat.session_index != session.index as u32);
                if wrongly_held {
                    match session.leave(chat.id).await {
                        Ok(()) => leave_count += 1,
                        Err(err) => error!("failed to leave chat {}: {err}", chat.name),
                    }
                }
            }
        }

        for chat in rows.iter().filter(|row| row.shard == self.config.shard) {
            let Some(session) = self.pool.get(chat.session_index as usize) else {
                continue;
            };

            if session.is_subscribed(chat.id).await? {
                continue;
            }

            let outcome = if chat.join_string.is_empty() {
                session.join(&ChatRef::Id(chat.id)).await.map(|_| ())
            } else {
                self.discover(
                    router,
                    session,
                    &ChatRef::parse(&chat.join_string),
                    false,
                    true,
                    false,
                )
                .await
                .map(|_| ())
            };

            match outcome {
                Ok(()) => join_count += 1,
                Err(err) => error!("failed to join chat {}: {err}", chat.name),
            }
        }

        info!("joined {join_count}, left {leave_count}");
        Ok((join_count, leave_count))
    }

    /// Polls the advisory change signal, refreshes the dialog caches and runs
    /// the unconditional pass.
    pub async fn run_once(&self, router: &Arc<Router>) -> Result<()> {
        self.poll_update_signal().await;
        self.pool.refresh_subscribed().await;
        self.reconcile(router).await?;
        Ok(())
    }

    async fn poll_update_signal(&self) {
        match self.store.latest_chat_update(self.config.shard).await {
            Ok(Some(update)) => {
                let mut seen = self.last_update_seen.lock().unwrap();
                if seen.is_none_or(|watermark| update.added > watermark) {
                    debug!(
                        "chat update signal from session {} at {}",
                        update.session_index, update.added
                    );
                    *seen = Some(update.added);
                }
            }
            Ok(None) => {}
            Err(err) => debug!("chat_updates poll failed: {err}"),
        }
    }

    pub async fn run(self: Arc<Self>, router: Arc<Router>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = self.run_once(&router).await {
                error!("failed to update chats: {err}");
            }
        }
    }

    /// Schedules the backfill arms for one chat: the modern gap
    /// `[0 .. max_message_id]` and, unless skipped, the historical walk
    /// `[min_message_id .. 0]`.
    pub async fn schedule_backfill(
        &self,
        router: &Arc<Router>,
        session: &Arc<SessionClient>,
        chat_id: i64,
        skip_earliest: bool,
    ) {
        let range = match self.store.comment_range(chat_id).await {
            Ok(range) => range,
            Err(err) => {
                error!("failed to read comment range of chat {chat_id}: {err}");
                return;
            }
        };

        let (min_id, max_id) = range
            .map(|row| (row.min_message_id, row.max_message_id))
            .unwrap_or((0, 0));

        router.tasks.add_task(Box::new(HistoryTask::new(
            Arc::clone(router),
            Arc::clone(session),
            chat_id,
            0,
            max_id,
        )));

        if !skip_earliest && min_id > 0 {
            router.tasks.add_task(Box::new(HistoryTask::new(
                Arc::clone(router),
                Arc::clone(session),
                chat_id,
                min_id,
                0,
            )));
        }
    }
}
