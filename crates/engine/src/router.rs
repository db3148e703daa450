//! Per-message pipeline: every inbound message, live or backfilled, goes
//! through [`Router::process_message`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use vox_common::{Config, Result};
use vox_store::models::{CommentRow, DiscoveredChatRow, PostRow, UserRow};

use crate::backfill::TaskManager;
use crate::batcher::IngestBatcher;
use crate::registry::ChatRegistry;
use crate::session::SessionClient;
use crate::transport::{ChatKind, ChatMessage, ReactionKind};

pub struct Router {
    pub config: Arc<Config>,
    pub registry: Arc<ChatRegistry>,
    pub batcher: Arc<IngestBatcher>,
    pub tasks: Arc<TaskManager>,
}

impl Router {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ChatRegistry>,
        batcher: Arc<IngestBatcher>,
        tasks: Arc<TaskManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            batcher,
            tasks,
        })
    }

    pub async fn process_message(
        self: &Arc<Self>,
        session: &Arc<SessionClient>,
        message: &ChatMessage,
    ) -> Result<()> {
        // Stale delivery after a leave: drop it.
        if !session.is_subscribed(message.chat.id).await? {
            return Ok(());
        }

        session.mark_subscribed(message.chat.id).await;
        if !self.registry.contains(message.chat.id).await {
            self.registry
                .adopt(self, session, &message.chat, "")
                .await?;
        }

        self.note_forward_source(message).await;

        if message.chat.kind == ChatKind::Channel {
            if Utc::now() - message.date <= ChronoDuration::weeks(1) {
                self.handle_poll(session, message).await;
                self.batcher
                    .push_post(post_snapshot(message, session.index as u32, self.config.shard))
                    .await;
            }
            return Ok(());
        }

        let mut channel_id = None;
        let mut post_id = None;
        if let Some(top_id) = message.reply_to_top_message_id {
            if let Some(top) = session.get_message_cached(message.chat.id, top_id).await? {
                if let Some(sender) = &top.sender_chat {
                    if sender.kind == ChatKind::Channel {
                        channel_id = Some(sender.id);
                        post_id = top.forward_from_message_id;
                    }
                }
            }
        }

        let Some(author) = &message.author else {
            // Anonymous sender.
            return Ok(());
        };
        if author.is_bot {
            return Ok(());
        }

        let comment = CommentRow {
            user_id: author.id,
            date: message.date,
            chat_id: message.chat.id,
            message_id: message.id,
            channel_id,
            post_id,
            session_index: session.index as u32,
            shard: self.config.shard,
        };
        let user = UserRow {
            user_id: author.id,
            username: author.username.clone().unwrap_or_default(),
            name: author.full_name(),
        };

        self.batcher.push_comment(comment, user).await;
        Ok(())
    }

    /// Forwarded messages from public non-bot chats the registry does not know
    /// feed the discovery log, once the source clears the size threshold.
    async fn note_forward_source(&self, message: &ChatMessage) {
        let Some(source) = &message.forward_from_chat else {
            return;
        };
        if matches!(source.kind, ChatKind::Private | ChatKind::Bot) {
            return;
        }
        let Some(username) = &source.username else {
            return;
        };
        if self.registry.contains(source.id).await {
            return;
        }

        let min_members = match source.kind {
            ChatKind::Channel => self.config.min_channel_members,
            _ => self.config.min_chat_members,
        };
        if source.members_count < min_members {
            return;
        }

        self.batcher
            .push_discovered(DiscoveredChatRow {
                id: source.id,
                name: source.display_name(),
                join_string: username.clone(),
                subscribers_count: source.members_count,
                sign: 1,
            })
            .await;
    }

    /// Best-effort vote on an anonymous open poll nobody voted in yet. Gated
    /// by configuration: voting is visible on the network.
    async fn handle_poll(&self, session: &Arc<SessionClient>, message: &ChatMessage) {
        let Some(poll) = &message.poll else {
            return;
        };

        let should_vote = self.config.poll_auto_vote
            && poll.is_anonymous
            && !poll.is_closed
            && poll.chosen_option.is_none();
        if should_vote {
            if let Err(err) = session.vote_poll(message.chat.id, message.id, 0).await {
                debug!(
                    "failed to vote in poll {}/{}: {err}",
                    message.chat.id, message.id
                );
            }
        }
    }
}

/// Reaction snapshot of a channel post: views, per-reaction counters and, for
/// settled polls, per-option voter counts.
pub fn post_snapshot(message: &ChatMessage, session_index: u32, shard: u32) -> PostRow {
    let mut data = BTreeMap::new();

    if let Some(views) = message.views {
        data.insert("@views".to_string(), views);
    }

    for reaction in &message.reactions {
        let key = match &reaction.kind {
            ReactionKind::Emoji(emoji) => emoji.clone(),
            ReactionKind::CustomEmoji(id) => format!("@custom_emoji_{id}"),
        };
        *data.entry(key).or_insert(0) += reaction.count;
    }

    if let Some(poll) = &message.poll {
        if poll.chosen_option.is_some() || poll.is_closed {
            for option in &poll.options {
                data.insert(format!("@option_{}", option.label), option.voter_count);
            }
        }
    }

    PostRow::from_data(
        message.id,
        message.chat.id,
        message.date,
        Utc::now(),
        &data,
        session_index,
        shard,
    )
}
