use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use vox_common::{Config, Mode, Result, VoxError};
use vox_store::models::{
    BrokenSessionRow, ChatRow, ChatUpdateRow, CommentRangeRow, CommentRow, DiscoveredChatRow,
    LogRow, NewPostRow, PendingDiscoveryRow, PostRow, SessionRow, UserRow,
};
use vox_store::Store;

use crate::backfill::{HistoryTask, Task, TaskEntry};
use crate::engine::Engine;
use crate::pool::SessionPool;
use crate::posts::PostTracker;
use crate::session::SessionClient;
use crate::transport::memory::{MemoryConnector, MemoryNetwork};
use crate::transport::{
    Author, ChatInfo, ChatKind, ChatMessage, ChatRef, Poll, PollOption, Reaction, ReactionKind,
};

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    sessions: StdMutex<Vec<SessionRow>>,
    broken: StdMutex<Vec<BrokenSessionRow>>,
    chats: StdMutex<Vec<ChatRow>>,
    comments: StdMutex<Vec<CommentRow>>,
    users: StdMutex<Vec<UserRow>>,
    discovered: StdMutex<Vec<DiscoveredChatRow>>,
    posts: StdMutex<Vec<PostRow>>,
    new_posts: StdMutex<Vec<NewPostRow>>,
    ranges: StdMutex<Vec<CommentRangeRow>>,
    fail_inserts: AtomicBool,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seed_sessions(&self, ids: &[i64], shard: u32) {
        let mut sessions = self.sessions.lock().unwrap();
        for &id in ids {
            sessions.push(SessionRow {
                id,
                shard,
                name: format!("session-{id}"),
                session_string: String::new(),
            });
        }
    }

    fn seed_broken(&self, ids: &[i64]) {
        let mut broken = self.broken.lock().unwrap();
        broken.extend(ids.iter().map(|&id| BrokenSessionRow { id }));
    }

    fn seed_chat(&self, row: ChatRow) {
        self.chats.lock().unwrap().push(row);
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            Err(VoxError::store("insert rejected"))
        } else {
            Ok(())
        }
    }

    fn comments(&self) -> Vec<CommentRow> {
        self.comments.lock().unwrap().clone()
    }

    fn users(&self) -> Vec<UserRow> {
        self.users.lock().unwrap().clone()
    }

    fn discovered(&self) -> Vec<DiscoveredChatRow> {
        self.discovered.lock().unwrap().clone()
    }

    fn posts(&self) -> Vec<PostRow> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_sessions(&self, _table: &str, shard: u32) -> Result<Vec<SessionRow>> {
        let mut rows: Vec<SessionRow> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.shard == shard)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn load_broken_sessions(&self) -> Result<Vec<BrokenSessionRow>> {
        Ok(self.broken.lock().unwrap().clone())
    }

    async fn mark_session_broken(&self, id: i64) -> Result<()> {
        self.broken.lock().unwrap().push(BrokenSessionRow { id });
        Ok(())
    }

    async fn load_chats(&self) -> Result<Vec<ChatRow>> {
        Ok(self.chats.lock().unwrap().clone())
    }

    async fn insert_chats(&self, rows: &[ChatRow]) -> Result<()> {
        self.check_failure()?;
        self.chats.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn latest_chat_update(&self, _shard: u32) -> Result<Option<ChatUpdateRow>> {
        Ok(None)
    }

    async fn chat_by_id(&self, chat_id: i64) -> Result<Option<ChatRow>> {
        Ok(self
            .chats
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == chat_id)
            .cloned())
    }

    async fn chat_by_join_string(&self, join_string: &str) -> Result<Option<ChatRow>> {
        Ok(self
            .chats
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.join_string == join_string)
            .cloned())
    }

    async fn search_chats(
        &self,
        _name: Option<&str>,
        _join_string: Option<&str>,
    ) -> Result<Vec<ChatRow>> {
        Ok(Vec::new())
    }

    async fn insert_comments(&self, rows: &[CommentRow]) -> Result<()> {
        self.check_failure()?;
        self.comments.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn insert_users(&self, rows: &[UserRow]) -> Result<()> {
        self.check_failure()?;
        self.users.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn insert_discovered_chats(&self, rows: &[DiscoveredChatRow]) -> Result<()> {
        self.check_failure()?;
        self.discovered.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn insert_posts(&self, rows: &[PostRow]) -> Result<()> {
        self.check_failure()?;
        self.posts.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn users_by_ids(&self, user_ids: &[i64]) -> Result<Vec<UserRow>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|row| user_ids.contains(&row.user_id))
            .cloned()
            .collect())
    }

    async fn users_by_username_prefix(&self, _prefix: &str, _limit: u64) -> Result<Vec<UserRow>> {
        Ok(Vec::new())
    }

    async fn comments_by_user(
        &self,
        user_id: i64,
        _offset: u64,
        _fetch: u64,
    ) -> Result<Vec<CommentRow>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn comment_count(&self, user_id: i64) -> Result<u64> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.user_id == user_id)
            .count() as u64)
    }

    async fn comment_range(&self, chat_id: i64) -> Result<Option<CommentRangeRow>> {
        Ok(self
            .ranges
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.chat_id == chat_id)
            .cloned())
    }

    async fn reactions(&self, channel_id: i64, post_id: i64) -> Result<Vec<PostRow>> {
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.channel_id == channel_id && row.id == post_id)
            .cloned()
            .collect())
    }

    async fn post_head(&self, channel_id: i64, post_id: i64) -> Result<Option<PostRow>> {
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.channel_id == channel_id && row.id == post_id)
            .cloned())
    }

    async fn latest_post_point(&self, post_id: i64) -> Result<Option<PostRow>> {
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.id == post_id)
            .max_by_key(|row| row.point_date)
            .cloned())
    }

    async fn recent_posts(&self, shard: u32) -> Result<Vec<NewPostRow>> {
        Ok(self
            .new_posts
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.shard == shard)
            .cloned()
            .collect())
    }

    async fn discovered_count(&self) -> Result<u64> {
        Ok(self.discovered.lock().unwrap().len() as u64)
    }

    async fn pending_discovery(&self, _offset: u64) -> Result<Option<PendingDiscoveryRow>> {
        Ok(None)
    }

    async fn insert_logs(&self, _rows: &[LogRow]) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        mode: Mode::Prod,
        clickhouse_host: "localhost".to_string(),
        clickhouse_port: 9440,
        clickhouse_password: String::new(),
        shard: 0,
        shard_host: "127.0.0.1".to_string(),
        shard_port: 8001,
        shard_endpoints: Vec::new(),
        controller_host: "127.0.0.1".to_string(),
        controller_port: 8002,
        active_sessions: 3,
        max_chats_per_session: 200,
        min_chat_members: 300,
        min_channel_members: 5000,
        auto_discover: false,
        read_only: false,
        poll_auto_vote: false,
    })
}

fn group(id: i64, title: &str) -> ChatInfo {
    ChatInfo {
        id,
        title: title.to_string(),
        username: None,
        invite_link: None,
        kind: ChatKind::Chat,
        members_count: 1000,
        linked_chat: None,
    }
}

fn channel(id: i64, title: &str, username: Option<&str>, members: i64) -> ChatInfo {
    ChatInfo {
        id,
        title: title.to_string(),
        username: username.map(str::to_string),
        invite_link: None,
        kind: ChatKind::Channel,
        members_count: members,
        linked_chat: None,
    }
}

fn chat_row(id: i64, shard: u32, session_index: u32, kind: &str) -> ChatRow {
    ChatRow {
        id,
        name: format!("chat-{id}"),
        join_string: String::new(),
        shard,
        session_index,
        added: Utc::now(),
        kind: kind.to_string(),
    }
}

fn author(user_id: i64) -> Author {
    Author {
        id: user_id,
        username: Some("someuser".to_string()),
        first_name: Some("John".to_string()),
        last_name: Some("Doe".to_string()),
        is_bot: false,
    }
}

fn message(chat: &ChatInfo, id: i64, user_id: i64) -> ChatMessage {
    ChatMessage {
        id,
        chat: chat.clone(),
        date: Utc::now(),
        author: Some(author(user_id)),
        sender_chat: None,
        forward_from_chat: None,
        forward_from_message_id: None,
        reply_to_top_message_id: None,
        text: format!("message {id}"),
        views: None,
        reactions: Vec::new(),
        poll: None,
    }
}

async fn bootstrap(
    store: &Arc<MemoryStore>,
    network: &Arc<MemoryNetwork>,
    config: Arc<Config>,
) -> Arc<Engine> {
    let connector = MemoryConnector::new(Arc::clone(network));
    Engine::bootstrap(config, store.clone() as Arc<dyn Store>, &connector)
        .await
        .expect("engine bootstrap")
}

// ---------------------------------------------------------------------------
// Session fleet
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bootstrap_skips_broken_sessions() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3, 4], 0);
    store.seed_broken(&[2]);

    let network = MemoryNetwork::new();
    let engine = bootstrap(&store, &network, test_config()).await;

    let ids: Vec<i64> = engine.pool.sessions().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 3, 4]);
}

#[tokio::test]
async fn bootstrap_fails_when_fleet_is_short() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2], 0);
    store.seed_broken(&[2]);

    let network = MemoryNetwork::new();
    let connector = MemoryConnector::new(Arc::clone(&network));
    let result = Engine::bootstrap(test_config(), store as Arc<dyn Store>, &connector).await;

    assert!(matches!(result, Err(VoxError::Startup(_))));
}

#[tokio::test]
async fn join_respects_session_cap() {
    let mut config = (*test_config()).clone();
    config.max_chats_per_session = 1;
    let config = Arc::new(config);

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "First"));
    network.add_chat(group(200, "Second"));
    network.add_member(1, 100);

    let (transport, _feed) = network.connect_session(1);
    let row = SessionRow {
        id: 1,
        shard: 0,
        name: "session-1".to_string(),
        session_string: String::new(),
    };
    let session = SessionClient::new(0, &row, transport, &config);

    let result = session.join(&ChatRef::Id(200)).await;
    assert!(matches!(result, Err(VoxError::MaxChatsExceeded)));
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconciliation_swaps_wrongly_held_chat() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 1, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Swapped"));
    // Session index 0 (id 1) holds the chat; index 1 (id 2) should.
    network.add_member(1, 100);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine
        .registry
        .run_once(&engine.router)
        .await
        .expect("reconciliation pass");

    assert_eq!(network.members_of(100), vec![2]);
}

#[tokio::test]
async fn reconciliation_enforces_ownership_uniqueness() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 0, "CHAT"));
    store.seed_chat(chat_row(200, 0, 1, "CHAT"));
    store.seed_chat(chat_row(300, 0, 2, "CHANNEL"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "A"));
    network.add_chat(group(200, "B"));
    network.add_chat(channel(300, "C", None, 10_000));
    // Scattered wrong memberships: 100 held by everyone but its owner,
    // 200 held by nobody, 300 held by the wrong session.
    network.add_member(2, 100);
    network.add_member(3, 100);
    network.add_member(2, 300);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine
        .registry
        .run_once(&engine.router)
        .await
        .expect("reconciliation pass");

    assert_eq!(network.members_of(100), vec![1]);
    assert_eq!(network.members_of(200), vec![2]);
    assert_eq!(network.members_of(300), vec![3]);
}

// ---------------------------------------------------------------------------
// Message routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn group_message_emits_comment_and_user() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 1, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Group"));
    network.add_member(2, 100);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();

    let session = engine.pool.get(1).unwrap().clone();
    let msg = message(&group(100, "Group"), 7, 42);
    engine
        .router
        .process_message(&session, &msg)
        .await
        .expect("routed message");

    engine.batcher.flush().await.expect("flush");

    assert_eq!(
        store.comments(),
        vec![CommentRow {
            user_id: 42,
            date: msg.date,
            chat_id: 100,
            message_id: 7,
            channel_id: None,
            post_id: None,
            session_index: 1,
            shard: 0,
        }]
    );
    assert_eq!(
        store.users(),
        vec![UserRow {
            user_id: 42,
            username: "someuser".to_string(),
            name: "John Doe".to_string(),
        }]
    );
}

#[tokio::test]
async fn stale_delivery_is_dropped() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 1, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Group"));

    let engine = bootstrap(&store, &network, test_config()).await;
    // Session index 0 is not subscribed to chat 100.
    let session = engine.pool.get(0).unwrap().clone();
    let msg = message(&group(100, "Group"), 7, 42);
    engine.router.process_message(&session, &msg).await.unwrap();

    engine.batcher.flush().await.unwrap();
    assert!(store.comments().is_empty());
}

#[tokio::test]
async fn anonymous_and_bot_senders_are_skipped() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 0, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Group"));
    network.add_member(1, 100);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let mut anonymous = message(&group(100, "Group"), 8, 42);
    anonymous.author = None;
    engine
        .router
        .process_message(&session, &anonymous)
        .await
        .unwrap();

    let mut from_bot = message(&group(100, "Group"), 9, 43);
    from_bot.author.as_mut().unwrap().is_bot = true;
    engine
        .router
        .process_message(&session, &from_bot)
        .await
        .unwrap();

    engine.batcher.flush().await.unwrap();
    assert!(store.comments().is_empty());
}

#[tokio::test]
async fn reply_to_linked_post_is_attributed() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 0, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Discussion"));
    network.add_member(1, 100);

    // Top message 5: channel broadcast mirrored into the discussion chat.
    let mut top = message(&group(100, "Discussion"), 5, 1);
    top.author = None;
    top.sender_chat = Some(channel(-100999, "News", None, 50_000));
    top.forward_from_message_id = Some(11);
    network.seed_history(vec![top]);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let mut reply = message(&group(100, "Discussion"), 8, 42);
    reply.reply_to_top_message_id = Some(5);
    engine.router.process_message(&session, &reply).await.unwrap();

    engine.batcher.flush().await.unwrap();
    let comments = store.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].channel_id, Some(-100999));
    assert_eq!(comments[0].post_id, Some(11));
}

#[tokio::test]
async fn forward_from_large_public_channel_is_discovered() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 0, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Group"));
    network.add_member(1, 100);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let mut forwarded = message(&group(100, "Group"), 7, 42);
    forwarded.forward_from_chat = Some(channel(-200, "Z", Some("z_channel"), 10_000));
    engine
        .router
        .process_message(&session, &forwarded)
        .await
        .unwrap();

    // Below the channel threshold: no discovery record.
    let mut small = message(&group(100, "Group"), 8, 42);
    small.forward_from_chat = Some(channel(-201, "Tiny", Some("tiny"), 4_000));
    engine.router.process_message(&session, &small).await.unwrap();

    engine.batcher.flush().await.unwrap();
    let discovered = store.discovered();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].id, -200);
    assert_eq!(discovered[0].join_string, "z_channel");
    assert_eq!(discovered[0].subscribers_count, 10_000);
    assert_eq!(discovered[0].sign, 1);
}

#[tokio::test]
async fn channel_post_becomes_reaction_snapshot() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(-500, 0, 0, "CHANNEL"));

    let network = MemoryNetwork::new();
    let chan = channel(-500, "Broadcast", None, 100_000);
    network.add_chat(chan.clone());
    network.add_member(1, -500);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let mut post = message(&chan, 11, 1);
    post.author = None;
    post.views = Some(100);
    post.reactions = vec![
        Reaction {
            kind: ReactionKind::Emoji("👍".to_string()),
            count: 7,
        },
        Reaction {
            kind: ReactionKind::CustomEmoji(5),
            count: 3,
        },
    ];
    post.poll = Some(Poll {
        is_anonymous: true,
        is_closed: true,
        chosen_option: None,
        options: vec![
            PollOption {
                label: "yes".to_string(),
                voter_count: 3,
            },
            PollOption {
                label: "no".to_string(),
                voter_count: 2,
            },
        ],
    });
    engine.router.process_message(&session, &post).await.unwrap();

    // Posts older than a week are not snapshotted.
    let mut old = message(&chan, 12, 1);
    old.author = None;
    old.date = Utc::now() - ChronoDuration::days(8);
    engine.router.process_message(&session, &old).await.unwrap();

    engine.batcher.flush().await.unwrap();

    let posts = store.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].id, 11);
    assert_eq!(posts[0].channel_id, -500);

    let expected: BTreeMap<String, i64> = [
        ("@views".to_string(), 100),
        ("👍".to_string(), 7),
        ("@custom_emoji_5".to_string(), 3),
        ("@option_yes".to_string(), 3),
        ("@option_no".to_string(), 2),
    ]
    .into_iter()
    .collect();
    assert_eq!(posts[0].data(), expected);

    // No comment for channel posts.
    assert!(store.comments().is_empty());
}

#[tokio::test]
async fn anonymous_open_polls_are_voted_when_enabled() {
    let mut config = (*test_config()).clone();
    config.poll_auto_vote = true;
    let config = Arc::new(config);

    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(-500, 0, 0, "CHANNEL"));

    let network = MemoryNetwork::new();
    let chan = channel(-500, "Broadcast", None, 100_000);
    network.add_chat(chan.clone());
    network.add_member(1, -500);

    let engine = bootstrap(&store, &network, config).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let mut post = message(&chan, 20, 1);
    post.author = None;
    post.poll = Some(Poll {
        is_anonymous: true,
        is_closed: false,
        chosen_option: None,
        options: vec![
            PollOption {
                label: "yes".to_string(),
                voter_count: 0,
            },
            PollOption {
                label: "no".to_string(),
                voter_count: 0,
            },
        ],
    });
    engine.router.process_message(&session, &post).await.unwrap();

    assert_eq!(network.votes(), vec![(1, -500, 20, 0)]);

    // An open poll with no settled counts contributes no @option_ keys.
    engine.batcher.flush().await.unwrap();
    let posts = store.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].data().keys().all(|key| !key.starts_with("@option_")));
}

// ---------------------------------------------------------------------------
// Discover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_discover_joins_once() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);

    let network = MemoryNetwork::new();
    let mut room = group(700, "Room");
    room.username = Some("room".to_string());
    network.add_chat(room);

    let engine = bootstrap(&store, &network, test_config()).await;

    let (first, second) = tokio::join!(
        engine.discover_chat("room", false),
        engine.discover_chat("room", false)
    );

    let already_joined = |outcome: &Result<()>| {
        matches!(outcome, Err(VoxError::AlreadyJoined))
    };
    assert!(
        already_joined(&first) ^ already_joined(&second),
        "exactly one call must hit the TTL cache"
    );
    assert_eq!(network.join_count(), 1);
}

#[tokio::test]
async fn discover_reservation_expires_with_ttl() {
    let config = test_config();
    let network = MemoryNetwork::new();
    let (transport, feed) = network.connect_session(1);
    let row = SessionRow {
        id: 1,
        shard: 0,
        name: "session-1".to_string(),
        session_string: String::new(),
    };
    let session = Arc::new(SessionClient::new(0, &row, transport, &config));
    let pool = SessionPool::assemble(
        vec![session],
        vec![(0, feed)],
        Duration::from_millis(100),
    );

    pool.reserve_discover("room").await.expect("first entry");
    assert!(matches!(
        pool.reserve_discover("room").await,
        Err(VoxError::AlreadyJoined)
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.reserve_discover("room").await.expect("after expiry");
}

#[tokio::test]
async fn discover_skips_small_chats() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);

    let network = MemoryNetwork::new();
    let mut small = group(800, "Small");
    small.username = Some("small".to_string());
    small.members_count = 10;
    network.add_chat(small);

    let engine = bootstrap(&store, &network, test_config()).await;

    engine.discover_chat("small", false).await.expect("skipped");
    assert_eq!(network.join_count(), 0);

    // ignore_protection bypasses the member threshold; the reservation for
    // "small" is still live, so go through a fresh handle.
    engine
        .registry
        .discover(
            &engine.router,
            &engine.pool.pick_session().await.unwrap(),
            &ChatRef::Handle("small".to_string()),
            true,
            false,
            true,
        )
        .await
        .expect("forced discover");
    assert_eq!(network.join_count(), 1);
}

#[tokio::test]
async fn discover_waits_for_join_approval() {
    let config = test_config();
    let network = MemoryNetwork::new();
    let mut club = group(900, "Club");
    club.username = Some("club".to_string());
    network.add_chat_with_approval(club);

    let (transport, _feed) = network.connect_session(1);
    let row = SessionRow {
        id: 1,
        shard: 0,
        name: "session-1".to_string(),
        session_string: String::new(),
    };
    let session = Arc::new(SessionClient::new(0, &row, transport, &config));

    let discovering = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .discover(&ChatRef::Handle("club".to_string()), false)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    network.approve_join(900);
    session.resolve_invite("Club", 900).await;

    let info = discovering
        .await
        .unwrap()
        .expect("discover result")
        .expect("joined chat");
    assert_eq!(info.id, 900);
    assert_eq!(network.members_of(900), vec![1]);
}

// ---------------------------------------------------------------------------
// Batcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_pushes_flush_exactly_once() {
    let store = MemoryStore::new();
    let batcher = Arc::new(crate::batcher::IngestBatcher::new(
        store.clone() as Arc<dyn Store>
    ));

    let mut handles = Vec::new();
    for task in 0..10 {
        let batcher = Arc::clone(&batcher);
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let user_id = task * 10 + i;
                batcher
                    .push_comment(
                        CommentRow {
                            user_id,
                            date: Utc::now(),
                            chat_id: 100,
                            message_id: user_id,
                            channel_id: None,
                            post_id: None,
                            session_index: 0,
                            shard: 0,
                        },
                        UserRow {
                            user_id,
                            username: String::new(),
                            name: String::new(),
                        },
                    )
                    .await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let flushed = batcher.flush().await.expect("flush");
    assert_eq!(flushed, 200); // 100 comments + 100 users
    assert_eq!(store.comments().len(), 100);
    assert_eq!(store.users().len(), 100);

    // Nothing left behind.
    assert_eq!(batcher.flush().await.expect("empty flush"), 0);
}

#[tokio::test]
async fn failed_flush_drops_the_batch() {
    let store = MemoryStore::new();
    store.fail_inserts.store(true, Ordering::SeqCst);
    let batcher = crate::batcher::IngestBatcher::new(store.clone() as Arc<dyn Store>);

    batcher
        .push_comment(
            CommentRow {
                user_id: 1,
                date: Utc::now(),
                chat_id: 100,
                message_id: 1,
                channel_id: None,
                post_id: None,
                session_index: 0,
                shard: 0,
            },
            UserRow {
                user_id: 1,
                username: String::new(),
                name: String::new(),
            },
        )
        .await;

    assert!(batcher.flush().await.is_err());
    assert!(store.comments().is_empty());

    // The failed batch was cleared out of the buffers, not re-queued.
    store.fail_inserts.store(false, Ordering::SeqCst);
    assert_eq!(batcher.flush().await.expect("empty flush"), 0);
}

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_walk_terminates_in_expected_steps() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 0, "CHAT"));

    let network = MemoryNetwork::new();
    let room = group(100, "Archive");
    network.add_chat(room.clone());
    network.add_member(1, 100);
    network.seed_history((1..=100).map(|id| message(&room, id, id)).collect());

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let mut task =
        HistoryTask::new(Arc::clone(&engine.router), session, 100, 100, 0).with_page_limit(25);

    let mut steps = 0;
    while !task.finished() {
        task.step().await.expect("history step");
        steps += 1;
        assert!(steps <= 20, "walk must terminate");
    }

    // ceil((start - end) / limit) pages.
    assert_eq!(steps, 4);
    // The offset bound is exclusive, so message 100 itself is not refetched.
    assert_eq!(task.count(), 99);

    engine.batcher.flush().await.unwrap();
    assert_eq!(store.comments().len(), 99);
}

#[tokio::test]
async fn history_task_fails_after_retry_budget() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);
    store.seed_chat(chat_row(100, 0, 0, "CHAT"));

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Flaky"));
    network.add_member(1, 100);
    network.set_fail_history(true);

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.registry.run_once(&engine.router).await.unwrap();
    let session = engine.pool.get(0).unwrap().clone();

    let task = HistoryTask::new(Arc::clone(&engine.router), session, 100, 100, 0);
    let mut entry = TaskEntry::new(Box::new(task));

    for _ in 0..crate::backfill::MAX_RETRIES {
        assert!(!entry.done());
        entry.drive().await;
    }

    assert!(entry.failed());
    assert!(entry.done());
}

#[tokio::test]
async fn duplicate_task_identities_are_rejected() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);

    let network = MemoryNetwork::new();
    network.add_chat(group(100, "Dup"));

    let engine = bootstrap(&store, &network, test_config()).await;
    let session = engine.pool.get(0).unwrap().clone();

    engine.tasks.add_task(Box::new(HistoryTask::new(
        Arc::clone(&engine.router),
        Arc::clone(&session),
        100,
        50,
        0,
    )));
    engine.tasks.add_task(Box::new(HistoryTask::new(
        Arc::clone(&engine.router),
        session,
        100,
        50,
        0,
    )));

    assert_eq!(engine.tasks.live_count(), 1);
}

// ---------------------------------------------------------------------------
// Post tracker
// ---------------------------------------------------------------------------

#[test]
fn resample_interval_decays_with_age() {
    let interval = PostTracker::resample_interval;
    assert_eq!(interval(ChronoDuration::minutes(30)).num_seconds(), 60);
    assert_eq!(interval(ChronoDuration::hours(2)).num_seconds(), 120);
    assert_eq!(interval(ChronoDuration::hours(12)).num_seconds(), 600);
    assert_eq!(interval(ChronoDuration::days(2)).num_seconds(), 3600);
}

#[tokio::test]
async fn due_posts_are_resampled_and_deleted_posts_suppressed() {
    let store = MemoryStore::new();
    store.seed_sessions(&[1, 2, 3], 0);

    let network = MemoryNetwork::new();
    let chan = channel(-500, "Broadcast", None, 100_000);
    network.add_chat(chan.clone());

    let mut live_post = message(&chan, 10, 1);
    live_post.author = None;
    live_post.views = Some(555);
    live_post.date = Utc::now() - ChronoDuration::hours(2);
    network.seed_history(vec![live_post]);

    let stale_point = Utc::now() - ChronoDuration::minutes(10);
    for post_id in [10, 11] {
        store.posts.lock().unwrap().push(PostRow::from_data(
            post_id,
            -500,
            Utc::now() - ChronoDuration::hours(2),
            stale_point,
            &BTreeMap::new(),
            0,
            0,
        ));
        store.new_posts.lock().unwrap().push(NewPostRow {
            id: post_id,
            channel_id: -500,
            post_date: Utc::now() - ChronoDuration::hours(2),
            session_index: 0,
            shard: 0,
        });
    }

    let engine = bootstrap(&store, &network, test_config()).await;
    engine.posts.run_once().await.expect("tracker pass");
    engine.batcher.flush().await.unwrap();

    // Post 10 got a fresh snapshot; deleted post 11 only bumped its watermark.
    let fresh: Vec<PostRow> = store
        .posts()
        .into_iter()
        .filter(|row| row.point_date > stale_point)
        .collect();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].id, 10);
    assert_eq!(fresh[0].data().get("@views"), Some(&555));

    // Second pass right away: nothing is due any more.
    engine.posts.run_once().await.expect("second pass");
    engine.batcher.flush().await.unwrap();
    let newer: Vec<PostRow> = store
        .posts()
        .into_iter()
        .filter(|row| row.point_date > stale_point)
        .collect();
    assert_eq!(newer.len(), 1);
}
