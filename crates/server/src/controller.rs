//! Controller service: query fan-out across shards and the web-UI API.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::try_join_all;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use vox_common::{Config, Result, VoxError};
use vox_store::models::{ChatRow, CommentRow, PostRow, UserRow};
use vox_store::Store;

use crate::msg_url::{channel_peer_id, parse_msg_url, parse_post_url, ChatTarget};
use crate::shard_client::ShardFleet;
use crate::types::{CommentCount, DiscoverRequest, MessageOut, PostText, UserInfo};
use crate::ApiError;

const DEFAULT_USERS_LIMIT: u64 = 10;
const DEFAULT_COMMENTS_FETCH: u64 = 10;

#[derive(Clone)]
pub struct ControllerState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub shards: Arc<ShardFleet>,
}

pub fn router(state: ControllerState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/user", get(get_user))
        .route("/users", get(get_users))
        .route("/user_by_msg_url", get(get_user_by_msg_url))
        .route("/users_and_chats", get(get_users_and_chats))
        .route("/comments", get(get_comments))
        .route("/messages", post(get_messages))
        .route("/messages_by_user_id", get(get_messages_by_user_id))
        .route("/discover", post(discover))
        .route("/chat", get(get_chat))
        .route("/chats", get(get_chats))
        .route("/reactions", get(get_reactions))
        .route("/reactions_by_url", get(get_reactions_by_url))
        .route("/post", get(get_post))
        .route("/comment_count", get(get_comment_count))
        .route("/remove_bot", post(remove_bot))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(state: ControllerState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("controller listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthcheck() -> &'static str {
    "OK"
}

/// Collapses raw `users` rows into one record per user id, first-seen order,
/// unique usernames and names preserved in observation order.
fn users_to_infos(rows: &[UserRow]) -> Vec<UserInfo> {
    let mut infos: Vec<UserInfo> = Vec::new();

    for row in rows {
        let info = match infos.iter_mut().find(|info| info.user_id == row.user_id) {
            Some(info) => info,
            None => {
                infos.push(UserInfo {
                    user_id: row.user_id,
                    usernames: Vec::new(),
                    names: Vec::new(),
                });
                infos.last_mut().unwrap()
            }
        };

        if !info.usernames.contains(&row.username) {
            info.usernames.push(row.username.clone());
        }
        if !info.names.contains(&row.name) {
            info.names.push(row.name.clone());
        }
    }

    infos
}

async fn user_info_by_id(state: &ControllerState, user_id: i64) -> Result<UserInfo> {
    let rows = state.store.users_by_ids(&[user_id]).await?;
    users_to_infos(&rows)
        .into_iter()
        .next()
        .ok_or_else(|| VoxError::not_found("user"))
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn get_user(
    State(state): State<ControllerState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserInfo>, ApiError> {
    Ok(Json(user_info_by_id(&state, query.user_id).await?))
}

#[derive(Deserialize)]
struct UsersQuery {
    username: String,
    limit: Option<u64>,
}

async fn get_users(
    State(state): State<ControllerState>,
    Query(query): Query<UsersQuery>,
) -> Result<Json<Vec<UserInfo>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_USERS_LIMIT);
    Ok(Json(users_by_prefix(&state, &query.username, limit).await?))
}

async fn users_by_prefix(
    state: &ControllerState,
    username: &str,
    limit: u64,
) -> Result<Vec<UserInfo>> {
    let matches = state
        .store
        .users_by_username_prefix(username, limit)
        .await?;

    let mut user_ids: Vec<i64> = Vec::new();
    for row in &matches {
        if !user_ids.contains(&row.user_id) {
            user_ids.push(row.user_id);
        }
    }
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = state.store.users_by_ids(&user_ids).await?;
    Ok(users_to_infos(&rows))
}

#[derive(Deserialize)]
struct UserByMsgUrlQuery {
    msg_url: String,
}

/// Resolves a public message URL to the author's aggregated identity: the
/// owning shard fetches the message, the store enriches the result.
async fn get_user_by_msg_url(
    State(state): State<ControllerState>,
    Query(query): Query<UserByMsgUrlQuery>,
) -> Result<Json<UserInfo>, ApiError> {
    Ok(Json(user_by_msg_url(&state, &query.msg_url).await?))
}

async fn user_by_msg_url(state: &ControllerState, msg_url: &str) -> Result<UserInfo> {
    let parsed = parse_msg_url(msg_url)?;
    debug!("parsed message url: {parsed:?}");

    let (shard, chat_param) = match &parsed.chat {
        ChatTarget::Id(raw) => {
            let peer_id = channel_peer_id(*raw);
            let chat = state
                .store
                .chat_by_id(peer_id)
                .await?
                .ok_or_else(|| VoxError::not_found("chat"))?;
            (chat.shard, peer_id.to_string())
        }
        // Public chats can be resolved by any session on any shard.
        ChatTarget::Handle(handle) => (0, handle.clone()),
    };

    let user = state
        .shards
        .get(shard)?
        .user_from_comment(&chat_param, parsed.message_id)
        .await?;

    match user_info_by_id(state, user.user_id).await {
        Ok(info) => Ok(info),
        Err(VoxError::NotFound(_)) => Ok(UserInfo {
            user_id: user.user_id,
            usernames: vec![user.username],
            names: vec![user.name],
        }),
        Err(err) => Err(err),
    }
}

#[derive(Deserialize)]
struct CombinedQuery {
    query: String,
}

#[derive(serde::Serialize)]
struct UsersAndChats {
    users: Vec<UserInfo>,
    chats: Vec<ChatRow>,
}

/// Combined lookup for the search box: tries every user and chat
/// interpretation of the query and pools whatever succeeds.
async fn get_users_and_chats(
    State(state): State<ControllerState>,
    Query(query): Query<CombinedQuery>,
) -> Result<Json<UsersAndChats>, ApiError> {
    let raw = query.query.trim();

    let mut users: Vec<UserInfo> = Vec::new();
    if let Ok(user_id) = raw.parse::<i64>() {
        if let Ok(info) = user_info_by_id(&state, user_id).await {
            users.push(info);
        }
    }
    if let Ok(matches) = users_by_prefix(&state, raw, DEFAULT_USERS_LIMIT).await {
        for info in matches {
            if !users.iter().any(|known| known.user_id == info.user_id) {
                users.push(info);
            }
        }
    }
    if let Ok(info) = user_by_msg_url(&state, raw).await {
        if !users.iter().any(|known| known.user_id == info.user_id) {
            users.push(info);
        }
    }

    let mut chats: Vec<ChatRow> = Vec::new();
    if let Ok(chat_id) = raw.parse::<i64>() {
        if let Ok(Some(chat)) = state.store.chat_by_id(chat_id).await {
            chats.push(chat);
        }
    }
    if let Ok(matches) = state.store.search_chats(Some(raw), Some(raw)).await {
        for chat in matches {
            if !chats.iter().any(|known| known.id == chat.id) {
                chats.push(chat);
            }
        }
    }

    Ok(Json(UsersAndChats { users, chats }))
}

#[derive(Deserialize)]
struct CommentsQuery {
    user_id: i64,
    offset: Option<u64>,
    fetch: Option<u64>,
}

async fn get_comments(
    State(state): State<ControllerState>,
    Query(query): Query<CommentsQuery>,
) -> Result<Json<Vec<CommentRow>>, ApiError> {
    let fetch = query.fetch.unwrap_or(DEFAULT_COMMENTS_FETCH);
    let offset = query.offset.unwrap_or(0) * fetch;
    Ok(Json(
        state
            .store
            .comments_by_user(query.user_id, offset, fetch)
            .await?,
    ))
}

/// Fans the comment batch out by shard and merges the fetched messages back
/// into one date-ordered list.
async fn get_messages(
    State(state): State<ControllerState>,
    Json(comments): Json<Vec<CommentRow>>,
) -> Result<Json<Vec<MessageOut>>, ApiError> {
    let messages = fetch_messages(&state, comments).await?;
    if messages.is_empty() {
        return Err(VoxError::not_found("messages").into());
    }
    Ok(Json(messages))
}

async fn fetch_messages(
    state: &ControllerState,
    mut comments: Vec<CommentRow>,
) -> Result<Vec<MessageOut>> {
    if comments.is_empty() {
        return Ok(Vec::new());
    }

    comments.sort_by_key(|comment| (comment.batch_key(), comment.message_id));

    let mut groups: Vec<(u32, Vec<CommentRow>)> = Vec::new();
    for comment in comments {
        match groups.last_mut() {
            Some((shard, group)) if *shard == comment.shard => group.push(comment),
            _ => groups.push((comment.shard, vec![comment])),
        }
    }

    let fetches = groups
        .iter()
        .map(|(shard, group)| async { state.shards.get(*shard)?.get_messages(group).await });
    let mut messages: Vec<MessageOut> = try_join_all(fetches).await?.into_iter().flatten().collect();

    messages.sort_by_key(|message| message.comment.date);
    Ok(messages)
}

#[derive(Deserialize)]
struct MessagesByUserQuery {
    user_id: i64,
    limit: Option<u64>,
}

async fn get_messages_by_user_id(
    State(state): State<ControllerState>,
    Query(query): Query<MessagesByUserQuery>,
) -> Result<Json<Vec<MessageOut>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_COMMENTS_FETCH);
    let comments = state.store.comments_by_user(query.user_id, 0, limit).await?;
    Ok(Json(fetch_messages(&state, comments).await?))
}

async fn discover(
    State(state): State<ControllerState>,
    Json(request): Json<DiscoverRequest>,
) -> Result<(), ApiError> {
    state
        .shards
        .discover_least_loaded(&request.join_string, request.ignore_protection)
        .await?;
    Ok(())
}

#[derive(Deserialize)]
struct ChatQuery {
    chat_id: i64,
}

async fn get_chat(
    State(state): State<ControllerState>,
    Query(query): Query<ChatQuery>,
) -> Result<Json<ChatRow>, ApiError> {
    let chat = state
        .store
        .chat_by_id(query.chat_id)
        .await?
        .ok_or_else(|| VoxError::not_found("chat"))?;
    Ok(Json(chat))
}

#[derive(Deserialize)]
struct ChatsQuery {
    name: Option<String>,
    join_string: Option<String>,
}

async fn get_chats(
    State(state): State<ControllerState>,
    Query(query): Query<ChatsQuery>,
) -> Result<Json<Vec<ChatRow>>, ApiError> {
    if query.name.is_none() && query.join_string.is_none() {
        return Err(VoxError::bad_request("either name or join_string must be provided").into());
    }

    Ok(Json(
        state
            .store
            .search_chats(query.name.as_deref(), query.join_string.as_deref())
            .await?,
    ))
}

#[derive(Deserialize)]
struct ReactionsQuery {
    channel_id: i64,
    post_id: i64,
}

async fn get_reactions(
    State(state): State<ControllerState>,
    Query(query): Query<ReactionsQuery>,
) -> Result<Json<Vec<PostRow>>, ApiError> {
    Ok(Json(
        state.store.reactions(query.channel_id, query.post_id).await?,
    ))
}

#[derive(Deserialize)]
struct ReactionsByUrlQuery {
    post_url: String,
}

async fn get_reactions_by_url(
    State(state): State<ControllerState>,
    Query(query): Query<ReactionsByUrlQuery>,
) -> Result<Json<Vec<PostRow>>, ApiError> {
    let (channel_nick, post_id) = parse_post_url(&query.post_url)?;
    let chat = state
        .store
        .chat_by_join_string(&channel_nick)
        .await?
        .ok_or_else(|| VoxError::not_found("channel"))?;

    Ok(Json(state.store.reactions(chat.id, post_id).await?))
}

#[derive(Deserialize)]
struct PostQuery {
    channel_id: i64,
    post_id: i64,
}

/// Live post text: the latest snapshot names the owning shard and session.
async fn get_post(
    State(state): State<ControllerState>,
    Query(query): Query<PostQuery>,
) -> Result<Json<PostText>, ApiError> {
    let head = state
        .store
        .post_head(query.channel_id, query.post_id)
        .await?
        .ok_or_else(|| VoxError::not_found("post"))?;

    let text = state
        .shards
        .get(head.shard)?
        .post_text(head.channel_id, head.id, head.session_index)
        .await?;
    Ok(Json(text))
}

#[derive(Deserialize)]
struct CommentCountQuery {
    user_id: i64,
}

async fn get_comment_count(
    State(state): State<ControllerState>,
    Query(query): Query<CommentCountQuery>,
) -> Result<Json<CommentCount>, ApiError> {
    Ok(Json(CommentCount {
        comment_count: state.store.comment_count(query.user_id).await?,
    }))
}

#[derive(Deserialize)]
struct RemoveBotQuery {
    bot_id: i64,
}

async fn remove_bot(
    State(state): State<ControllerState>,
    Query(query): Query<RemoveBotQuery>,
) -> Result<(), ApiError> {
    state.store.mark_session_broken(query.bot_id).await?;
    Ok(())
}
