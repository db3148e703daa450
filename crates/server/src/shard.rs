//! Shard-local RPC surface consumed by the controller.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

use vox_common::VoxError;
use vox_engine::transport::{ChatMessage, ChatRef};
use vox_engine::Engine;
use vox_store::models::CommentRow;

use crate::types::{DiscoverRequest, MessageOut, PostText, UserOut};
use crate::ApiError;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/messages", post(get_messages))
        .route("/known_chats_count", get(known_chats_count))
        .route("/discover", post(discover))
        .route("/user_from_comment", get(user_from_comment))
        .route("/post", get(post_text))
        .with_state(engine)
}

pub async fn serve(engine: Arc<Engine>, addr: &str) -> anyhow::Result<()> {
    let app = router(engine);
    let listener = TcpListener::bind(addr).await?;
    info!("shard RPC listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthcheck() -> &'static str {
    "OK"
}

/// One run of comments sharing `(session_index, chat_id)`: a single batch
/// fetch on one session.
struct CommentRun {
    session_index: u32,
    chat_id: i64,
    message_ids: Vec<i64>,
    comments: Vec<CommentRow>,
}

fn comment_runs(sorted_comments: &[CommentRow]) -> Vec<CommentRun> {
    let mut runs: Vec<CommentRun> = Vec::new();

    for comment in sorted_comments {
        let same_run = runs.last().is_some_and(|run| {
            run.session_index == comment.session_index && run.chat_id == comment.chat_id
        });

        if !same_run {
            runs.push(CommentRun {
                session_index: comment.session_index,
                chat_id: comment.chat_id,
                message_ids: Vec::new(),
                comments: Vec::new(),
            });
        }

        let run = runs.last_mut().unwrap();
        run.message_ids.push(comment.message_id);
        run.comments.push(comment.clone());
    }

    runs
}

/// Strict equal-length zip of one fetched batch with its originating
/// comments; comments whose message is gone are dropped.
fn zip_fetched(
    run: &CommentRun,
    fetched: Vec<Option<ChatMessage>>,
) -> Result<Vec<(ChatMessage, CommentRow)>, VoxError> {
    if fetched.len() != run.comments.len() {
        return Err(VoxError::transport("message batch length mismatch"));
    }

    Ok(fetched
        .into_iter()
        .zip(run.comments.iter().cloned())
        .filter_map(|(message, comment)| message.map(|message| (message, comment)))
        .collect())
}

/// Groups the sorted comments, fetches the message batches in parallel and
/// zips each fetched message with its originating comment.
async fn get_messages(
    State(engine): State<Arc<Engine>>,
    Json(sorted_comments): Json<Vec<CommentRow>>,
) -> Result<Json<Vec<MessageOut>>, ApiError> {
    let runs = comment_runs(&sorted_comments);

    let fetches = runs.iter().map(|run| {
        engine
            .pool
            .get_messages(run.session_index as usize, run.chat_id, &run.message_ids)
    });
    let results = join_all(fetches).await;

    let mut out = Vec::new();
    for (run, fetched) in runs.iter().zip(results) {
        for (message, comment) in zip_fetched(run, fetched?)? {
            let chat = match engine.registry.get(comment.chat_id).await {
                Some(row) => row.name,
                None => message.chat.display_name(),
            };
            out.push(MessageOut {
                text: message.text,
                chat,
                comment,
            });
        }
    }

    Ok(Json(out))
}

async fn known_chats_count(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<usize>, ApiError> {
    Ok(Json(engine.known_chats_count().await?))
}

async fn discover(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<DiscoverRequest>,
) -> Result<(), ApiError> {
    engine
        .discover_chat(&request.join_string, request.ignore_protection)
        .await?;
    Ok(())
}

#[derive(Deserialize)]
struct UserFromCommentQuery {
    chat: String,
    message_id: i64,
}

/// Looks up the author of one message with any session (index 0).
async fn user_from_comment(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<UserFromCommentQuery>,
) -> Result<Json<UserOut>, ApiError> {
    let session = engine
        .pool
        .get(0)
        .ok_or_else(|| VoxError::transport("session pool is empty"))?;

    let chat_ref = ChatRef::parse(&query.chat);
    let chat_id = match chat_ref {
        ChatRef::Id(id) => id,
        ChatRef::Handle(_) => session.resolve_chat(&chat_ref).await?.info.id,
    };

    let message = session
        .fetch_message(chat_id, query.message_id)
        .await?
        .ok_or_else(|| VoxError::not_found("message"))?;
    let author = message.author.ok_or_else(|| VoxError::not_found("user"))?;

    Ok(Json(UserOut {
        user_id: author.id,
        username: author.username.clone().unwrap_or_default(),
        name: author.full_name(),
    }))
}

#[derive(Deserialize)]
struct PostQuery {
    channel_id: i64,
    post_id: i64,
    session_index: u32,
}

async fn post_text(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<PostQuery>,
) -> Result<Json<PostText>, ApiError> {
    let session = engine
        .pool
        .get(query.session_index as usize)
        .ok_or_else(|| VoxError::bad_request(format!("unknown session {}", query.session_index)))?;

    let message = session
        .fetch_message(query.channel_id, query.post_id)
        .await?
        .ok_or_else(|| VoxError::not_found("post"))?;

    Ok(Json(PostText { text: message.text }))
}
