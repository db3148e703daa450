//! Parsing of public message and post URLs (`https://t.me/...`).

use url::Url;

use vox_common::{Result, VoxError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Id(i64),
    Handle(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMsgUrl {
    pub chat: ChatTarget,
    pub message_id: i64,
}

/// Accepts `https://t.me/<chat>/<msg_id>` and
/// `https://t.me/<chat>/<top>/<msg>?comment=<id>`. The chat part is numeric
/// for private-channel (`/c/...`) links and a handle otherwise.
pub fn parse_msg_url(raw: &str) -> Result<ParsedMsgUrl> {
    let (chat_raw, msg_raw) = split_url(raw)?;

    let message_id = msg_raw
        .parse()
        .map_err(|_| VoxError::bad_request(format!("invalid message id {msg_raw:?}")))?;

    let chat = match chat_raw.parse::<i64>() {
        Ok(id) => ChatTarget::Id(id),
        Err(_) => ChatTarget::Handle(chat_raw),
    };

    Ok(ParsedMsgUrl { chat, message_id })
}

/// `https://t.me/<channel_nick>/<post_id>` for reaction readback.
pub fn parse_post_url(raw: &str) -> Result<(String, i64)> {
    let (nick, post_raw) = split_url(raw)?;
    let post_id = post_raw
        .parse()
        .map_err(|_| VoxError::bad_request(format!("invalid post id {post_raw:?}")))?;
    Ok((nick, post_id))
}

/// Validates scheme and host and returns the last two path segments; a
/// `comment` query parameter overrides the message segment.
fn split_url(raw: &str) -> Result<(String, String)> {
    let url = Url::parse(raw)
        .map_err(|err| VoxError::bad_request(format!("invalid url {raw:?}: {err}")))?;

    if url.host_str() != Some("t.me") {
        return Err(VoxError::bad_request(format!(
            "invalid url {raw:?}: host must be t.me"
        )));
    }

    let segments: Vec<&str> = url
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() < 2 {
        return Err(VoxError::bad_request(format!(
            "invalid url {raw:?}: expected /<chat>/<message>"
        )));
    }

    let chat = segments[segments.len() - 2].to_string();
    let mut msg = segments[segments.len() - 1].to_string();

    if let Some((_, comment)) = url.query_pairs().find(|(key, _)| key == "comment") {
        msg = comment.into_owned();
    }

    Ok((chat, msg))
}

/// Maps a bare channel id from a `t.me/c/...` link onto the network-wide
/// negative peer id.
pub fn channel_peer_id(raw: i64) -> i64 {
    -(1_000_000_000_000 + raw)
}
